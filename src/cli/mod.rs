pub mod args;

pub use args::{Args, Command, parse_kind_spec};
