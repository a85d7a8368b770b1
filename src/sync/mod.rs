//! The resource synchronization core: keyed caches, page reflectors, the
//! kind catalog, the dependent-kind cascade, and the session controller
//! that owns them for the lifetime of one cluster connection.

pub mod cascade;
pub mod kinds;
pub mod reflector;
pub mod session;
pub mod store;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod testgw;

pub use cascade::KindCascade;
pub use kinds::KindRegistry;
pub use reflector::{DEFAULT_PAGE_SIZE, LoadOutcome, PageReflector};
pub use session::{ClusterSession, SessionError, SessionState};
pub use store::KeyedStore;
pub use subscriptions::{SubscriptionId, SubscriptionRegistry};
