// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kubemirror")]
#[command(author, version, about = "Mirror Kubernetes cluster resources locally via list + watch")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Kubernetes context to mirror (defaults to the last used, then the
    /// kubeconfig current context)
    #[arg(short, long, value_name = "CONTEXT")]
    pub context: Option<String>,

    /// List page size per resource kind
    #[arg(long, value_name = "N")]
    pub page_size: Option<u32>,

    /// Extra kind to mirror, as KIND or KIND.GROUP. Repeatable.
    /// Examples: -k Pod, -k Deployment.apps, -k Certificate.cert-manager.io
    #[arg(short = 'k', long = "kind", value_name = "KIND[.GROUP]")]
    pub kinds: Vec<String>,

    /// Print a summary after the initial sync and exit
    #[arg(long)]
    pub once: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List contexts available in the kubeconfig
    Contexts,

    /// Connect and print every kind the cluster serves
    Kinds,
}

/// Split a KIND[.GROUP] spec. Kind names never contain dots, so everything
/// after the first dot is the group.
pub fn parse_kind_spec(spec: &str) -> (String, String) {
    match spec.split_once('.') {
        Some((kind, group)) => (kind.to_string(), group.to_string()),
        None => (spec.to_string(), String::new()),
    }
}
