// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

mod cli;
pub mod config;
mod gateway;
pub mod progress;
mod sync;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

use cli::{Args, Command, parse_kind_spec};
use gateway::{KubeGateway, ResourceGateway};
use progress::{ProgressUpdate, create_progress_handle, create_spinner};
use sync::{ClusterSession, SubscriptionRegistry};

/// Initialize logging with file output and optional stderr
fn init_logging(verbose: bool, to_stderr: bool) {
    use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
    use tracing_subscriber::fmt::format::FmtSpan;

    // Create log directory
    let log_dir = config::base_dir()
        .map(|p| p.join("log"))
        .unwrap_or_else(|_| std::path::PathBuf::from("."));

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create log directory: {}", e);
        return;
    }

    // File appender with size-based rotation:
    // - Max 10MB per file
    // - Keep up to 5 files (total max ~50MB)
    // - Also rotate daily
    let log_path = log_dir.join("kubemirror.log");
    let condition = RollingConditionBase::new()
        .daily()
        .max_size(10 * 1024 * 1024); // 10MB

    let file_appender = match RollingFileAppenderBase::new(log_path, condition, 5) {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Warning: Could not create log file: {}", e);
            return;
        }
    };

    // Use non-blocking writer for better performance
    let (non_blocking, _guard) = file_appender.get_non_blocking_appender();
    // Leak the guard to keep the background writer alive
    std::mem::forget(_guard);

    let filter = if verbose {
        "kubemirror=debug"
    } else {
        "kubemirror=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    // File layer (always enabled)
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_span_events(FmtSpan::NONE);

    if to_stderr && verbose {
        // Both file and stderr output
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::NONE);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .init();
    } else {
        // File only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (aws-lc-rs)
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(args.verbose, args.verbose);

    match &args.command {
        Some(Command::Contexts) => {
            for context in KubeGateway::list_contexts()? {
                println!("{context}");
            }
            Ok(())
        }
        Some(Command::Kinds) => run_kinds(&args).await,
        None => run_mirror(&args).await,
    }
}

/// Connect and print every kind the cluster serves.
async fn run_kinds(args: &Args) -> Result<()> {
    let config = config::Config::load().unwrap_or_default();
    let context = args.context.clone().or(config.last_context);

    let gateway = KubeGateway::from_kubeconfig(context.as_deref()).await?;
    let kinds = gateway.discover_kinds().await?;
    let registry = sync::KindRegistry::new(kinds);

    for descriptor in registry.list() {
        let scope = if descriptor.namespaced {
            "namespaced"
        } else {
            "cluster"
        };
        let watch = if descriptor.watchable { "" } else { "  (no watch)" };
        println!(
            "{:<50} {:<12} {}{}",
            format!("{}.{}", descriptor.kind, descriptor.api_version()),
            scope,
            descriptor.plural,
            watch
        );
    }
    Ok(())
}

/// Connect, mirror, and follow until interrupted.
async fn run_mirror(args: &Args) -> Result<()> {
    let mut config = config::Config::load().unwrap_or_default();
    let context = args.context.clone().or(config.last_context.clone());
    let page_size = args.page_size.unwrap_or(config.page_size);

    let gateway = Arc::new(KubeGateway::from_kubeconfig(context.as_deref()).await?);
    let cluster = gateway.context().to_string();

    let subscriptions = Arc::new(SubscriptionRegistry::new());
    let progress = create_progress_handle();
    let session = Arc::new(ClusterSession::new(
        page_size,
        Arc::clone(&subscriptions),
        Arc::clone(&progress),
    ));

    // Spinner tracks connect progress until the session is ready
    let spinner = create_spinner("Connecting to Kubernetes...");
    let mut progress_rx = progress.subscribe();

    let connect_result = {
        let session = Arc::clone(&session);
        let gateway = Arc::clone(&gateway) as Arc<dyn ResourceGateway>;
        let cluster = cluster.clone();
        let mut connect_handle = Box::pin(async move { session.connect(&cluster, gateway).await });

        loop {
            tokio::select! {
                biased;
                update = progress_rx.recv() => {
                    match update {
                        Ok(ProgressUpdate::Connecting { cluster }) => {
                            spinner.set_message(format!("Connecting to {}...", cluster));
                        }
                        Ok(ProgressUpdate::CatalogLoaded { cluster, kind_count, .. }) => {
                            spinner.set_message(format!(
                                "{}: {} kinds discovered",
                                cluster, kind_count
                            ));
                        }
                        Ok(ProgressUpdate::ReflectorStarted { kind, items, .. }) => {
                            spinner.set_message(format!("Syncing {} ({} objects)...", kind, items));
                        }
                        _ => {}
                    }
                }
                result = &mut connect_handle => {
                    break result;
                }
            }
        }
    };

    spinner.finish_and_clear();
    connect_result?;

    if let Err(e) = config.set_last_context(&cluster) {
        eprintln!("Warning: Could not save config: {}", e);
    }

    // Mount any extra kinds the user asked for
    for spec in &args.kinds {
        let (kind, group) = parse_kind_spec(spec);
        match session.track(&kind, &group).await {
            Ok(Some(_)) => {}
            Ok(None) => eprintln!("Kind '{}' is not served by this cluster; skipping", spec),
            Err(e) => eprintln!("Could not mirror '{}': {}", spec, e),
        }
    }

    print_summary(&session);

    if args.once {
        session.disconnect().await;
        return Ok(());
    }

    println!("\nFollowing changes; ctrl-c to exit.");
    let mut updates = session.progress().subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => print_summary(&session),
            update = updates.recv() => {
                match update {
                    Ok(ProgressUpdate::ReflectorStarted { kind, group, items }) => {
                        println!("+ {} ({} objects)", kind_label(&kind, &group), items);
                    }
                    Ok(ProgressUpdate::ReflectorFailed { kind, group, error }) => {
                        eprintln!("! {} stale: {}", kind_label(&kind, &group), error);
                    }
                    Ok(ProgressUpdate::KindDropped { kind, group }) => {
                        println!("- {} dropped from catalog", kind_label(&kind, &group));
                    }
                    _ => {}
                }
            }
        }
    }

    session.disconnect().await;
    println!("Disconnected from {}", cluster);
    Ok(())
}

fn kind_label(kind: &str, group: &str) -> String {
    if group.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}.{group}")
    }
}

fn print_summary(session: &ClusterSession) {
    let Ok(tracked) = session.tracked_kinds() else {
        return;
    };
    let cluster = session.cluster().unwrap_or_default();
    let served = session.kind_registry().map(|r| r.len()).unwrap_or(0);
    println!(
        "\n{}: mirroring {} of {} served kinds",
        cluster,
        tracked.len(),
        served
    );
    for (kind, group) in tracked {
        let Ok(Some(snapshot)) = session.resources(&kind, &group) else {
            continue;
        };
        let more = matches!(
            session.reflector(&kind, &group),
            Ok(Some(r)) if r.has_more()
        );
        println!(
            "  {:<50} {:>6} objects{}",
            kind_label(&kind, &group),
            snapshot.len(),
            if more { " (more pages)" } else { "" }
        );
    }
}
