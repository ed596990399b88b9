// src/lib.rs

pub mod catalog;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod reconciler;
pub mod types;

use std::sync::Arc;

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, JsonFileStore, MemoryCatalogStore};
use crate::cli::CliArgs;
use crate::config::{ProjectFile, load_and_validate};
use crate::engine::Controller;
use crate::reconciler::command::COMMAND_KIND;
use crate::reconciler::{CommandReconciler, Reconciler, ReconcilerRegistry};
use crate::types::{ResourceEvent, dedupe_refs};

/// High-level entry point used by `main.rs`.
///
/// Loads the project file, opens the controller on the configured store,
/// syncs the declared resources into the catalog and runs until Ctrl-C
/// (or until idle with `--once`).
pub async fn run(args: CliArgs) -> Result<()> {
    let project = load_and_validate(&args.config)?;

    if args.dry_run {
        print_dry_run(&project);
        return Ok(());
    }

    let mut registry = ReconcilerRegistry::new();
    registry.register(COMMAND_KIND, |_| {
        Arc::new(CommandReconciler::new()) as Arc<dyn Reconciler>
    })?;

    let store: Arc<dyn CatalogStore> = match project.store.path.as_ref() {
        Some(path) => {
            info!(path = %path.display(), "using JSON catalog store");
            Arc::new(JsonFileStore::new(path.clone()))
        }
        None => Arc::new(MemoryCatalogStore::new()),
    };

    let controller = Controller::open(project.controller.clone(), registry, store).await?;
    let shutdown = CancellationToken::new();

    let run_handle = {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { controller.run(shutdown).await })
    };

    controller.wait_until_ready().await?;
    sync_declared(&controller, &project).await?;

    {
        let controller = controller.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move {
            let res = controller
                .subscribe(token, |event, name, resource| match event {
                    ResourceEvent::Write => debug!(
                        resource = %name,
                        status = ?resource.map(|r| r.meta.reconcile_status),
                        "resource written"
                    ),
                    ResourceEvent::Delete => debug!(resource = %name, "resource removed"),
                })
                .await;
            if let Err(e) = res {
                debug!(error = %e, "event subscription ended");
            }
        });
    }

    let mut failed = Vec::new();
    if args.once {
        controller.wait_until_idle(true).await?;
        failed = controller
            .list(None)
            .await?
            .into_iter()
            .filter(|r| r.meta.reconcile_error.is_some())
            .map(|r| r.name().to_string())
            .collect();
        info!("all resources reconciled; stopping");
    } else {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C; stopping");
        }
        info!("stopping controller");
    }

    shutdown.cancel();
    run_handle.await??;

    if !failed.is_empty() {
        bail!("{} resource(s) failed to reconcile: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

/// Bring the catalog in line with the project file: create what is missing,
/// update what changed and delete `command` resources no longer declared.
pub async fn sync_declared(controller: &Controller, project: &ProjectFile) -> errors::Result<()> {
    let declared = project.declared();

    for d in declared.iter() {
        match controller.get(&d.name).await {
            Ok(current) => {
                if dedupe_refs(&current.meta.refs) != dedupe_refs(&d.refs) {
                    controller.update_meta(&d.name, d.meta()).await?;
                }
                if current.spec != d.spec {
                    controller.update_spec(&d.name, d.spec.clone()).await?;
                }
            }
            Err(e) if e.is_not_found() => {
                controller
                    .create(&d.name, d.meta(), d.hidden, d.spec.clone())
                    .await?;
            }
            Err(e) => return Err(e),
        }
    }

    for existing in controller.list(Some(COMMAND_KIND)).await? {
        if !declared.iter().any(|d| &d.name == existing.name()) {
            info!(resource = %existing.name(), "resource no longer declared; deleting");
            controller.delete(existing.name()).await?;
        }
    }

    Ok(())
}

/// Print the validated resources without running anything.
fn print_dry_run(project: &ProjectFile) {
    println!("resctl dry-run");
    println!(
        "  controller.flush_interval = {:?}",
        project.controller.flush_interval
    );
    println!(
        "  controller.retrigger_slack = {:?}",
        project.controller.retrigger_slack
    );
    match project.store.path.as_ref() {
        Some(path) => println!("  store.path = {}", path.display()),
        None => println!("  store = memory"),
    }
    println!();

    println!("resources ({}):", project.resources.len());
    for (name, r) in project.resources.iter() {
        println!("  - {name}");
        println!("      kind: {}", r.kind);
        println!("      cmd: {}", r.cmd);
        if !r.refs.is_empty() {
            println!("      refs: {:?}", r.refs);
        }
        if let Some(ms) = r.refresh_every_ms {
            println!("      refresh_every_ms: {ms}");
        }
        if r.hidden {
            println!("      hidden: true");
        }
    }

    debug!("dry-run complete (no execution)");
}
