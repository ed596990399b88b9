// src/engine/runtime.rs

use std::any::Any;
use std::pin::Pin;
use std::sync::PoisonError;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, Sleep, interval_at, sleep, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::engine::completion::Completion;
use crate::engine::context::ReconcileContext;
use crate::engine::controller::Controller;
use crate::engine::scheduler::Launch;
use crate::errors::{ControllerError, Result};
use crate::reconciler::ReconcileResult;

/// Async shell around [`ControllerState`](crate::engine::ControllerState).
///
/// Waits on the queue, completions, the timeline, the flush interval and
/// catalog events, and performs the IO the state asks for: spawning
/// reconcilers and writing the catalog.
struct EventLoop {
    controller: Controller,
    completed_rx: mpsc::Receiver<Completion>,
    timeline_sleep: Pin<Box<Sleep>>,
    timeline_next: Option<DateTime<Utc>>,
}

impl Controller {
    /// Run the event loop until `shutdown` is cancelled, then shut down:
    /// cancel running reconcilers and wait for them, close the reconcilers
    /// and flush the catalog.
    ///
    /// Can only be called once per controller.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::AlreadyRunning);
        }
        let completed_rx = self
            .shared
            .completed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ControllerError::Internal("completion receiver missing".into()))?;

        if let Err(e) = self.shared.store.check_leader().await {
            error!(error = %e, "controller failed to start");
            *self
                .shared
                .init_err
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
            self.shared.closed.cancel();
            return Err(e);
        }

        {
            let mut state = self.shared.state.write().await;
            let names = state.catalog.names();
            info!(resources = names.len(), "controller starting");
            for name in names.iter() {
                state.enqueue(name);
            }
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.ready.cancel();

        let mut event_loop = EventLoop::new(self.clone(), completed_rx);
        let loop_res = event_loop.run(&shutdown).await;
        self.shutdown(&mut event_loop.completed_rx, loop_res).await
    }

    async fn shutdown(
        &self,
        completed_rx: &mut mpsc::Receiver<Completion>,
        loop_res: Result<()>,
    ) -> Result<()> {
        let cfg = self.config().clone();
        let state = self.state_lock();
        let mut errors = Vec::new();

        if let Err(e) = loop_res {
            error!(error = %e, "controller event loop failed");
            errors.push(ControllerError::LoopFailed(Box::new(e)));
        }

        info!("controller shutting down");

        // Cancel and wait for every running invocation.
        let deadline = Instant::now() + cfg.shutdown_timeout;
        let drained = timeout_at(deadline, async {
            {
                let mut s = state.write().await;
                for inv in s.invocations.values_mut() {
                    inv.cancel(false);
                }
            }
            loop {
                if state.read().await.invocations.is_empty() {
                    break;
                }
                let Some(completion) = completed_rx.recv().await else {
                    break;
                };
                let mut s = state.write().await;
                if let Err(e) = s.process_completed(completion) {
                    warn!(error = %e, "failed to process completion during shutdown");
                }
            }
        })
        .await;

        if drained.is_err() {
            let names: Vec<String> = state
                .try_read()
                .map(|s| s.running().iter().map(|n| n.to_string()).collect())
                .unwrap_or_default();
            errors.push(ControllerError::ShutdownTimeout(names));
        }

        let reconcilers: Vec<_> = self.reconcilers().drain().collect();
        for (kind, reconciler) in reconcilers {
            match timeout(cfg.shutdown_timeout, reconciler.close()).await {
                Ok(Ok(())) => debug!(kind = %kind, "closed reconciler"),
                Ok(Err(e)) => errors.push(ControllerError::Other(
                    e.context(format!("closing reconciler for kind {kind:?}")),
                )),
                Err(_) => errors.push(ControllerError::Internal(format!(
                    "timed out closing reconciler for kind {kind:?}"
                ))),
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);

        let flushed = timeout(cfg.flush_timeout, async {
            let mut s = state.write().await;
            s.fan_out_events();
            s.release_idle_waits();
            drop(s);
            self.flush_catalog().await
        })
        .await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(_) => errors.push(ControllerError::Internal(
                "timed out flushing catalog".to_string(),
            )),
        }

        self.shared.closed.cancel();

        match ControllerError::join(errors) {
            Some(e) => {
                error!(error = %e, "controller closed with error");
                Err(e)
            }
            None => {
                info!("controller closed");
                Ok(())
            }
        }
    }
}

impl EventLoop {
    fn new(controller: Controller, completed_rx: mpsc::Receiver<Completion>) -> Self {
        Self {
            controller,
            completed_rx,
            timeline_sleep: Box::pin(sleep(Duration::ZERO)),
            timeline_next: None,
        }
    }

    async fn run(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let shared = self.controller.shared.clone();
        let flush_every = shared.config.flush_interval;
        let mut flush = interval_at(Instant::now() + flush_every, flush_every);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("controller event loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("shutdown requested");
                    break;
                }
                _ = shared.queue_notify.notified() => {
                    self.on_queue_updated().await?;
                }
                Some(completion) = self.completed_rx.recv() => {
                    self.on_completed(completion).await?;
                }
                _ = &mut self.timeline_sleep, if self.timeline_next.is_some() => {
                    self.on_timeline().await;
                }
                _ = flush.tick() => {
                    self.controller.flush_catalog().await?;
                }
                _ = shared.events_notify.notified() => {
                    shared.state.write().await.fan_out_events();
                }
            }
        }

        Ok(())
    }

    async fn on_queue_updated(&mut self) -> Result<()> {
        let state = self.controller.state_lock();
        let (launches, next) = {
            let mut s = state.write().await;
            let launches = s.process_queue()?;
            s.check_idle_waits();
            (launches, s.timeline.next())
        };

        for launch in launches {
            self.spawn_invocation(launch);
        }
        self.reset_timeline(next);
        Ok(())
    }

    async fn on_completed(&mut self, completion: Completion) -> Result<()> {
        let state = self.controller.state_lock();
        let next = {
            let mut s = state.write().await;
            s.process_completed(completion)?;
            s.check_idle_waits();
            s.timeline.next()
        };
        self.reset_timeline(next);
        Ok(())
    }

    async fn on_timeline(&mut self) {
        let state = self.controller.state_lock();
        let next = {
            let mut s = state.write().await;
            let due = s.timeline.pop_due(Utc::now());
            for name in due.iter() {
                s.enqueue(name);
            }
            if !due.is_empty() {
                debug!(due = due.len(), "retriggering resources");
            }
            s.timeline.next()
        };
        // Force a re-arm even if the earliest entry did not change.
        self.timeline_next = None;
        self.reset_timeline(next);
    }

    /// Re-arm the timeline sleep for `next`, padded by the retrigger slack.
    fn reset_timeline(&mut self, next: Option<DateTime<Utc>>) {
        if next == self.timeline_next {
            return;
        }
        self.timeline_next = next;
        if let Some(at) = next {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                + self.controller.config().retrigger_slack;
            self.timeline_sleep.as_mut().reset(Instant::now() + delay);
        }
    }

    /// Run the reconciler for `launch` on its own task and report back on the
    /// completion channel, panics included.
    fn spawn_invocation(&self, launch: Launch) {
        let controller = self.controller.clone();
        let handle = launch.handle;

        tokio::spawn(async move {
            let name = handle.name().clone();
            let result = match controller.reconciler(&name.kind) {
                Ok(reconciler) => {
                    let ctx = ReconcileContext::new(controller.clone(), handle.clone());
                    let span = info_span!("reconcile", resource = %name, kind = %name.kind);
                    let target = name.clone();
                    let joined = tokio::spawn(
                        async move { reconciler.reconcile(ctx, target).await }.instrument(span),
                    )
                    .await;
                    match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => {
                            let msg = panic_message(e.into_panic());
                            error!(resource = %name, panic = %msg, "panic in reconciler");
                            ReconcileResult::failed(anyhow!("panic: {msg}"))
                        }
                        Err(e) => ReconcileResult::failed(anyhow!(e)),
                    }
                }
                Err(e) => ReconcileResult::failed(e),
            };

            if handle.release_lock() {
                warn!(resource = %name, "reconciler returned while holding the lock");
            }
            handle.token().cancel();

            let completion = Completion { handle, result };
            if controller.shared.completed_tx.send(completion).await.is_err() {
                debug!(resource = %name, "controller closed before completion was delivered");
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
