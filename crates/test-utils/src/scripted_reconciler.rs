//! A reconciler whose behaviour is scripted per resource, recording every
//! call so tests can assert on ordering.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::Notify;

use resctl::engine::ReconcileContext;
use resctl::reconciler::{ReconcileResult, Reconciler, ReconcilerRegistry};
use resctl::types::{BoxFuture, ResourceName};

pub type CustomStep =
    Arc<dyn Fn(ReconcileContext, ResourceName) -> BoxFuture<'static, ReconcileResult> + Send + Sync>;

/// What one `reconcile` call does. Resources without a script succeed.
#[derive(Clone)]
pub enum Step {
    Succeed,
    Fail(String),
    /// Block until cancelled, then return a cancelled result.
    WaitForCancel,
    /// Block until the notify fires (succeed) or the call is cancelled.
    Gate(Arc<Notify>),
    /// Succeed and ask to run again after the delay.
    Retrigger(Duration),
    Panic,
    /// Sleep, then succeed even if cancelled meanwhile.
    SleepIgnoringCancel(Duration),
    Custom(CustomStep),
}

impl Step {
    pub fn custom<F, Fut>(f: F) -> Self
    where
        F: Fn(ReconcileContext, ResourceName) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ReconcileResult> + Send + 'static,
    {
        Step::Custom(Arc::new(move |ctx, name| Box::pin(f(ctx, name))))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Succeed => "Succeed",
            Step::Fail(_) => "Fail",
            Step::WaitForCancel => "WaitForCancel",
            Step::Gate(_) => "Gate",
            Step::Retrigger(_) => "Retrigger",
            Step::Panic => "Panic",
            Step::SleepIgnoringCancel(_) => "SleepIgnoringCancel",
            Step::Custom(_) => "Custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Started {
        deleted: bool,
        renamed_from: Option<ResourceName>,
    },
    Finished {
        ok: bool,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub name: ResourceName,
    pub event: LogEvent,
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<ResourceName, VecDeque<Step>>>,
    log: Mutex<Vec<LogEntry>>,
    closes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct ScriptedReconciler {
    inner: Arc<Inner>,
}

impl ScriptedReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with this reconciler registered for `kind`.
    pub fn registry(&self, kind: &str) -> ReconcilerRegistry {
        let mut registry = ReconcilerRegistry::new();
        registry
            .register_instance(kind, Arc::new(self.clone()))
            .expect("fresh registry");
        registry
    }

    /// Queue steps for the next calls on `name`.
    pub fn script(&self, name: &ResourceName, steps: impl IntoIterator<Item = Step>) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_default()
            .extend(steps);
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.inner.log.lock().unwrap().clone()
    }

    /// Names in the order their calls started.
    pub fn started(&self) -> Vec<ResourceName> {
        self.log()
            .into_iter()
            .filter(|e| matches!(e.event, LogEvent::Started { .. }))
            .map(|e| e.name)
            .collect()
    }

    /// Start events of `name`.
    pub fn starts_of(&self, name: &ResourceName) -> Vec<LogEvent> {
        self.log()
            .into_iter()
            .filter(|e| &e.name == name && matches!(e.event, LogEvent::Started { .. }))
            .map(|e| e.event)
            .collect()
    }

    pub fn start_count(&self, name: &ResourceName) -> usize {
        self.starts_of(name).len()
    }

    pub fn finish_count(&self, name: &ResourceName) -> usize {
        self.log()
            .iter()
            .filter(|e| &e.name == name && matches!(e.event, LogEvent::Finished { .. }))
            .count()
    }

    /// Index in the log of the `nth` event of `name` matching `started`.
    pub fn position(&self, name: &ResourceName, started: bool, nth: usize) -> Option<usize> {
        self.log()
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                &e.name == name && matches!(e.event, LogEvent::Started { .. }) == started
            })
            .map(|(i, _)| i)
            .nth(nth)
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    fn push(&self, name: &ResourceName, event: LogEvent) {
        self.inner.log.lock().unwrap().push(LogEntry {
            name: name.clone(),
            event,
        });
    }

    fn next_step(&self, name: &ResourceName) -> Step {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed)
    }
}

async fn run_step(step: Step, ctx: ReconcileContext, name: ResourceName) -> ReconcileResult {
    match step {
        Step::Succeed => ReconcileResult::ok(),
        Step::Fail(msg) => ReconcileResult::failed(anyhow!(msg)),
        Step::WaitForCancel => {
            ctx.cancelled().await;
            ReconcileResult::cancelled()
        }
        Step::Gate(gate) => {
            tokio::select! {
                _ = gate.notified() => ReconcileResult::ok(),
                _ = ctx.cancelled() => ReconcileResult::cancelled(),
            }
        }
        Step::Retrigger(after) => {
            let at = chrono::Utc::now()
                + chrono::Duration::from_std(after).expect("small retrigger delay");
            ReconcileResult::retrigger_at(at)
        }
        Step::Panic => panic!("scripted panic in {name}"),
        Step::SleepIgnoringCancel(d) => {
            tokio::time::sleep(d).await;
            ReconcileResult::ok()
        }
        Step::Custom(f) => f(ctx, name).await,
    }
}

impl Reconciler for ScriptedReconciler {
    fn reconcile(&self, ctx: ReconcileContext, name: ResourceName) -> BoxFuture<'_, ReconcileResult> {
        Box::pin(async move {
            let (deleted, renamed_from) = match ctx.get(&name).await {
                Ok(r) => (r.is_deleted(), r.meta.renamed_from.clone()),
                Err(_) => (false, None),
            };
            self.push(
                &name,
                LogEvent::Started {
                    deleted,
                    renamed_from,
                },
            );

            let step = self.next_step(&name);
            let result = run_step(step, ctx, name.clone()).await;

            self.push(
                &name,
                LogEvent::Finished {
                    ok: result.err.is_none(),
                    cancelled: result.is_cancelled(),
                },
            );
            result
        })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}
