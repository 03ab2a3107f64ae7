//! Branch executor interface and per-attempt plumbing.
//!
//! An executor is invoked once per attempt. It pushes payloads through
//! [`ExecCtx::emit`] and resolves to `Ok(())` on success or a classified
//! [`BranchError`]. Each attempt runs in its own task feeding a bounded queue;
//! the runner pulls "next event or terminal result" from an [`AttemptHandle`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fanout_types::{BranchError, BranchId};

pub type ExecFut<'a> = Pin<Box<dyn Future<Output = Result<(), BranchError>> + Send + 'a>>;

/// One opaque unit of work.
///
/// Executors are re-invoked from scratch on every retry, so anything they do
/// must be safe to repeat.
pub trait BranchExecutor: Send + Sync {
    fn execute<'a>(&'a self, ctx: &'a ExecCtx) -> ExecFut<'a>;
}

/// Per-attempt invocation context handed to an executor.
pub struct ExecCtx {
    branch_id: BranchId,
    attempt: u32,
    shared: Arc<Value>,
    sink: mpsc::Sender<Value>,
}

impl ExecCtx {
    #[must_use]
    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    /// 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Context shared by every branch of the run.
    #[must_use]
    pub fn shared(&self) -> &Value {
        &self.shared
    }

    /// Emit one event. Waits while the branch's queue is full.
    pub async fn emit(&self, payload: Value) -> Result<(), BranchError> {
        self.sink
            .send(payload)
            .await
            .map_err(|_| BranchError::fatal("event sink closed"))
    }
}

impl fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecCtx")
            .field("branch_id", &self.branch_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// A branch: identity, where its result belongs, and the work itself.
#[derive(Clone)]
pub struct Branch {
    id: BranchId,
    output_key: String,
    executor: Arc<dyn BranchExecutor>,
}

impl Branch {
    pub fn new(
        id: impl Into<BranchId>,
        output_key: impl Into<String>,
        executor: Arc<dyn BranchExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            output_key: output_key.into(),
            executor,
        }
    }

    #[must_use]
    pub fn id(&self) -> &BranchId {
        &self.id
    }

    #[must_use]
    pub fn output_key(&self) -> &str {
        &self.output_key
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("output_key", &self.output_key)
            .finish_non_exhaustive()
    }
}

pub(crate) enum AttemptStep {
    Event(Value),
    Finished(Result<(), BranchError>),
}

/// A running attempt. Dropping the handle aborts the attempt's task.
pub(crate) struct AttemptHandle {
    events: mpsc::Receiver<Value>,
    task: JoinHandle<Result<(), BranchError>>,
}

impl AttemptHandle {
    pub(crate) fn spawn(branch: &Branch, attempt: u32, shared: Arc<Value>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        let executor = Arc::clone(&branch.executor);
        let ctx = ExecCtx {
            branch_id: branch.id.clone(),
            attempt,
            shared,
            sink: tx,
        };

        let task = tokio::spawn(async move {
            let exec_future = AssertUnwindSafe(executor.execute(&ctx)).catch_unwind();
            match exec_future.await {
                Ok(result) => result,
                Err(panic_payload) => Err(BranchError::fatal(format!(
                    "executor panicked: {}",
                    panic_payload_to_string(&*panic_payload)
                ))),
            }
        });

        Self { events: rx, task }
    }

    /// Next event, or the attempt's result once the queue is drained and closed.
    ///
    /// Must not be called again after it returned `Finished`.
    pub(crate) async fn next(&mut self) -> AttemptStep {
        if let Some(payload) = self.events.recv().await {
            return AttemptStep::Event(payload);
        }
        let result = match (&mut self.task).await {
            Ok(result) => result,
            Err(join_err) => Err(BranchError::fatal(format!(
                "executor task failed: {join_err}"
            ))),
        };
        AttemptStep::Finished(result)
    }

    /// Abandon the attempt and return whatever it had already queued.
    pub(crate) fn cancel(mut self) -> Vec<Value> {
        self.task.abort();
        self.events.close();
        let mut buffered = Vec::new();
        while let Ok(payload) = self.events.try_recv() {
            buffered.push(payload);
        }
        buffered
    }
}

impl Drop for AttemptHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
