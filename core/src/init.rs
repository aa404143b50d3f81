//! Ordered initialization tasks and the readiness signal they drive.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::watch;
use tracing::{debug, error};

use crate::{Result, WeftError};

pub type InitTask = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Failed(String),
}

/// Write side of a readiness signal.
pub struct ReadySignal {
    tx: watch::Sender<ReadyState>,
}

/// Resolves once the owning endpoint (or module) has finished initializing.
#[derive(Clone)]
pub struct Ready {
    rx: watch::Receiver<ReadyState>,
}

pub fn readiness() -> (ReadySignal, Ready) {
    let (tx, rx) = watch::channel(ReadyState::Pending);
    (ReadySignal { tx }, Ready { rx })
}

impl ReadySignal {
    pub fn mark_ready(&self) {
        self.tx.send_replace(ReadyState::Ready);
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.tx.send_replace(ReadyState::Failed(reason.into()));
    }
}

impl Ready {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow() == ReadyState::Ready
    }

    /// Waits until ready; errors if initialization failed or was abandoned.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|state| *state != ReadyState::Pending)
            .await
            .map_err(|_| WeftError::Init("initialization abandoned".into()))?
            .clone();
        match state {
            ReadyState::Failed(reason) => Err(WeftError::Init(reason)),
            _ => Ok(()),
        }
    }
}

/// Tasks run one after another, in insertion order.
///
/// # Examples
///
/// ```
/// use weft_core::init::{readiness, InitTasks};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> weft_core::Result<()> {
/// let (signal, ready) = readiness();
/// let mut tasks = InitTasks::new();
/// tasks.push("first", async { Ok(()) });
/// tasks.run(&signal).await?;
/// ready.wait().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct InitTasks {
    tasks: Vec<(String, InitTask)>,
}

impl InitTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push((name.into(), Box::pin(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs every task; the first failure stops the sequence and fails `signal`.
    pub async fn run(self, signal: &ReadySignal) -> Result<()> {
        for (name, task) in self.tasks {
            debug!(target: "endpoint", task = %name, "Running init task");
            if let Err(e) = task.await {
                error!(target: "endpoint", task = %name, error = %e, "Init task failed");
                signal.mark_failed(format!("{name}: {e}"));
                return Err(e);
            }
        }
        signal.mark_ready();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn tasks_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = InitTasks::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            tasks.push(format!("t{i}"), async move {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        let (signal, ready) = readiness();
        tasks.run(&signal).await.unwrap();
        assert!(ready.is_ready());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn failure_stops_sequence_and_fails_ready() {
        let ran = Arc::new(Mutex::new(false));
        let mut tasks = InitTasks::new();
        tasks.push("bad", async { Err(WeftError::Channel("nope".into())) });
        let flag = Arc::clone(&ran);
        tasks.push("after", async move {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        let (signal, ready) = readiness();
        assert!(tasks.run(&signal).await.is_err());
        assert!(!*ran.lock().unwrap());
        assert!(matches!(ready.wait().await, Err(WeftError::Init(_))));
    }
}
