use std::any::Any;
use std::fmt;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rayon::ThreadPool;

enum Workers {
    Rayon(ThreadPool),
    Inline,
}

/// Fixed-size pool running background fast-tier copies.
pub struct TransferPool {
    workers: Workers,
}

impl TransferPool {
    /// Builds a pool of `threads` workers, shrinking (and ultimately running jobs inline)
    /// when the OS refuses to create threads.
    pub fn new(threads: usize) -> Self {
        let mut threads = threads.max(1);
        loop {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|idx| format!("strata-transfer-{idx}"))
                .build()
            {
                Ok(pool) => {
                    return Self {
                        workers: Workers::Rayon(pool),
                    }
                }
                Err(_) if threads > 1 => threads = (threads / 2).max(1),
                Err(err) => {
                    tracing::warn!(
                        target = "strata.cache",
                        error = %err,
                        "could not start transfer threads; copying inline"
                    );
                    return Self::inline();
                }
            }
        }
    }

    /// Runs every job on the submitting thread.
    pub fn inline() -> Self {
        Self {
            workers: Workers::Inline,
        }
    }

    pub fn threads(&self) -> usize {
        match &self.workers {
            Workers::Rayon(pool) => pool.current_num_threads(),
            Workers::Inline => 0,
        }
    }

    pub fn submit<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let job = move || match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            Ok(value) => {
                let _ = tx.send(value);
            }
            // Dropping `tx` unsent makes the handle report `Interrupted`.
            Err(panic) => tracing::error!(
                target = "strata.cache",
                panic = %panic_message(&*panic),
                "transfer task panicked"
            ),
        };
        match &self.workers {
            Workers::Rayon(pool) => pool.spawn(job),
            Workers::Inline => job(),
        }
        TaskHandle { rx }
    }
}

impl fmt::Debug for TransferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferPool")
            .field("threads", &self.threads())
            .finish()
    }
}

/// The task never produced a result: it panicked or its pool went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transfer task was interrupted")]
pub struct Interrupted;

/// Completion handle for a job submitted to a [`TransferPool`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the job finishes.
    pub fn join(self) -> Result<T, Interrupted> {
        self.rx.recv().map_err(|_| Interrupted)
    }

    /// `Ok(None)` if the job is still running after `timeout`.
    pub fn join_timeout(&self, timeout: std::time::Duration) -> Result<Option<T>, Interrupted> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Interrupted),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
