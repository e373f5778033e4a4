//! Fixed set of OS threads for synchronous work.

use crate::errors::Error;
use crossbeam::channel::{unbounded, Sender};
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    thread,
};
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking closures (file loads, room hooks, handler code that is not
/// async-aware) off the async workers.
///
/// The calling task suspends on a one-shot channel until its job is done.
/// A panicking job becomes [`Error::Internal`]; the thread survives.
/// Threads exit once the pool is dropped and the queue has drained.
pub(crate) struct WorkerPool {
    sender: Sender<Job>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();

        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("wicket-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                });

            if let Err(e) = spawned {
                tracing::error!(error = %e, "Failed to spawn worker thread");
            }
        }

        Self { sender }
    }

    pub(crate) async fn run<F, T>(&self, job: F) -> Result<T, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(catch_unwind(AssertUnwindSafe(job)));
        });

        self.sender
            .send(job)
            .map_err(|_| Error::internal("worker pool is gone"))?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(Error::Internal(panic_message(panic.as_ref()))),
            Err(_) => Err(Error::internal("worker dropped the job")),
        }
    }
}

/// Text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    match (payload.downcast_ref::<&str>(), payload.downcast_ref::<String>()) {
        (Some(text), _) => format!("panic: {text}"),
        (None, Some(text)) => format!("panic: {text}"),
        (None, None) => "panic".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn runs_jobs() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.run(move || counter.fetch_add(1, Ordering::SeqCst)).await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.run(|| 2 + 2).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let pool = WorkerPool::new(1);

        match pool.run(|| panic!("boom")).await {
            Err(Error::Internal(text)) => assert_eq!(text, "panic: boom"),
            other => panic!("unexpected {other:?}"),
        }

        // The single thread is still alive.
        assert_eq!(pool.run(|| "alive").await.unwrap(), "alive");
    }
}
