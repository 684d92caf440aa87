use std::{
    sync::{Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ClientError, ErrorCategory};

/// One named OS thread driving a current-thread runtime.
pub struct DedicatedScheduler {
    name: String,
    handle: Handle,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DedicatedScheduler {
    pub fn start(name: impl Into<String>) -> Result<Self, ClientError> {
        let name = name.into();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name(name.clone())
            .build()
            .map_err(|err| scheduler_error(&name, err))?;
        let handle = runtime.handle().clone();
        let stop = CancellationToken::new();
        let stop_thread = stop.clone();
        let thread_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(stop_thread.cancelled());
                debug!(scheduler = %thread_name, "scheduler stopped");
            })
            .map_err(|err| scheduler_error(&name, err))?;

        debug!(scheduler = %name, "scheduler started");
        Ok(Self {
            name,
            handle,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop the runtime, dropping its pending tasks, and join the thread.
    /// Safe to call repeatedly and from the scheduler's own tasks.
    pub fn shutdown(&self) {
        self.stop.cancel();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(thread) = thread else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!(scheduler = %self.name, "scheduler thread panicked");
        }
    }
}

impl Drop for DedicatedScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_error(name: &str, err: std::io::Error) -> ClientError {
    ClientError::new(
        ErrorCategory::Internal,
        "scheduler_unavailable",
        format!("failed to start scheduler '{name}': {err}"),
    )
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn runs_tasks_on_named_thread_until_shutdown() {
        let scheduler = DedicatedScheduler::start("ditto-test-scheduler").expect("scheduler starts");
        let (tx, rx) = oneshot::channel();
        scheduler.handle().spawn(async move {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        });

        let name = rx.blocking_recv().expect("task should run");
        assert_eq!(name.as_deref(), Some("ditto-test-scheduler"));

        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
    }
}
