//! Worker pool orchestration for `EnrichmentPipeline`.
//!
//! Owns worker creation, panic capture, and the runaway-error fan-in that
//! turns a dead worker into a pipeline-wide shutdown.

use crate::runtime::fatal::FatalErrorHandler;
use futures::FutureExt;
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::Worker;
use super::shared::WorkerShared;

pub(crate) struct WorkerPool {
    worker_count: usize,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            workers: Vec::new(),
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub(crate) fn handles(&self) -> &Vec<JoinHandle<()>> {
        &self.workers
    }

    /// Spawns the full pool. A worker that returns an error or panics trips
    /// the fatal handler and cancels both tokens so the rest of the run
    /// unwinds promptly.
    pub(crate) fn launch(
        &mut self,
        shared: WorkerShared,
        run_token: CancellationToken,
        root_shutdown: CancellationToken,
        fatal_handler: Arc<FatalErrorHandler>,
    ) {
        self.workers.clear();

        for worker_id in 0..self.worker_count {
            let worker = Worker::new(worker_id, run_token.clone(), shared.clone());
            let worker_shutdown = run_token.clone();
            let root_shutdown = root_shutdown.clone();
            let fatal_handler = fatal_handler.clone();

            let handle = tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(
                            worker = worker_id,
                            error = %err,
                            "worker task exited with error"
                        );
                        let context = format!("worker {worker_id} exited with error");
                        let err = err.context(context.clone());
                        fatal_handler.trigger(context.as_str(), err);
                        worker_shutdown.cancel();
                        root_shutdown.cancel();
                    }
                    Err(panic_payload) => {
                        let panic_msg = panic_message(panic_payload.as_ref());
                        tracing::error!(
                            worker = worker_id,
                            panic = %panic_msg,
                            "worker task panicked"
                        );
                        let context = format!("worker {worker_id} panicked");
                        let panic_error =
                            anyhow::anyhow!("worker {worker_id} panicked: {panic_msg}");
                        fatal_handler.trigger(context.as_str(), panic_error);
                        worker_shutdown.cancel();
                        root_shutdown.cancel();
                    }
                }
            });

            self.workers.push(handle);
        }
    }

    pub(crate) fn take_handles(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.workers)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
