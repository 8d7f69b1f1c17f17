use crate::pipeline::engine::EnrichmentPipeline;
use crate::provider::adapter::ItemEnricher;
use crate::runtime::config::PipelineConfig;
use crate::store::CatalogStore;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the pipeline lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner {
    pipeline: EnrichmentPipeline,
    shutdown: CancellationToken,
    started: bool,
}

impl Runner {
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the entire pipeline (workers, lifecycle tasks, lease queue polling).
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn ItemEnricher>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let pipeline =
            EnrichmentPipeline::with_cancellation_token(config, provider, store, shutdown.clone());
        Self {
            pipeline,
            shutdown,
            started: false,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns a reference to the underlying pipeline for catalog submission
    /// and progress queries.
    pub fn pipeline(&self) -> &EnrichmentPipeline {
        &self.pipeline
    }

    /// Starts the underlying enrichment pipeline.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.pipeline.start().await?;
        self.started = true;
        Ok(())
    }

    /// Stops the pipeline gracefully by cancelling the root token and delegating to the pipeline.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown_pipeline().await
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.shutdown_pipeline().await
    }

    // The runner must come back startable even when the run aborted, so the
    // started flag and the token reset happen before the error propagates.
    async fn shutdown_pipeline(&mut self) -> Result<()> {
        self.shutdown.cancel();
        let result = self.pipeline.stop().await;
        self.started = false;
        self.reinitialize_shutdown_token();
        result
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.pipeline.replace_shutdown_root(self.shutdown.clone());
    }
}
