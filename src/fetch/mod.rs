use std::{path::Path, sync::Arc, time::Duration};

use crate::{
    catalog::ModelSpec,
    config::FetchConfig,
    error::{AttemptError, FetchError},
    report::{LocalState, SessionReport},
};

pub mod downloader;
pub mod partial;
pub mod retry;
pub mod stall;
pub mod transport;

use partial::PartialGuard;
use transport::{HttpTransport, Transport};

/// Progress notifications emitted while a session runs.
#[derive(Debug)]
pub enum FetchEvent<'a> {
    Skipped { name: &'a str, size: u64 },
    AttemptStarted { name: &'a str, attempt: u32, max_attempts: u32 },
    Resuming { name: &'a str, offset: u64 },
    Progress { name: &'a str, bytes: u64, total: Option<u64> },
    Retrying { name: &'a str, attempt: u32, delay: Duration, error: &'a AttemptError },
    Completed { name: &'a str, size: u64, attempts: u32 },
    Failed { name: &'a str, reason: &'a str, attempts: u32 },
}

pub trait FetchObserver: Send + Sync {
    fn on_event(&self, event: &FetchEvent<'_>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FetchObserver for NoopObserver {
    fn on_event(&self, _event: &FetchEvent<'_>) {}
}

/// Ensures a list of model artifacts exists in the configured directory.
/// Artifacts are processed one at a time, in order.
pub struct Fetcher {
    config: FetchConfig,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn FetchObserver>,
}

impl Fetcher {
    /// Fetcher over HTTP. Fails with `ClientUnavailable` when no HTTP client can be built.
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let transport = HttpTransport::new(config.connect_timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: FetchConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport, observer: Arc::new(NoopObserver) }
    }

    pub fn observer(mut self, observer: Arc<dyn FetchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Run one session. Per-artifact failures are recorded in the report; only
    /// session-level problems return `Err`. Partial files never outlive the
    /// call, including when the returned future is dropped early.
    pub async fn fetch_all(&self, specs: &[ModelSpec]) -> Result<SessionReport, FetchError> {
        let dir = &self.config.model_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| FetchError::TargetDir { path: dir.clone(), source })?;

        tracing::info!(dir = %dir.display(), count = specs.len(), "starting fetch session");
        let guard = PartialGuard::new(dir);
        let mut report = SessionReport::default();
        for spec in specs {
            report.artifacts.push(self.fetch_artifact(spec, &guard).await);
        }
        drop(guard);

        if report.is_success() {
            tracing::info!("all {} models ready", report.artifacts.len());
        } else {
            tracing::warn!(failed = ?report.failed_names(), "some models could not be fetched");
        }
        Ok(report)
    }

    /// Presence of each artifact on disk, without touching the network.
    pub async fn status(&self, specs: &[ModelSpec]) -> Vec<(ModelSpec, LocalState)> {
        local_status(&self.config.model_dir, specs).await
    }
}

pub async fn local_status(dir: &Path, specs: &[ModelSpec]) -> Vec<(ModelSpec, LocalState)> {
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let state = match downloader::satisfied_size(&dir.join(&spec.name)).await {
            Some(size) => LocalState::Present { size },
            None => LocalState::Missing,
        };
        out.push((spec.clone(), state));
    }
    out
}
