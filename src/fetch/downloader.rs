use std::{io, path::Path};

use futures_util::StreamExt;
use tokio::{fs, io::AsyncWriteExt, time::Instant};

use super::{
    partial::{partial_path, PartialGuard},
    retry::{retry, RetryOutcome, RetryPolicy},
    stall::{StallMonitor, StallPolicy},
    transport::{Body, ResponseKind},
    FetchEvent, Fetcher,
};
use crate::{
    catalog::ModelSpec,
    error::{AttemptError, TransportError},
    report::{ArtifactReport, ArtifactStatus},
};

/// Size of `path` if it is a non-empty regular file. Non-empty is the whole
/// integrity check: there is no checksum to compare against.
pub async fn satisfied_size(path: &Path) -> Option<u64> {
    let meta = fs::metadata(path).await.ok()?;
    (meta.is_file() && meta.len() > 0).then(|| meta.len())
}

async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), "could not remove partial file: {err}"),
    }
}

async fn existing_len(path: &Path) -> io::Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

impl Fetcher {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { max_attempts: self.config.max_attempts, backoff_unit: self.config.backoff_unit }
    }

    fn stall_policy(&self) -> StallPolicy {
        StallPolicy { window: self.config.stall_window, min_rate: self.config.min_rate }
    }

    pub(crate) async fn fetch_artifact(&self, spec: &ModelSpec, guard: &PartialGuard) -> ArtifactReport {
        let name = spec.name.as_str();
        let destination = self.config.model_dir.join(name);

        if let Some(size) = satisfied_size(&destination).await {
            tracing::info!(model = name, size, "already present, skipping");
            self.observer.on_event(&FetchEvent::Skipped { name, size });
            return ArtifactReport::new(spec, ArtifactStatus::AlreadySatisfied, 0, size);
        }

        let partial = partial_path(&destination);
        guard.register(&partial);
        tracing::info!(model = name, url = %spec.source_url, "downloading");

        let outcome = retry(
            self.retry_policy(),
            |attempt| self.attempt(spec, &partial, &destination, attempt),
            |attempt, delay, error| {
                tracing::warn!(model = name, attempt, "attempt failed: {error}; retrying in {}s", delay.as_secs_f32());
                self.observer.on_event(&FetchEvent::Retrying { name, attempt, delay, error });
            },
        )
        .await;

        match outcome {
            RetryOutcome::Success { value: size, attempts } => {
                guard.release(&partial);
                tracing::info!(model = name, size, attempts, "download complete");
                self.observer.on_event(&FetchEvent::Completed { name, size, attempts });
                ArtifactReport::new(spec, ArtifactStatus::Completed, attempts, size)
            }
            RetryOutcome::Failed { last, attempts } => {
                let reason = last.to_string();
                tracing::error!(model = name, attempts, "giving up: {reason}");
                self.observer.on_event(&FetchEvent::Failed { name, reason: &reason, attempts });
                ArtifactReport::new(spec, ArtifactStatus::Failed { reason }, attempts, 0)
            }
        }
    }

    /// One download attempt: transfer into the partial file, then promote it
    /// to `destination` by rename. Partial bytes survive a failed transfer so
    /// the next attempt can resume.
    async fn attempt(
        &self,
        spec: &ModelSpec,
        partial: &Path,
        destination: &Path,
        attempt: u32,
    ) -> Result<u64, AttemptError> {
        self.observer.on_event(&FetchEvent::AttemptStarted {
            name: &spec.name,
            attempt,
            max_attempts: self.config.max_attempts,
        });

        self.transfer(spec, partial).await?;

        let size = existing_len(partial).await?;
        if size == 0 {
            discard(partial).await;
            return Err(AttemptError::EmptyFile);
        }
        fs::rename(partial, destination).await?;
        Ok(size)
    }

    async fn transfer(&self, spec: &ModelSpec, partial: &Path) -> Result<(), AttemptError> {
        let name = spec.name.as_str();
        let offset = existing_len(partial).await?;

        // Waiting for response headers counts against the first stall window.
        let mut monitor = StallMonitor::new(self.stall_policy());
        let request = self.transport.get(&spec.source_url, offset);
        let result = match monitor.deadline() {
            Some(deadline) => match tokio::time::timeout_at(deadline, request).await {
                Ok(result) => result,
                Err(_) => return Err(monitor.stalled()),
            },
            None => request.await,
        };

        let response = match result {
            Ok(response) => response,
            Err(err @ (TransportError::RangeNotSatisfiable | TransportError::RangeMismatch { .. })) => {
                // The partial does not match the remote file; start over next time.
                tracing::warn!(model = name, offset, "resume rejected, discarding partial file: {err}");
                discard(partial).await;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let (mut file, mut written) = match response.kind {
            ResponseKind::AlreadyComplete => {
                tracing::debug!(model = name, offset, "partial file already complete");
                return Ok(());
            }
            ResponseKind::Resumed => {
                tracing::debug!(model = name, offset, "resuming download");
                self.observer.on_event(&FetchEvent::Resuming { name, offset });
                (fs::OpenOptions::new().append(true).open(partial).await?, offset)
            }
            ResponseKind::Full => {
                if offset > 0 {
                    tracing::warn!(model = name, offset, "server ignored range request, restarting from zero");
                }
                (fs::File::create(partial).await?, 0)
            }
        };

        let total = response.total;
        let mut body = response.body;
        self.observer.on_event(&FetchEvent::Progress { name, bytes: written, total });

        let streamed = self.pump(name, &mut monitor, &mut body, &mut file, &mut written, total).await;
        let flushed = file.flush().await;
        streamed?;
        flushed?;
        file.sync_all().await?;
        Ok(())
    }

    /// Copy body chunks into `file` until the stream ends or stalls.
    async fn pump(
        &self,
        name: &str,
        monitor: &mut StallMonitor,
        body: &mut Body,
        file: &mut fs::File,
        written: &mut u64,
        total: Option<u64>,
    ) -> Result<(), AttemptError> {
        loop {
            let next = match monitor.deadline() {
                Some(deadline) => tokio::time::timeout_at(deadline, body.next()).await.ok(),
                None => Some(body.next().await),
            };
            match next {
                Some(Some(chunk)) => {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    *written += chunk.len() as u64;
                    monitor.record(chunk.len());
                    self.observer.on_event(&FetchEvent::Progress { name, bytes: *written, total });
                }
                Some(None) => return Ok(()),
                None => {}
            }
            monitor.check(Instant::now())?;
        }
    }
}
