//! Hands a completed frame set to the compositing backend.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use shared::{
    domain::{Frame, TemplateId},
    protocol::CompositeResult,
};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::BackendError;

pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);
const SIMULATED_PROGRESS_CEILING: f32 = 90.0;
const SIMULATED_PROGRESS_MAX_STEP: f32 = 10.0;

#[async_trait]
pub trait CompositingBackend: Send + Sync {
    async fn process(
        &self,
        template_id: TemplateId,
        frames: &[Frame],
    ) -> Result<CompositeResult, BackendError>;
}

pub struct MissingCompositingBackend;

#[async_trait]
impl CompositingBackend for MissingCompositingBackend {
    async fn process(
        &self,
        template_id: TemplateId,
        _frames: &[Frame],
    ) -> Result<CompositeResult, BackendError> {
        Err(BackendError::Transport(format!(
            "compositing backend unavailable for template {template_id}"
        )))
    }
}

/// Percentage shown while an upload is outstanding.
///
/// Purely cosmetic: it creeps toward 90 on a timer and only reaches 100 once
/// the backend has answered. Nothing should treat it as a completion signal.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
pub struct UploadProgress(f32);

impl UploadProgress {
    pub const ZERO: UploadProgress = UploadProgress(0.0);
    pub const DONE: UploadProgress = UploadProgress(100.0);

    pub fn percent(self) -> f32 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{message}")]
    Failed {
        message: String,
        status: Option<u16>,
    },
    #[error("upload timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("upload cancelled")]
    Cancelled,
    #[error("no frames to upload")]
    NoFrames,
}

impl UploadError {
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

impl From<BackendError> for UploadError {
    fn from(err: BackendError) -> Self {
        UploadError::Failed {
            status: err.status(),
            message: err.user_message(),
        }
    }
}

pub struct UploadCoordinator {
    backend: Arc<dyn CompositingBackend>,
    timeout: Duration,
    progress_interval: Duration,
    progress: watch::Sender<UploadProgress>,
}

impl UploadCoordinator {
    pub fn new(backend: Arc<dyn CompositingBackend>) -> Self {
        let (progress, _) = watch::channel(UploadProgress::ZERO);
        Self {
            backend,
            timeout: DEFAULT_UPLOAD_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            progress,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn progress(&self) -> UploadProgress {
        *self.progress.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress.subscribe()
    }

    /// Sends `frames` as one request. Never retries and never mutates the frames.
    pub async fn submit(
        &self,
        template_id: TemplateId,
        frames: &[Frame],
        cancel: &CancellationToken,
    ) -> Result<CompositeResult, UploadError> {
        if frames.is_empty() {
            return Err(UploadError::NoFrames);
        }

        self.progress.send_replace(UploadProgress::ZERO);
        let started = Instant::now();

        let request = self.backend.process(template_id, frames);
        tokio::pin!(request);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval_at(
            started + self.progress_interval,
            self.progress_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(UploadError::Cancelled),
                result = &mut request => break result.map_err(UploadError::from),
                _ = &mut deadline => break Err(UploadError::TimedOut(self.timeout)),
                _ = ticker.tick() => self.advance_progress(),
            }
        };

        match &outcome {
            Ok(_) => {
                self.progress.send_replace(UploadProgress::DONE);
                info!(
                    %template_id,
                    frames = frames.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "upload completed"
                );
            }
            Err(err) => {
                self.progress.send_replace(UploadProgress::ZERO);
                warn!(%template_id, error = %err, "upload did not complete");
            }
        }
        outcome
    }

    fn advance_progress(&self) {
        self.progress.send_if_modified(|progress| {
            if progress.0 >= SIMULATED_PROGRESS_CEILING {
                return false;
            }
            let step = rand::thread_rng().gen_range(0.0..SIMULATED_PROGRESS_MAX_STEP);
            progress.0 = (progress.0 + step).min(SIMULATED_PROGRESS_CEILING);
            true
        });
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
