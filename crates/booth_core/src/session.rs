//! Guided multi-shot capture session.
//!
//! `CaptureMachine` is a synchronous state machine: it never waits on timers
//! or the network. The orchestrator feeds it countdown and device results and
//! acts on what it returns.

use serde::Serialize;
use shared::{
    domain::{DelaySeconds, Frame, Layout, SessionPhase},
    protocol::CompositeResult,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("cannot {action} while session is {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: SessionPhase,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AllShotsTaken,
    CapturePending,
    WrongPhase(SessionPhase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotRequest {
    /// Start a countdown of this many seconds.
    Countdown(DelaySeconds),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured { shot_index: u32, total_shots: u32 },
    /// The last shot was captured; these frames must be uploaded.
    ReadyToUpload(Vec<Frame>),
    DeviceUnavailable,
    Ignored,
}

/// Serializable view of the machine for events and UI rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub phase: SessionPhase,
    pub layout: Option<Layout>,
    pub delay_seconds: Option<u32>,
    pub shot_index: u32,
    pub total_shots: u32,
    pub countdown_remaining: Option<u32>,
    pub has_result: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct SessionConfig {
    session_id: Uuid,
    layout: Layout,
    delay: DelaySeconds,
}

#[derive(Debug, Clone)]
pub struct CaptureMachine {
    phase: SessionPhase,
    config: Option<SessionConfig>,
    frames: Vec<Frame>,
    countdown_remaining: Option<u32>,
    result: Option<CompositeResult>,
    last_error: Option<String>,
}

impl Default for CaptureMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureMachine {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Configuring,
            config: None,
            frames: Vec::new(),
            countdown_remaining: None,
            result: None,
            last_error: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.config.as_ref().map(|config| config.session_id)
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.config.as_ref().map(|config| &config.layout)
    }

    pub fn delay(&self) -> Option<DelaySeconds> {
        self.config.as_ref().map(|config| config.delay)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn shot_index(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn total_shots(&self) -> u32 {
        self.layout().map(Layout::total_shots).unwrap_or(0)
    }

    pub fn countdown_remaining(&self) -> Option<u32> {
        self.countdown_remaining
    }

    pub fn result(&self) -> Option<&CompositeResult> {
        self.result.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.phase == SessionPhase::Complete
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id(),
            phase: self.phase,
            layout: self.layout().cloned(),
            delay_seconds: self.delay().map(DelaySeconds::get),
            shot_index: self.shot_index(),
            total_shots: self.total_shots(),
            countdown_remaining: self.countdown_remaining,
            has_result: self.result.is_some(),
            last_error: self.last_error.clone(),
        }
    }

    pub fn confirm(&mut self, layout: Layout, delay: DelaySeconds) -> Result<Uuid, SessionError> {
        self.expect_phase(SessionPhase::Configuring, "confirm layout")?;

        let session_id = Uuid::new_v4();
        info!(
            %session_id,
            layout = layout.name(),
            total_shots = layout.total_shots(),
            delay_seconds = delay.get(),
            "capture session confirmed"
        );
        self.config = Some(SessionConfig {
            session_id,
            layout,
            delay,
        });
        self.frames.clear();
        self.countdown_remaining = None;
        self.result = None;
        self.last_error = None;
        self.phase = SessionPhase::AwaitingNextShot;
        Ok(session_id)
    }

    pub fn request_shot(&mut self) -> ShotRequest {
        match self.phase {
            SessionPhase::AwaitingNextShot => {}
            SessionPhase::CountingDown | SessionPhase::Capturing => {
                return ShotRequest::Rejected(RejectReason::CapturePending);
            }
            phase => return ShotRequest::Rejected(RejectReason::WrongPhase(phase)),
        }

        let Some(config) = self.config.as_ref() else {
            return ShotRequest::Rejected(RejectReason::WrongPhase(self.phase));
        };
        if self.shot_index() >= config.layout.total_shots() {
            return ShotRequest::Rejected(RejectReason::AllShotsTaken);
        }

        let delay = config.delay;
        self.phase = SessionPhase::CountingDown;
        self.countdown_remaining = Some(delay.get());
        debug!(
            shot = self.shot_index() + 1,
            delay_seconds = delay.get(),
            "shot requested"
        );
        ShotRequest::Countdown(delay)
    }

    pub fn countdown_tick(&mut self, remaining: u32) {
        if self.phase == SessionPhase::CountingDown {
            self.countdown_remaining = Some(remaining);
        }
    }

    pub fn timer_fired(&mut self) -> bool {
        if self.phase != SessionPhase::CountingDown {
            return false;
        }
        self.countdown_remaining = None;
        self.phase = SessionPhase::Capturing;
        true
    }

    /// The countdown was cancelled before firing; no frame is taken.
    pub fn countdown_aborted(&mut self) -> bool {
        if self.phase != SessionPhase::CountingDown {
            return false;
        }
        self.countdown_remaining = None;
        self.phase = SessionPhase::AwaitingNextShot;
        true
    }

    /// The acquisition never completed; the shot counts as a device failure.
    pub fn capture_abandoned(&mut self) -> bool {
        if self.phase != SessionPhase::Capturing {
            return false;
        }
        warn!(shot = self.shot_index() + 1, "frame acquisition abandoned");
        self.phase = SessionPhase::AwaitingNextShot;
        true
    }

    pub fn frame_acquired(&mut self, frame: Option<Frame>) -> CaptureOutcome {
        if self.phase != SessionPhase::Capturing {
            return CaptureOutcome::Ignored;
        }
        self.phase = SessionPhase::AwaitingNextShot;

        let Some(frame) = frame.filter(|frame| !frame.is_empty()) else {
            warn!(
                shot = self.shot_index() + 1,
                "capture device returned no frame; shot must be retaken"
            );
            return CaptureOutcome::DeviceUnavailable;
        };

        let total_shots = self.total_shots();
        if self.shot_index() >= total_shots {
            return CaptureOutcome::Ignored;
        }
        self.frames.push(frame);
        let shot_index = self.shot_index();
        info!(shot_index, total_shots, "frame captured");

        if shot_index == total_shots {
            self.phase = SessionPhase::Uploading;
            self.last_error = None;
            return CaptureOutcome::ReadyToUpload(self.frames.clone());
        }

        CaptureOutcome::Captured {
            shot_index,
            total_shots,
        }
    }

    pub fn retake(&mut self) -> bool {
        if self.phase != SessionPhase::AwaitingNextShot || self.frames.is_empty() {
            return false;
        }
        self.frames.pop();
        info!(shot_index = self.shot_index(), "last frame discarded for retake");
        true
    }

    pub fn upload_succeeded(&mut self, result: CompositeResult) -> Result<(), SessionError> {
        self.expect_phase(SessionPhase::Uploading, "complete upload")?;
        self.result = Some(result);
        self.last_error = None;
        self.phase = SessionPhase::Complete;
        Ok(())
    }

    pub fn upload_failed(&mut self, message: impl Into<String>) -> Result<(), SessionError> {
        self.expect_phase(SessionPhase::Uploading, "fail upload")?;
        let message = message.into();
        warn!(error = %message, frames = self.frames.len(), "upload failed; frames kept");
        self.last_error = Some(message);
        self.phase = SessionPhase::Failed;
        Ok(())
    }

    /// Re-enters `Uploading` with the frames preserved from the failed attempt.
    pub fn retry_upload(&mut self) -> Result<Vec<Frame>, SessionError> {
        self.expect_phase(SessionPhase::Failed, "retry upload")?;
        self.last_error = None;
        self.phase = SessionPhase::Uploading;
        Ok(self.frames.clone())
    }

    pub fn replace_result(&mut self, result: CompositeResult) -> Result<(), SessionError> {
        self.expect_phase(SessionPhase::Complete, "replace result")?;
        self.result = Some(result);
        Ok(())
    }

    pub fn reset(&mut self) {
        if self.phase != SessionPhase::Configuring {
            info!(from = %self.phase, "capture session reset");
        }
        *self = Self::new();
    }

    fn expect_phase(
        &self,
        expected: SessionPhase,
        action: &'static str,
    ) -> Result<(), SessionError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                action,
                phase: self.phase,
            })
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
