pub mod backend;
pub mod countdown;
pub mod effects;
pub mod frame_source;
pub mod gif;
pub mod handoff;
pub mod session;
pub mod upload;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use shared::{
    domain::{DelaySeconds, Frame, Layout, SessionPhase, TemplateId},
    protocol::{CompositeResult, HandoffRecord},
};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use backend::{BackendError, HttpBackend};
pub use countdown::{Countdown, CountdownEvent};
pub use effects::{Effect, EffectError};
pub use frame_source::{CommandFrameSource, FileQueueSource, FrameSource, MissingFrameSource};
pub use gif::{assemble_gif, GifOptions};
pub use handoff::{HandoffError, HandoffPersistence, HandoffStore, NoPersistence};
pub use session::{CaptureMachine, CaptureOutcome, RejectReason, SessionError, SessionSnapshot};
pub use upload::{CompositingBackend, UploadCoordinator, UploadError, UploadProgress};

#[derive(Debug, Error)]
pub enum BoothError {
    #[error("select a template before starting a session")]
    NoTemplateSelected,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Effect(#[from] EffectError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoothEvent {
    PhaseChanged(SessionSnapshot),
    CountdownTick { remaining: u32 },
    FrameCaptured { shot_index: u32, total_shots: u32 },
    CaptureFailed { shot: u32 },
    UploadProgress { percent: f32 },
    UploadCompleted(CompositeResult),
    UploadFailed { message: String },
    SessionReset,
}

/// What a single `request_shot` call ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum ShotOutcome {
    Rejected(RejectReason),
    Interrupted,
    Captured { shot_index: u32, total_shots: u32 },
    DeviceUnavailable,
    Completed(CompositeResult),
    UploadFailed(String),
}

/// Cancels whatever countdown or upload the booth is currently awaiting.
///
/// Cloneable and usable from any task; an interrupt with nothing in flight is a no-op.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        if let Ok(current) = self.current.lock() {
            current.cancel();
        }
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }
        token
    }
}

pub struct PhotoBooth {
    machine: CaptureMachine,
    countdown: Countdown,
    frame_source: Arc<dyn FrameSource>,
    uploader: UploadCoordinator,
    handoff: HandoffStore,
    interrupt: InterruptHandle,
    events: broadcast::Sender<BoothEvent>,
}

impl PhotoBooth {
    pub fn new(frame_source: Arc<dyn FrameSource>, backend: Arc<dyn CompositingBackend>) -> Self {
        Self::new_with_dependencies(frame_source, backend, Arc::new(NoPersistence))
    }

    pub fn new_with_dependencies(
        frame_source: Arc<dyn FrameSource>,
        backend: Arc<dyn CompositingBackend>,
        persistence: Arc<dyn HandoffPersistence>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            machine: CaptureMachine::new(),
            countdown: Countdown::new(),
            frame_source,
            uploader: UploadCoordinator::new(backend),
            handoff: HandoffStore::new(persistence),
            interrupt: InterruptHandle::default(),
            events,
        }
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.countdown = Countdown::with_period(period);
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.uploader = self.uploader.with_timeout(timeout);
        self
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BoothEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<UploadProgress> {
        self.uploader.subscribe_progress()
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.machine.snapshot()
    }

    pub fn frames(&self) -> &[Frame] {
        self.machine.frames()
    }

    pub fn result(&self) -> Option<&CompositeResult> {
        self.machine.result()
    }

    pub async fn select_template(&mut self, template_id: TemplateId) {
        info!(%template_id, "template selected");
        self.handoff.select_template(template_id).await;
    }

    pub async fn selected_template(&self) -> Option<TemplateId> {
        self.handoff.selected_template().await
    }

    pub async fn confirm(
        &mut self,
        layout: Layout,
        delay: DelaySeconds,
    ) -> Result<Uuid, BoothError> {
        if self.handoff.selected_template().await.is_none() {
            return Err(BoothError::NoTemplateSelected);
        }
        let session_id = self.machine.confirm(layout, delay)?;
        self.emit_phase();
        Ok(session_id)
    }

    /// Runs one full shot: countdown, device read and, after the last frame, the upload.
    pub async fn request_shot(&mut self) -> ShotOutcome {
        self.recover_abandoned_shot();

        let delay = match self.machine.request_shot() {
            session::ShotRequest::Countdown(delay) => delay,
            session::ShotRequest::Rejected(reason) => {
                debug!(?reason, "shot request ignored");
                return ShotOutcome::Rejected(reason);
            }
        };
        self.emit_phase();

        let interrupt = self.interrupt.arm();
        let mut ticks = match self.countdown.start(delay.get()) {
            Ok(ticks) => ticks,
            Err(err) => {
                debug!(error = %err, "countdown not started");
                self.machine.countdown_aborted();
                self.emit_phase();
                return ShotOutcome::Rejected(RejectReason::CapturePending);
            }
        };

        let fired = loop {
            tokio::select! {
                biased;
                _ = interrupt.cancelled() => {
                    self.countdown.cancel();
                    break false;
                }
                event = ticks.next() => match event {
                    Some(CountdownEvent::Tick(remaining)) => {
                        self.machine.countdown_tick(remaining);
                        self.emit(BoothEvent::CountdownTick { remaining });
                    }
                    Some(CountdownEvent::Fire) => break true,
                    None => break false,
                },
            }
        };
        drop(ticks);

        if !fired {
            self.machine.countdown_aborted();
            info!(shot = self.machine.shot_index() + 1, "countdown interrupted");
            self.emit_phase();
            return ShotOutcome::Interrupted;
        }

        self.machine.timer_fired();
        self.emit_phase();
        let shot = self.machine.shot_index() + 1;
        let frame = self.frame_source.acquire_frame().await;

        match self.machine.frame_acquired(frame) {
            CaptureOutcome::Captured {
                shot_index,
                total_shots,
            } => {
                self.emit(BoothEvent::FrameCaptured {
                    shot_index,
                    total_shots,
                });
                self.emit_phase();
                ShotOutcome::Captured {
                    shot_index,
                    total_shots,
                }
            }
            CaptureOutcome::ReadyToUpload(frames) => {
                self.emit(BoothEvent::FrameCaptured {
                    shot_index: frames.len() as u32,
                    total_shots: self.machine.total_shots(),
                });
                self.upload(frames).await
            }
            CaptureOutcome::DeviceUnavailable => {
                self.emit(BoothEvent::CaptureFailed { shot });
                self.emit_phase();
                ShotOutcome::DeviceUnavailable
            }
            CaptureOutcome::Ignored => ShotOutcome::Rejected(RejectReason::WrongPhase(
                self.machine.phase(),
            )),
        }
    }

    pub fn retake(&mut self) -> bool {
        let discarded = self.machine.retake();
        if discarded {
            self.emit_phase();
        }
        discarded
    }

    pub async fn retry_upload(&mut self) -> Result<ShotOutcome, BoothError> {
        let frames = self.machine.retry_upload()?;
        Ok(self.upload(frames).await)
    }

    /// Filters the captured frames and has the backend composite them again.
    ///
    /// On failure the previous result stays in place.
    pub async fn reprocess_with_effect(
        &mut self,
        effect: Effect,
    ) -> Result<CompositeResult, BoothError> {
        if !self.machine.is_complete() {
            return Err(SessionError::InvalidTransition {
                action: "apply effect",
                phase: self.machine.phase(),
            }
            .into());
        }
        let template_id = self
            .handoff
            .selected_template()
            .await
            .ok_or(BoothError::NoTemplateSelected)?;

        let processed = effects::apply_to_all(self.machine.frames(), effect)?;
        let token = self.interrupt.arm();
        let result = run_upload(&self.uploader, &self.events, template_id, &processed, &token)
            .await
            .inspect_err(|err| warn!(%effect, error = %err, "effect re-processing failed"))?;

        self.machine.replace_result(result.clone())?;
        if let Some(session_id) = self.machine.session_id() {
            self.handoff
                .record_result(session_id, &processed, &result, Some(effect.id()))
                .await;
        }
        info!(%effect, "result replaced with effect version");
        self.emit(BoothEvent::UploadCompleted(result.clone()));
        Ok(result)
    }

    /// Hand-off data for the results view.
    pub async fn load_results(&self) -> Result<HandoffRecord, HandoffError> {
        self.handoff.load_for_results().await
    }

    pub async fn reset(&mut self) {
        self.interrupt.interrupt();
        self.countdown.cancel();
        self.machine.reset();
        self.handoff.clear_session().await;
        self.emit(BoothEvent::SessionReset);
        self.emit_phase();
    }

    async fn upload(&mut self, frames: Vec<Frame>) -> ShotOutcome {
        let session_id = self.machine.session_id().unwrap_or_else(Uuid::nil);
        if let Some(layout) = self.machine.layout().cloned() {
            self.handoff
                .record_capture(session_id, &layout, &frames)
                .await;
        }
        self.emit_phase();

        let outcome = match self.handoff.selected_template().await {
            Some(template_id) => {
                let token = self.interrupt.arm();
                run_upload(&self.uploader, &self.events, template_id, &frames, &token).await
            }
            None => Err(UploadError::Failed {
                message: "no template selected".to_string(),
                status: None,
            }),
        };

        match outcome {
            Ok(result) => {
                if let Err(err) = self.machine.upload_succeeded(result.clone()) {
                    warn!(error = %err, "upload result arrived outside an upload");
                }
                self.handoff
                    .record_result(session_id, &frames, &result, None)
                    .await;
                self.emit(BoothEvent::UploadCompleted(result.clone()));
                self.emit_phase();
                ShotOutcome::Completed(result)
            }
            Err(err) => {
                let message = err.user_message();
                if let Err(err) = self.machine.upload_failed(message.clone()) {
                    warn!(error = %err, "upload failure arrived outside an upload");
                }
                self.emit(BoothEvent::UploadFailed {
                    message: message.clone(),
                });
                self.emit_phase();
                ShotOutcome::UploadFailed(message)
            }
        }
    }

    /// A `request_shot` future dropped mid-countdown leaves the machine counting down.
    fn recover_abandoned_shot(&mut self) {
        match self.machine.phase() {
            SessionPhase::CountingDown if !self.countdown.is_running() => {
                debug!("recovering from abandoned countdown");
                self.machine.countdown_aborted();
            }
            SessionPhase::Capturing => {
                debug!("recovering from abandoned frame acquisition");
                self.machine.capture_abandoned();
            }
            _ => {}
        }
    }

    fn emit(&self, event: BoothEvent) {
        let _ = self.events.send(event);
    }

    fn emit_phase(&self) {
        self.emit(BoothEvent::PhaseChanged(self.machine.snapshot()));
    }
}

async fn run_upload(
    uploader: &UploadCoordinator,
    events: &broadcast::Sender<BoothEvent>,
    template_id: TemplateId,
    frames: &[Frame],
    cancel: &CancellationToken,
) -> Result<CompositeResult, UploadError> {
    let mut progress_rx = uploader.subscribe_progress();
    let submit = uploader.submit(template_id, frames, cancel);
    tokio::pin!(submit);

    let outcome = loop {
        tokio::select! {
            outcome = &mut submit => break outcome,
            Ok(()) = progress_rx.changed() => {
                let percent = progress_rx.borrow_and_update().percent();
                let _ = events.send(BoothEvent::UploadProgress { percent });
            }
        }
    };
    let _ = events.send(BoothEvent::UploadProgress {
        percent: uploader.progress().percent(),
    });
    outcome
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
