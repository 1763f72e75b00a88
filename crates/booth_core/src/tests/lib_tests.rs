use super::*;
use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use std::{collections::VecDeque, io::Cursor};
use storage::Storage;
use tokio::time::Instant;

struct ScriptedFrameSource {
    script: Mutex<VecDeque<Option<Frame>>>,
    calls: Mutex<u32>,
    stall: Option<(u32, Duration)>,
}

impl ScriptedFrameSource {
    fn new(script: Vec<Option<Frame>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
            stall: None,
        })
    }

    /// Like `new`, but acquisition number `call` hangs for `duration` first.
    fn stalling(script: Vec<Option<Frame>>, call: u32, duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
            stall: Some((call, duration)),
        })
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().expect("calls lock")
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn acquire_frame(&self) -> Option<Frame> {
        let call = {
            let mut calls = self.calls.lock().expect("calls lock");
            *calls += 1;
            *calls
        };
        if let Some((stalled_call, duration)) = self.stall {
            if call == stalled_call {
                tokio::time::sleep(duration).await;
            }
        }
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .flatten()
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

struct FakeBackend {
    replies: Mutex<VecDeque<Result<CompositeResult, BackendError>>>,
    calls: Mutex<Vec<(TemplateId, Vec<Frame>)>>,
    latency: Duration,
}

impl FakeBackend {
    fn new(replies: Vec<Result<CompositeResult, BackendError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::from_secs(1),
        })
    }

    fn instant(replies: Vec<Result<CompositeResult, BackendError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        })
    }

    fn calls(&self) -> Vec<(TemplateId, Vec<Frame>)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl CompositingBackend for FakeBackend {
    async fn process(
        &self,
        template_id: TemplateId,
        frames: &[Frame],
    ) -> Result<CompositeResult, BackendError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((template_id, frames.to_vec()));
        tokio::time::sleep(self.latency).await;
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Ok(composite("default")))
    }
}

fn composite(message: &str) -> CompositeResult {
    CompositeResult(serde_json::json!({
        "image_base64": "aGVsbG8=",
        "message": message
    }))
}

fn frame(tag: &str) -> Frame {
    Frame::jpeg(tag.as_bytes().to_vec())
}

fn png_frame(color: [u8; 3]) -> Frame {
    let image = RgbImage::from_pixel(8, 8, Rgb(color));
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("encode png");
    Frame::new(buffer.into_inner(), "image/png")
}

fn layout(shots: u32) -> Layout {
    Layout::new(format!("{shots} Pose"), shots).expect("layout")
}

fn delay(seconds: u32) -> DelaySeconds {
    DelaySeconds::new(seconds).expect("delay")
}

fn drain(rx: &mut broadcast::Receiver<BoothEvent>) -> Vec<BoothEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn ready_booth(
    source: Arc<ScriptedFrameSource>,
    backend: Arc<FakeBackend>,
    shots: u32,
) -> PhotoBooth {
    let mut booth = PhotoBooth::new(source, backend);
    booth.select_template(TemplateId(7)).await;
    booth.confirm(layout(shots), delay(3)).await.expect("confirm");
    booth
}

#[tokio::test(start_paused = true)]
async fn two_shot_session_runs_countdowns_and_uploads_once() {
    let source = ScriptedFrameSource::new(vec![Some(frame("A")), Some(frame("B"))]);
    let backend = FakeBackend::new(vec![Ok(composite("ok"))]);
    let mut booth = ready_booth(source.clone(), backend.clone(), 2).await;
    let mut events = booth.subscribe_events();

    let started = Instant::now();
    assert_eq!(
        booth.request_shot().await,
        ShotOutcome::Captured {
            shot_index: 1,
            total_shots: 2
        }
    );
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(booth.snapshot().phase, SessionPhase::AwaitingNextShot);
    assert!(backend.calls().is_empty());

    let outcome = booth.request_shot().await;
    assert_eq!(outcome, ShotOutcome::Completed(composite("ok")));

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, TemplateId(7));
    assert_eq!(calls[0].1, vec![frame("A"), frame("B")]);

    let snapshot = booth.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Complete);
    assert!(snapshot.has_result);
    assert_eq!(booth.result(), Some(&composite("ok")));
    assert_eq!(source.calls(), 2);

    let events = drain(&mut events);
    let ticks: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            BoothEvent::CountdownTick { remaining } => Some(*remaining),
            _ => None,
        })
        .collect();
    assert_eq!(ticks, vec![3, 2, 1, 3, 2, 1]);

    let progress: Vec<f32> = events
        .iter()
        .filter_map(|event| match event {
            BoothEvent::UploadProgress { percent } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(progress.last().copied(), Some(100.0));
    assert!(progress[..progress.len() - 1].iter().all(|p| *p <= 90.0));
    assert!(events
        .iter()
        .any(|event| matches!(event, BoothEvent::UploadCompleted(result) if *result == composite("ok"))));

    let record = booth.load_results().await.expect("hand-off");
    assert_eq!(record.frames, vec![frame("A"), frame("B")]);
    assert_eq!(record.result, Some(composite("ok")));
    assert_eq!(record.template_id, Some(TemplateId(7)));
}

#[tokio::test(start_paused = true)]
async fn confirm_requires_a_selected_template() {
    let mut booth = PhotoBooth::new(
        ScriptedFrameSource::new(Vec::new()),
        FakeBackend::new(Vec::new()),
    );
    assert!(matches!(
        booth.confirm(layout(2), delay(3)).await,
        Err(BoothError::NoTemplateSelected)
    ));
    assert_eq!(booth.snapshot().phase, SessionPhase::Configuring);
}

#[tokio::test(start_paused = true)]
async fn retake_after_first_shot_discards_it_without_upload() {
    let source = ScriptedFrameSource::new(vec![Some(frame("A"))]);
    let backend = FakeBackend::new(Vec::new());
    let mut booth = ready_booth(source, backend.clone(), 2).await;

    booth.request_shot().await;
    assert!(booth.retake());

    let snapshot = booth.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::AwaitingNextShot);
    assert_eq!(snapshot.shot_index, 0);
    assert!(booth.frames().is_empty());
    assert!(backend.calls().is_empty());
    assert!(!booth.retake(), "nothing left to discard");
}

#[tokio::test(start_paused = true)]
async fn device_failure_keeps_progress_and_reports_capture_failed() {
    let source = ScriptedFrameSource::new(vec![Some(frame("A")), None, Some(frame("B"))]);
    let backend = FakeBackend::new(Vec::new());
    let mut booth = ready_booth(source, backend.clone(), 2).await;
    let mut events = booth.subscribe_events();

    booth.request_shot().await;
    assert_eq!(booth.request_shot().await, ShotOutcome::DeviceUnavailable);
    assert_eq!(booth.frames(), &[frame("A")]);
    assert_eq!(booth.snapshot().phase, SessionPhase::AwaitingNextShot);
    assert!(drain(&mut events)
        .iter()
        .any(|event| *event == BoothEvent::CaptureFailed { shot: 2 }));

    assert!(matches!(
        booth.request_shot().await,
        ShotOutcome::Completed(_)
    ));
    assert_eq!(backend.calls()[0].1, vec![frame("A"), frame("B")]);
}

#[tokio::test(start_paused = true)]
async fn upload_failure_keeps_frames_until_reset() {
    let source = ScriptedFrameSource::new(vec![Some(frame("only"))]);
    let backend = FakeBackend::new(vec![Err(BackendError::Rejected {
        status: 500,
        message: "compositor crashed".to_string(),
    })]);
    let mut booth = ready_booth(source, backend, 1).await;

    assert_eq!(
        booth.request_shot().await,
        ShotOutcome::UploadFailed("compositor crashed".to_string())
    );
    let snapshot = booth.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Failed);
    assert_eq!(snapshot.last_error.as_deref(), Some("compositor crashed"));
    assert_eq!(booth.frames(), &[frame("only")]);

    booth.reset().await;
    let snapshot = booth.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Configuring);
    assert!(booth.frames().is_empty());
    assert!(matches!(
        booth.load_results().await,
        Err(HandoffError::NoHandoffData)
    ));
    assert_eq!(booth.selected_template().await, Some(TemplateId(7)));
}

#[tokio::test(start_paused = true)]
async fn retry_resubmits_the_same_frames() {
    let source = ScriptedFrameSource::new(vec![Some(frame("A")), Some(frame("B"))]);
    let backend = FakeBackend::new(vec![
        Err(BackendError::Transport("connection reset".to_string())),
        Ok(composite("second try")),
    ]);
    let mut booth = ready_booth(source, backend.clone(), 2).await;

    booth.request_shot().await;
    assert!(matches!(
        booth.request_shot().await,
        ShotOutcome::UploadFailed(_)
    ));

    let outcome = booth.retry_upload().await.expect("retry");
    assert_eq!(outcome, ShotOutcome::Completed(composite("second try")));

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, calls[1].1);
    assert!(booth.retry_upload().await.is_err(), "nothing to retry once complete");
}

#[tokio::test(start_paused = true)]
async fn interrupt_stops_countdown_without_capturing() {
    let source = ScriptedFrameSource::new(vec![Some(frame("A"))]);
    let mut booth = ready_booth(source.clone(), FakeBackend::new(Vec::new()), 2).await;
    let handle = booth.interrupt_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.interrupt();
    });

    assert_eq!(booth.request_shot().await, ShotOutcome::Interrupted);
    assert_eq!(source.calls(), 0);
    let snapshot = booth.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::AwaitingNextShot);
    assert_eq!(snapshot.countdown_remaining, None);

    assert!(matches!(
        booth.request_shot().await,
        ShotOutcome::Captured { shot_index: 1, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn dropped_shot_request_does_not_wedge_the_session() {
    let source = ScriptedFrameSource::new(vec![Some(frame("A"))]);
    let mut booth = ready_booth(source, FakeBackend::new(Vec::new()), 2).await;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(1500), booth.request_shot()).await;
    assert!(abandoned.is_err());
    assert_eq!(booth.snapshot().phase, SessionPhase::CountingDown);

    assert!(matches!(
        booth.request_shot().await,
        ShotOutcome::Captured { shot_index: 1, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn dropped_request_during_acquisition_keeps_earlier_frames() {
    let source = ScriptedFrameSource::stalling(
        vec![Some(frame("A")), Some(frame("B"))],
        2,
        Duration::from_secs(10),
    );
    let mut booth = ready_booth(source.clone(), FakeBackend::new(Vec::new()), 3).await;

    assert!(matches!(
        booth.request_shot().await,
        ShotOutcome::Captured { shot_index: 1, .. }
    ));

    let abandoned = tokio::time::timeout(Duration::from_secs(5), booth.request_shot()).await;
    assert!(abandoned.is_err());
    assert_eq!(booth.snapshot().phase, SessionPhase::Capturing);
    assert_eq!(source.calls(), 2);

    assert!(matches!(
        booth.request_shot().await,
        ShotOutcome::Captured { shot_index: 2, .. }
    ));
    assert_eq!(booth.frames(), &[frame("A"), frame("B")]);
    assert_eq!(booth.snapshot().phase, SessionPhase::AwaitingNextShot);
}

#[tokio::test(start_paused = true)]
async fn effect_reprocessing_replaces_result_only_when_complete() {
    let source = ScriptedFrameSource::new(vec![
        Some(png_frame([200, 80, 40])),
        Some(png_frame([40, 80, 200])),
    ]);
    let backend = FakeBackend::new(vec![Ok(composite("plain")), Ok(composite("vintage"))]);
    let mut booth = ready_booth(source, backend.clone(), 2).await;

    booth.request_shot().await;
    assert!(matches!(
        booth.reprocess_with_effect(Effect::Vintage).await,
        Err(BoothError::Session(_))
    ));
    booth.request_shot().await;

    let result = booth
        .reprocess_with_effect(Effect::Vintage)
        .await
        .expect("effect");
    assert_eq!(result, composite("vintage"));
    assert_eq!(booth.result(), Some(&composite("vintage")));
    assert_eq!(booth.snapshot().phase, SessionPhase::Complete);

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1.len(), 2);
    assert!(calls[1]
        .1
        .iter()
        .all(|frame| frame.mime_type() == "image/jpeg"));

    let record = booth.load_results().await.expect("hand-off");
    assert_eq!(record.effect.as_deref(), Some("vintage"));
    assert_eq!(record.result, Some(composite("vintage")));
}

#[tokio::test]
async fn results_survive_a_restart_through_storage() {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let source = ScriptedFrameSource::new(vec![Some(frame("A"))]);
    let mut booth = PhotoBooth::new_with_dependencies(
        source,
        FakeBackend::instant(vec![Ok(composite("stored"))]),
        Arc::new(storage.clone()),
    )
    .with_tick_period(Duration::from_millis(5));
    booth.select_template(TemplateId(4)).await;
    booth.confirm(layout(1), delay(3)).await.expect("confirm");
    booth.request_shot().await;

    let restarted = PhotoBooth::new_with_dependencies(
        ScriptedFrameSource::new(Vec::new()),
        FakeBackend::instant(Vec::new()),
        Arc::new(storage),
    );
    let record = restarted.load_results().await.expect("restored");
    assert_eq!(record.result, Some(composite("stored")));
    assert_eq!(record.frames, vec![frame("A")]);
    assert_eq!(restarted.snapshot().phase, SessionPhase::Configuring);
}
