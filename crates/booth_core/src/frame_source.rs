//! Where frames come from when the countdown fires.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use shared::domain::Frame;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(15);

/// Produces one frame per call, or `None` when no image data could be read.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn acquire_frame(&self) -> Option<Frame>;
    fn describe(&self) -> String;
}

pub struct MissingFrameSource;

#[async_trait]
impl FrameSource for MissingFrameSource {
    async fn acquire_frame(&self) -> Option<Frame> {
        warn!("no capture device configured");
        None
    }

    fn describe(&self) -> String {
        "no capture device".to_string()
    }
}

/// Runs an external capture program and reads the image from its stdout.
pub struct CommandFrameSource {
    program: String,
    args: Vec<String>,
    mime_type: String,
    timeout: Duration,
}

impl CommandFrameSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            mime_type: "image/jpeg".to_string(),
            timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FrameSource for CommandFrameSource {
    async fn acquire_frame(&self) -> Option<Frame> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(program = %self.program, error = %err, "failed to start capture command");
                return None;
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    timeout_secs = self.timeout.as_secs(),
                    "capture command timed out"
                );
                return None;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                program = %self.program,
                status = %output.status,
                stderr = %stderr.trim(),
                "capture command failed"
            );
            return None;
        }
        if output.stdout.is_empty() {
            warn!(program = %self.program, "capture command produced no image data");
            return None;
        }

        debug!(program = %self.program, bytes = output.stdout.len(), "frame read from device");
        Some(Frame::new(output.stdout, self.mime_type.clone()))
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Serves pre-existing image files, one per acquisition, in queue order.
pub struct FileQueueSource {
    queue: Mutex<VecDeque<PathBuf>>,
}

impl FileQueueSource {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            queue: Mutex::new(paths.into_iter().collect()),
        }
    }

    pub fn push(&self, path: PathBuf) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(path);
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    fn next_path(&self) -> Option<PathBuf> {
        self.queue.lock().ok()?.pop_front()
    }
}

#[async_trait]
impl FrameSource for FileQueueSource {
    async fn acquire_frame(&self) -> Option<Frame> {
        let Some(path) = self.next_path() else {
            warn!("upload queue is empty");
            return None;
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                debug!(path = %path.display(), bytes = bytes.len(), "frame read from file");
                Some(Frame::new(bytes, mime_for_path(&path)))
            }
            Ok(_) => {
                warn!(path = %path.display(), "uploaded file is empty");
                None
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read uploaded file");
                None
            }
        }
    }

    fn describe(&self) -> String {
        format!("file upload ({} queued)", self.remaining())
    }
}

fn mime_for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .filter(|mime| mime.starts_with("image/"))
        .unwrap_or("image/jpeg")
        .to_string()
}
