use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(TemplateId);
id_newtype!(OrderId);
id_newtype!(RateId);

const DEFAULT_FRAME_MIME: &str = "image/jpeg";

/// How many frames make up one complete session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawLayout")]
pub struct Layout {
    name: String,
    total_shots: u32,
}

#[derive(Deserialize)]
struct RawLayout {
    name: String,
    total_shots: u32,
}

impl TryFrom<RawLayout> for Layout {
    type Error = DomainError;

    fn try_from(raw: RawLayout) -> Result<Self, Self::Error> {
        Layout::new(raw.name, raw.total_shots)
    }
}

impl Layout {
    pub fn new(name: impl Into<String>, total_shots: u32) -> Result<Self, DomainError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::InvalidLayout(
                "layout name must not be empty".to_string(),
            ));
        }
        if total_shots == 0 {
            return Err(DomainError::InvalidLayout(format!(
                "layout '{name}' must take at least one shot"
            )));
        }
        Ok(Self { name, total_shots })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_shots(&self) -> u32 {
        self.total_shots
    }

    pub fn presets() -> Vec<Layout> {
        [("2 Pose", 2), ("3 Pose", 3), ("4 Pose", 4), ("6 Pose", 6)]
            .into_iter()
            .map(|(name, total_shots)| Layout {
                name: name.to_string(),
                total_shots,
            })
            .collect()
    }

    pub fn preset(name: &str) -> Option<Layout> {
        Self::presets()
            .into_iter()
            .find(|layout| layout.name.eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} shots)", self.name, self.total_shots)
    }
}

/// Countdown length applied to every shot of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct DelaySeconds(u32);

impl DelaySeconds {
    pub const PRESETS: [u32; 3] = [3, 5, 10];

    pub fn new(seconds: u32) -> Result<Self, DomainError> {
        if seconds == 0 {
            return Err(DomainError::InvalidDelay(seconds));
        }
        Ok(Self(seconds))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for DelaySeconds {
    fn default() -> Self {
        Self(Self::PRESETS[0])
    }
}

impl TryFrom<u32> for DelaySeconds {
    type Error = DomainError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DelaySeconds> for u32 {
    fn from(value: DelaySeconds) -> Self {
        value.0
    }
}

/// One captured image, kept opaque apart from its MIME type.
///
/// Serializes as a `data:` URL, the same shape a browser screenshot uses.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    mime_type: String,
}

impl Frame {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self::new(bytes, DEFAULT_FRAME_MIME)
    }

    pub fn from_base64(payload: &str, mime_type: impl Into<String>) -> Result<Self, DomainError> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|err| DomainError::InvalidFrame(format!("invalid base64 payload: {err}")))?;
        Ok(Self::new(bytes, mime_type))
    }

    /// Parses `data:<mime>;base64,<payload>`. A bare base64 string is accepted as JPEG.
    pub fn from_data_url(value: &str) -> Result<Self, DomainError> {
        let Some(rest) = value.strip_prefix("data:") else {
            return Self::from_base64(value, DEFAULT_FRAME_MIME);
        };
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| DomainError::InvalidFrame("data url has no payload".to_string()))?;
        let Some(mime_type) = header.strip_suffix(";base64") else {
            return Err(DomainError::InvalidFrame(
                "only base64 data urls are supported".to_string(),
            ));
        };
        let mime_type = if mime_type.is_empty() {
            DEFAULT_FRAME_MIME
        } else {
            mime_type
        };
        Self::from_base64(payload, mime_type)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_data_url())
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Frame::from_data_url(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Configuring,
    CountingDown,
    Capturing,
    AwaitingNextShot,
    Uploading,
    Complete,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Complete)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Configuring => "configuring",
            SessionPhase::CountingDown => "counting_down",
            SessionPhase::Capturing => "capturing",
            SessionPhase::AwaitingNextShot => "awaiting_next_shot",
            SessionPhase::Uploading => "uploading",
            SessionPhase::Complete => "complete",
            SessionPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}
