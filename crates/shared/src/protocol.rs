use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{Frame, Layout, OrderId, RateId, TemplateId},
    error::DomainError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub id: TemplateId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_method: Option<String>,
    #[serde(default)]
    pub image_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub rate_id: RateId,
    pub quantity: u32,
    pub voucher_code: String,
    #[serde(default)]
    pub notes: String,
}

/// Order confirmation, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderReceipt(pub serde_json::Value);

impl OrderReceipt {
    pub fn id(&self) -> Option<OrderId> {
        self.0.get("id").and_then(|id| id.as_i64()).map(OrderId)
    }
}

/// Success body of `POST /process/{template}`, passed through untouched.
///
/// Only the results view interprets it, through the accessors below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeResult(pub serde_json::Value);

impl CompositeResult {
    pub fn raw(&self) -> &serde_json::Value {
        &self.0
    }

    /// The composited image, under `image_base64` or the shorter `image`.
    pub fn image_base64(&self) -> Option<&str> {
        self.str_field("image_base64")
            .or_else(|| self.str_field("image"))
    }

    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }

    pub fn status(&self) -> Option<&str> {
        self.str_field("status")
    }

    /// Decodes the composited image, tolerating a `data:` URL prefix.
    pub fn decode_image(&self) -> Result<Option<Vec<u8>>, DomainError> {
        let Some(encoded) = self.image_base64() else {
            return Ok(None);
        };
        let payload = encoded
            .split_once(";base64,")
            .map(|(_, payload)| payload)
            .unwrap_or(encoded);
        STANDARD
            .decode(payload.trim())
            .map(Some)
            .map_err(|err| DomainError::InvalidFrame(format!("invalid composite image: {err}")))
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.as_str())
    }
}

/// Everything one page of the kiosk flow hands to the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub session_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Layout>,
    #[serde(default)]
    pub frames: Vec<Frame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CompositeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl HandoffRecord {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            template_id: None,
            layout: None,
            frames: Vec::new(),
            result: None,
            effect: None,
            saved_at: Utc::now(),
        }
    }

    pub fn has_content(&self) -> bool {
        !self.frames.is_empty() || self.result.is_some()
    }
}
