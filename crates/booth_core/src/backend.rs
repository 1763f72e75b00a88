//! HTTP client for the compositing backend.

use async_trait::async_trait;
use reqwest::{
    header::{ACCEPT, AUTHORIZATION},
    multipart::{Form, Part},
    Client, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Frame, TemplateId},
    error::BackendErrorBody,
    protocol::{CompositeResult, CreateOrderRequest, OrderReceipt, TemplateSummary},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::upload::CompositingBackend;

pub const GENERIC_UPLOAD_FAILURE: &str = "Failed to upload photos";
const PHOTOS_FIELD: &str = "photos";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error("{0}")]
    Transport(String),
    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unexpected backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Text suitable for a dismissible error message on the kiosk.
    pub fn user_message(&self) -> String {
        let text = self.to_string();
        if text.trim().is_empty() {
            GENERIC_UPLOAD_FAILURE.to_string()
        } else {
            text
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> Result<Self, BackendError> {
        let mut base_url = Url::parse(base_url.trim())?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, access_token: Option<String>) -> Self {
        self.access_token = access_token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    pub async fn list_templates(&self) -> Result<Vec<TemplateSummary>, BackendError> {
        let response = self
            .http
            .get(self.endpoint("templates/")?)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let templates: Vec<TemplateSummary> = read_json(response).await?;
        debug!(count = templates.len(), "fetched templates");
        Ok(templates)
    }

    pub async fn create_order(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<OrderReceipt, BackendError> {
        let mut builder = self
            .http
            .post(self.endpoint("orders/")?)
            .header(ACCEPT, "application/json")
            .json(request);
        if let Some(token) = &self.access_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let receipt: OrderReceipt = read_json(builder.send().await?).await?;
        info!(
            order_id = ?receipt.id(),
            rate_id = %request.rate_id,
            "order created from voucher"
        );
        Ok(receipt)
    }
}

#[async_trait]
impl CompositingBackend for HttpBackend {
    async fn process(
        &self,
        template_id: TemplateId,
        frames: &[Frame],
    ) -> Result<CompositeResult, BackendError> {
        let form = frames_to_form(frames)?;
        let url = self.endpoint(&format!("process/{template_id}"))?;
        info!(%template_id, frames = frames.len(), "submitting frames for compositing");

        let response = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .multipart(form)
            .send()
            .await?;
        read_json(response).await
    }
}

/// One `photos` part per frame, in capture order.
pub fn frames_to_form(frames: &[Frame]) -> Result<Form, BackendError> {
    frames
        .iter()
        .enumerate()
        .try_fold(Form::new(), |form, (index, frame)| {
            let part = Part::bytes(frame.bytes().to_vec())
                .file_name(format!("photo{}.jpg", index + 1))
                .mime_str(frame.mime_type())?;
            Ok(form.part(PHOTOS_FIELD, part))
        })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let message = failure_message(status, &body);
    warn!(status = status.as_u16(), error = %message, "backend rejected request");
    Err(BackendError::Rejected {
        status: status.as_u16(),
        message,
    })
}

fn failure_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<BackendErrorBody>(body)
        .ok()
        .and_then(|body| body.human_message())
        .unwrap_or_else(|| format!("backend returned HTTP {}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_trailing_slash_for_joins() {
        let backend = HttpBackend::new("http://localhost:8888/api").expect("backend");
        assert_eq!(
            backend.endpoint("process/4").expect("url").as_str(),
            "http://localhost:8888/api/process/4"
        );
        assert_eq!(
            backend.endpoint("/templates/").expect("url").as_str(),
            "http://localhost:8888/api/templates/"
        );
    }

    #[test]
    fn rejects_unparseable_base_url() {
        assert!(matches!(
            HttpBackend::new("not a url"),
            Err(BackendError::InvalidUrl(_))
        ));
    }

    #[test]
    fn failure_message_prefers_body_then_status() {
        assert_eq!(
            failure_message(StatusCode::BAD_REQUEST, r#"{"message":"bad template"}"#),
            "bad template"
        );
        assert_eq!(
            failure_message(StatusCode::NOT_FOUND, r#"{"detail":"Template not found"}"#),
            "Template not found"
        );
        assert_eq!(
            failure_message(StatusCode::BAD_GATEWAY, "<html>oops</html>"),
            "backend returned HTTP 502"
        );
    }

    #[test]
    fn blank_messages_fall_back_to_generic_text() {
        let err = BackendError::Transport("  ".to_string());
        assert_eq!(err.user_message(), GENERIC_UPLOAD_FAILURE);
    }

    #[test]
    fn empty_token_is_ignored() {
        let backend = HttpBackend::new("http://localhost:8888")
            .expect("backend")
            .with_access_token(Some(" ".to_string()));
        assert!(backend.access_token.is_none());
    }
}
