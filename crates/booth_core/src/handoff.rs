//! Carries session data from capture to results.
//!
//! The in-process record is authoritative. The persisted copy only matters
//! when the results step starts without it, e.g. after a process restart.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{Frame, Layout, TemplateId},
    protocol::{CompositeResult, HandoffRecord},
};
use storage::Storage;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("no session data available; start a new capture")]
    NoHandoffData,
}

#[async_trait]
pub trait HandoffPersistence: Send + Sync {
    async fn save_selected_template(&self, template_id: TemplateId) -> Result<()>;
    async fn load_selected_template(&self) -> Result<Option<TemplateId>>;
    async fn save_session(&self, record: &HandoffRecord) -> Result<()>;
    async fn load_session(&self) -> Result<Option<HandoffRecord>>;
    async fn clear_session(&self) -> Result<()>;
}

pub struct NoPersistence;

#[async_trait]
impl HandoffPersistence for NoPersistence {
    async fn save_selected_template(&self, _template_id: TemplateId) -> Result<()> {
        Ok(())
    }

    async fn load_selected_template(&self) -> Result<Option<TemplateId>> {
        Ok(None)
    }

    async fn save_session(&self, _record: &HandoffRecord) -> Result<()> {
        Ok(())
    }

    async fn load_session(&self) -> Result<Option<HandoffRecord>> {
        Ok(None)
    }

    async fn clear_session(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl HandoffPersistence for Storage {
    async fn save_selected_template(&self, template_id: TemplateId) -> Result<()> {
        Storage::save_selected_template(self, template_id).await
    }

    async fn load_selected_template(&self) -> Result<Option<TemplateId>> {
        Storage::load_selected_template(self).await
    }

    async fn save_session(&self, record: &HandoffRecord) -> Result<()> {
        self.save_session_handoff(record).await
    }

    async fn load_session(&self) -> Result<Option<HandoffRecord>> {
        self.load_session_handoff().await
    }

    async fn clear_session(&self) -> Result<()> {
        self.clear_session_handoff().await.map(|_| ())
    }
}

pub struct HandoffStore {
    persistence: Arc<dyn HandoffPersistence>,
    selected_template: Option<TemplateId>,
    current: Option<HandoffRecord>,
}

impl HandoffStore {
    pub fn new(persistence: Arc<dyn HandoffPersistence>) -> Self {
        Self {
            persistence,
            selected_template: None,
            current: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(NoPersistence))
    }

    pub fn current(&self) -> Option<&HandoffRecord> {
        self.current.as_ref()
    }

    /// Persistence failures are logged; the in-process selection still applies.
    pub async fn select_template(&mut self, template_id: TemplateId) {
        self.selected_template = Some(template_id);
        if let Some(record) = self.current.as_mut() {
            record.template_id = Some(template_id);
        }
        if let Err(err) = self.persistence.save_selected_template(template_id).await {
            warn!(%template_id, error = %err, "failed to persist template selection");
        }
    }

    pub async fn selected_template(&self) -> Option<TemplateId> {
        if self.selected_template.is_some() {
            return self.selected_template;
        }
        match self.persistence.load_selected_template().await {
            Ok(template_id) => template_id,
            Err(err) => {
                warn!(error = %err, "failed to load persisted template selection");
                None
            }
        }
    }

    pub async fn record_capture(&mut self, session_id: Uuid, layout: &Layout, frames: &[Frame]) {
        let template_id = self.selected_template().await;
        let record = self.record_for(session_id);
        record.template_id = template_id;
        record.layout = Some(layout.clone());
        record.frames = frames.to_vec();
        record.result = None;
        record.effect = None;
        record.saved_at = Utc::now();
        self.persist_current().await;
    }

    pub async fn record_result(
        &mut self,
        session_id: Uuid,
        frames: &[Frame],
        result: &CompositeResult,
        effect: Option<&str>,
    ) {
        let template_id = self.selected_template().await;
        let record = self.record_for(session_id);
        if record.template_id.is_none() {
            record.template_id = template_id;
        }
        record.frames = frames.to_vec();
        record.result = Some(result.clone());
        record.effect = effect.map(str::to_string);
        record.saved_at = Utc::now();
        self.persist_current().await;
        info!(%session_id, effect = ?effect, "session result handed off");
    }

    /// In-process record first, then the persisted copy.
    pub async fn load_for_results(&self) -> Result<HandoffRecord, HandoffError> {
        if let Some(record) = self.current.as_ref().filter(|record| record.has_content()) {
            return Ok(record.clone());
        }
        match self.persistence.load_session().await {
            Ok(Some(record)) if record.has_content() => {
                info!(session_id = %record.session_id, "results restored from persisted hand-off");
                Ok(record)
            }
            Ok(_) => Err(HandoffError::NoHandoffData),
            Err(err) => {
                warn!(error = %err, "persisted hand-off unreadable");
                Err(HandoffError::NoHandoffData)
            }
        }
    }

    /// Drops session data. The template selection survives.
    pub async fn clear_session(&mut self) {
        self.current = None;
        if let Err(err) = self.persistence.clear_session().await {
            warn!(error = %err, "failed to clear persisted hand-off");
        }
    }

    fn record_for(&mut self, session_id: Uuid) -> &mut HandoffRecord {
        let stale = self
            .current
            .as_ref()
            .is_some_and(|record| record.session_id != session_id);
        if stale {
            self.current = None;
        }
        self.current
            .get_or_insert_with(|| HandoffRecord::new(session_id))
    }

    async fn persist_current(&self) {
        let Some(record) = self.current.as_ref() else {
            return;
        };
        if let Err(err) = self.persistence.save_session(record).await {
            warn!(session_id = %record.session_id, error = %err, "failed to persist session hand-off");
        }
    }
}
