use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use geocopilot_types::{ErrorKind, LogEvent, Operation};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::capability::validate;
use crate::datasource::{DataSource, FeatureEdit, Field, Geometry, NewFeature};
use crate::runtime::{RunOutput, ScriptFault};

/// System-wide single-writer table: at most one open edit session per source.
#[derive(Clone, Default)]
pub struct EditRegistry {
    holders: Arc<Mutex<HashMap<String, String>>>,
    released: Arc<Notify>,
}

impl EditRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // entries are plain strings; a poisoned table is still consistent
    fn table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn holder(&self, source_id: &str) -> Option<String> {
        self.table().get(source_id).cloned()
    }

    pub fn try_acquire(&self, source_id: &str, run_id: &str) -> Option<EditLease> {
        let mut holders = self.table();
        if holders.contains_key(source_id) {
            return None;
        }
        holders.insert(source_id.to_string(), run_id.to_string());
        Some(EditLease {
            registry: self.clone(),
            source_id: source_id.to_string(),
        })
    }

    /// Waits until the source has no open session. Callers bound the wait.
    pub async fn acquire(&self, source_id: &str, run_id: &str) -> EditLease {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if let Some(lease) = self.try_acquire(source_id, run_id) {
                return lease;
            }
            tracing::debug!(
                "run {run_id} waiting for edit session on `{source_id}` held by {:?}",
                self.holder(source_id)
            );
            released.await;
        }
    }

    fn release(&self, source_id: &str) {
        self.table().remove(source_id);
        self.released.notify_waiters();
    }
}

pub struct EditLease {
    registry: EditRegistry,
    source_id: String,
}

impl Drop for EditLease {
    fn drop(&mut self) {
        self.registry.release(&self.source_id);
    }
}

/// Buffered, atomic edits against one source.
///
/// Nothing reaches the source until [`EditSession::commit`]. Dropping an
/// uncommitted session discards the buffer, which is how faults, timeouts and
/// cancellation roll back.
pub struct EditSession {
    request_id: String,
    source: Arc<dyn DataSource>,
    edits: Vec<FeatureEdit>,
    log: Option<mpsc::UnboundedSender<RunOutput>>,
    finished: bool,
    _lease: EditLease,
}

impl EditSession {
    pub(crate) fn open(
        request_id: &str,
        source: Arc<dyn DataSource>,
        lease: EditLease,
        log: Option<mpsc::UnboundedSender<RunOutput>>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            source,
            edits: Vec::new(),
            log,
            finished: false,
            _lease: lease,
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    pub fn pending(&self) -> usize {
        self.edits.len()
    }

    fn check(&self, operation: Operation) -> Result<(), ScriptFault> {
        let report = validate(&self.request_id, Some(self.source.as_ref()), &operation);
        match report.reason_if_invalid {
            Some(kind) => Err(ScriptFault::new(kind, report.detail)),
            None => Ok(()),
        }
    }

    fn check_geometry(geometry: &Geometry) -> Result<(), ScriptFault> {
        if geometry.is_valid() {
            Ok(())
        } else {
            Err(ScriptFault::new(
                ErrorKind::InvalidGeometry,
                format!("invalid geometry: {geometry:?}"),
            ))
        }
    }

    pub fn add_feature(&mut self, feature: NewFeature) -> Result<(), ScriptFault> {
        self.check(Operation::AddFeatures)?;
        if let Some(geometry) = &feature.geometry {
            Self::check_geometry(geometry)?;
        }
        self.edits.push(FeatureEdit::AddFeature { feature });
        Ok(())
    }

    pub fn delete_feature(&mut self, id: u64) -> Result<(), ScriptFault> {
        self.check(Operation::DeleteFeatures)?;
        self.edits.push(FeatureEdit::DeleteFeature { id });
        Ok(())
    }

    pub fn change_attribute(
        &mut self,
        id: u64,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), ScriptFault> {
        self.check(Operation::ChangeAttributes)?;
        self.edits.push(FeatureEdit::ChangeAttribute {
            id,
            name: name.into(),
            value,
        });
        Ok(())
    }

    pub fn add_attribute(&mut self, field: Field) -> Result<(), ScriptFault> {
        self.check(Operation::AddAttributes)?;
        self.edits.push(FeatureEdit::AddAttribute { field });
        Ok(())
    }

    pub fn change_geometry(&mut self, id: u64, geometry: Geometry) -> Result<(), ScriptFault> {
        self.check(Operation::ChangeGeometries)?;
        Self::check_geometry(&geometry)?;
        self.edits.push(FeatureEdit::ChangeGeometry { id, geometry });
        Ok(())
    }

    /// Applies the whole buffer atomically. On error the source is unchanged.
    pub fn commit(mut self) -> Result<usize, ScriptFault> {
        self.finished = true;
        let edits = std::mem::take(&mut self.edits);
        if edits.is_empty() {
            return Ok(0);
        }
        self.source
            .apply_edits(&edits)
            .map_err(|err| ScriptFault::from_source_error(self.source.id(), err))?;
        tracing::debug!("committed {} edits to `{}`", edits.len(), self.source.id());
        Ok(edits.len())
    }

    pub fn rollback(mut self) -> usize {
        self.finished = true;
        let discarded = self.edits.len();
        self.edits.clear();
        discarded
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let discarded = self.edits.len();
        let text = format!(
            "edit session on `{}` rolled back ({discarded} pending edits discarded)",
            self.source.id()
        );
        tracing::info!("{text}");
        if let Some(log) = &self.log {
            let _ = log.send(RunOutput::Event(LogEvent::warning(text)));
        }
    }
}
