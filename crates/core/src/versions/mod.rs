use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::WorkflowBackend;
use crate::diff::{compare_versions, VersionChange};
use crate::domain::module::Module;
use crate::domain::session::Session;
use crate::domain::version::VersionRecord;
use crate::errors::ApplicationError;

const FETCH_FAILURE_PREFIX: &str = "Failed to fetch version history";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionHistoryEntry {
    pub version: VersionRecord,
    pub is_current: bool,
    /// Changes relative to the next older entry in the list; `None` for the oldest.
    pub changes: Option<BTreeMap<String, VersionChange>>,
}

#[derive(Debug, Default)]
struct VersionState {
    versions: Vec<VersionRecord>,
    loading: bool,
    error: Option<String>,
}

/// Version log of one business record.
pub struct VersionHistoryStore<B> {
    backend: Arc<B>,
    session: Session,
    module: Module,
    record_id: String,
    state: RwLock<VersionState>,
}

impl<B> VersionHistoryStore<B>
where
    B: WorkflowBackend,
{
    pub fn new(backend: Arc<B>, session: Session, module: Module, record_id: impl Into<String>) -> Self {
        Self {
            backend,
            session,
            module,
            record_id: record_id.into(),
            state: RwLock::new(VersionState::default()),
        }
    }

    pub fn module(&self) -> Module {
        self.module
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Loads every version, highest `version_number` first.
    pub async fn fetch_versions(&self) -> Vec<VersionRecord> {
        self.write_state().loading = true;

        let result = match self.session.require() {
            Ok(session) => {
                self.backend.list_versions(&session.tenant_id, self.module, &self.record_id).await
            }
            Err(error) => Err(error),
        };

        let mut state = self.write_state();
        state.loading = false;
        match result {
            Ok(mut versions) => {
                versions.sort_by(|left, right| right.version_number.cmp(&left.version_number));
                state.versions = versions;
                state.error = None;
            }
            Err(error) => {
                warn!(
                    event_name = "version.fetch_failed",
                    module = %self.module,
                    record_id = %self.record_id,
                    error = %error,
                    "version history fetch failed"
                );
                state.error = Some(format!("{FETCH_FAILURE_PREFIX}: {error}"));
            }
        }
        state.versions.clone()
    }

    pub fn versions(&self) -> Vec<VersionRecord> {
        self.read_state().versions.clone()
    }

    pub fn current_version(&self) -> Option<VersionRecord> {
        self.read_state().versions.iter().find(|version| version.is_current).cloned()
    }

    pub fn get_version_by_number(&self, version_number: u32) -> Option<VersionRecord> {
        self.read_state()
            .versions
            .iter()
            .find(|version| version.version_number == version_number)
            .cloned()
    }

    /// Business-field changes from `from` to `to`; `None` if either is not loaded.
    pub fn compare_versions(&self, from: u32, to: u32) -> Option<BTreeMap<String, VersionChange>> {
        let state = self.read_state();
        let find = |number: u32| state.versions.iter().find(|version| version.version_number == number);
        Some(compare_versions(find(from)?, find(to)?))
    }

    /// Each loaded version paired with its diff against the next list element.
    ///
    /// Adjacency is by list position, so a gap in version numbers diffs against
    /// whatever older version is loaded next.
    pub fn version_history(&self) -> Vec<VersionHistoryEntry> {
        let state = self.read_state();
        state
            .versions
            .iter()
            .enumerate()
            .map(|(index, version)| VersionHistoryEntry {
                version: version.clone(),
                is_current: version.is_current,
                changes: state.versions.get(index + 1).map(|older| compare_versions(older, version)),
            })
            .collect()
    }

    /// Always refused: a version only becomes current through an approved request.
    pub fn restore_version(&self, version_number: u32) -> Result<(), ApplicationError> {
        if self.get_version_by_number(version_number).is_none() {
            return Err(ApplicationError::NotFound(format!(
                "version {version_number} of {} record `{}`",
                self.module, self.record_id
            )));
        }
        Err(ApplicationError::RestoreRequiresApproval { version_number })
    }

    pub fn last_error(&self) -> Option<String> {
        self.read_state().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.read_state().loading
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, VersionState> {
        match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, VersionState> {
        match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
