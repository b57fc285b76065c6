//! Loaded playbook definitions and event matching.
//!
//! Definitions come from `playbooks.json`. The live set is swapped
//! atomically on reload; reactor executions keep whatever snapshot they
//! started with.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::domain::models::{Event, Playbook, PlaybookError};

/// Atomic, hot-reloadable set of playbooks.
pub struct PlaybookLibrary {
    current: RwLock<Arc<Vec<Arc<Playbook>>>>,
    path: Option<PathBuf>,
}

impl PlaybookLibrary {
    pub fn empty() -> Self {
        Self {
            current: RwLock::new(Arc::new(Vec::new())),
            path: None,
        }
    }

    /// Load definitions from a `playbooks.json` file. A missing file yields
    /// an empty library (remediation simply stays inert).
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, PlaybookError> {
        let path = path.as_ref().to_path_buf();
        let library = Self {
            current: RwLock::new(Arc::new(Vec::new())),
            path: Some(path),
        };
        library.reload().await?;
        Ok(library)
    }

    /// Replace the live set with definitions parsed from JSON.
    pub async fn load_definitions(&self, playbooks: Vec<Playbook>) -> Result<usize, PlaybookError> {
        for playbook in &playbooks {
            playbook.validate()?;
        }
        let count = playbooks.len();
        let next: Arc<Vec<Arc<Playbook>>> = Arc::new(playbooks.into_iter().map(Arc::new).collect());
        *self.current.write().await = next;
        Ok(count)
    }

    /// Re-read the backing file and swap atomically. In-flight executions
    /// keep the snapshot they matched against.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<usize, PlaybookError> {
        let Some(path) = &self.path else {
            return Ok(self.current.read().await.len());
        };
        if !path.exists() {
            info!(path = %path.display(), "no playbook file, library stays empty");
            *self.current.write().await = Arc::new(Vec::new());
            return Ok(0);
        }
        let body = std::fs::read_to_string(path)?;
        let playbooks: Vec<Playbook> = serde_json::from_str(&body)?;
        let count = self.load_definitions(playbooks).await?;
        info!(count, "playbook library reloaded");
        Ok(count)
    }

    /// Playbooks matching an event, evaluated in declared order.
    /// First match wins: a matching playbook without `multi_match` stops the
    /// scan; matches with `multi_match` let later playbooks match too.
    pub async fn match_event(&self, event: &Event) -> Vec<Arc<Playbook>> {
        let current = self.current.read().await.clone();
        let mut matched = Vec::new();
        for playbook in current.iter() {
            if playbook.trigger.matches(event) {
                let stop = !playbook.multi_match;
                matched.push(playbook.clone());
                if stop {
                    break;
                }
            }
        }
        matched
    }

    /// Snapshot of the live set.
    pub async fn snapshot(&self) -> Arc<Vec<Arc<Playbook>>> {
        self.current.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.current.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.current.read().await.is_empty()
    }
}
