//! Project state persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::{ProjectId, ProjectState, ProjectSummary};
use crate::util::blocking;
use crate::{Error, Result};

const STATE_FILE: &str = "state.json";

/// Storage backend for project snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a full snapshot, replacing any previous one.
    async fn save(&self, state: &ProjectState) -> Result<()>;

    /// # Errors
    /// Returns `Error::ProjectNotFound` if no snapshot exists.
    async fn load(&self, id: &ProjectId) -> Result<ProjectState>;

    /// Summaries of all stored projects, most recently updated first.
    async fn list(&self) -> Result<Vec<ProjectSummary>>;

    /// Remove a project. Deleting an unknown project is not an error.
    async fn delete(&self, id: &ProjectId) -> Result<()>;
}

/// Stores each project as `<root>/<project-id>/state.json`.
///
/// Writes go to `state.json.tmp` and are renamed into place; the previous
/// snapshot is kept as `state.json.bak` and used if the main file is
/// unreadable.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    root: PathBuf,
}

impl JsonStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, id: &ProjectId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn state_path(&self, id: &ProjectId) -> PathBuf {
        self.project_dir(id).join(STATE_FILE)
    }

    fn read_snapshot(path: &Path) -> Result<ProjectState> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn load_sync(state_path: &Path) -> Result<Option<ProjectState>> {
        let backup_path = state_path.with_extension("json.bak");
        if !state_path.exists() && !backup_path.exists() {
            return Ok(None);
        }

        match Self::read_snapshot(state_path) {
            Ok(state) => Ok(Some(state)),
            Err(e) if backup_path.exists() => {
                warn!(
                    path = %state_path.display(),
                    error = %e,
                    "State file unreadable, falling back to backup"
                );
                Self::read_snapshot(&backup_path).map(Some)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn save(&self, state: &ProjectState) -> Result<()> {
        debug!(project = %state.id.short(), tasks = state.tasks().len(), "Saving project state");
        let contents = serde_json::to_string_pretty(state)?;
        let project_dir = self.project_dir(&state.id);

        blocking(move || {
            if !project_dir.exists() {
                debug!(dir = %project_dir.display(), "Creating project directory");
                fs::create_dir_all(&project_dir)?;
            }

            let state_path = project_dir.join(STATE_FILE);
            if state_path.exists() {
                let backup_path = state_path.with_extension("json.bak");
                fs::copy(&state_path, &backup_path)?;
            }

            let temp_path = state_path.with_extension("json.tmp");
            fs::write(&temp_path, &contents)?;
            fs::rename(&temp_path, &state_path)?;
            debug!(path = %state_path.display(), "Project state saved");
            Ok(())
        })
        .await
    }

    async fn load(&self, id: &ProjectId) -> Result<ProjectState> {
        let state_path = self.state_path(id);
        let id = *id;
        blocking(move || {
            JsonStateStore::load_sync(&state_path)?
                .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<ProjectSummary>> {
        let root = self.root.clone();
        blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut summaries = Vec::new();
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let path = entry.path().join(STATE_FILE);
                match JsonStateStore::load_sync(&path) {
                    Ok(Some(state)) => summaries.push(state.summary()),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable project");
                    }
                }
            }
            summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(summaries)
        })
        .await
    }

    async fn delete(&self, id: &ProjectId) -> Result<()> {
        let dir = self.project_dir(id);
        blocking(move || {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
                debug!(dir = %dir.display(), "Project state deleted");
            }
            Ok(())
        })
        .await
    }
}

/// Keeps snapshots in memory. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    projects: Arc<RwLock<HashMap<ProjectId, ProjectState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.projects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.projects.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, state: &ProjectState) -> Result<()> {
        self.projects.write().await.insert(state.id, state.clone());
        Ok(())
    }

    async fn load(&self, id: &ProjectId) -> Result<ProjectState> {
        self.projects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<ProjectSummary>> {
        let mut summaries: Vec<ProjectSummary> = self
            .projects
            .read()
            .await
            .values()
            .map(ProjectState::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, id: &ProjectId) -> Result<()> {
        self.projects.write().await.remove(id);
        Ok(())
    }
}
