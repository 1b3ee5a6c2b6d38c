//! Project Store
//!
//! JSON-file-backed project registry. The core only touches counters and
//! timestamps (`memory_count`, `usage_count`, `last_accessed`); everything
//! else is managed through the CRUD surface.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Result, StorageError};

const FILE_VERSION: u32 = 1;

// ============================================================================
// TYPES
// ============================================================================

/// A project grouping memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    /// Unique, case-insensitive
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub memory_count: u64,
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct ProjectsFile {
    version: u32,
    last_updated: DateTime<Utc>,
    projects: Vec<Project>,
}

/// File-backed project registry.
pub struct ProjectStore {
    path: Option<PathBuf>,
    inner: Mutex<Vec<Project>>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl ProjectStore {
    /// Open the store, loading `projects.json` when present.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let projects = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<ProjectsFile>(&raw) {
                Ok(file) => file.projects,
                Err(e) => {
                    warn!("corrupt projects.json, starting empty: {e}");
                    vec![]
                }
            },
            Err(_) => vec![],
        };

        debug!(projects = projects.len(), "project store opened");
        Self {
            path: Some(path),
            inner: Mutex::new(projects),
        }
    }

    /// Purely in-memory store (tests).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(vec![]),
        }
    }

    /// Create a project. Names are unique case-insensitively.
    pub fn create(
        &self,
        name: &str,
        description: &str,
        tags: Vec<String>,
    ) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(StorageError::InvalidInput("project name is required".to_string()));
        }

        let mut projects = self.inner.lock().expect("project store lock poisoned");
        if projects
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(name.trim()))
        {
            return Err(StorageError::InvalidInput(format!(
                "project name already exists: {name}"
            )));
        }

        let now = Utc::now();
        let project = Project {
            id: format!("proj-{}", &Uuid::new_v4().simple().to_string()[..12]),
            name: name.trim().to_string(),
            description: description.to_string(),
            tags,
            memory_count: 0,
            usage_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed: None,
        };
        projects.push(project.clone());
        self.save(&projects)?;
        Ok(project)
    }

    pub fn get(&self, project_id: &str) -> Option<Project> {
        let projects = self.inner.lock().expect("project store lock poisoned");
        projects.iter().find(|p| p.id == project_id).cloned()
    }

    /// Case-insensitive name lookup.
    pub fn get_by_name(&self, name: &str) -> Option<Project> {
        let projects = self.inner.lock().expect("project store lock poisoned");
        projects
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
            .cloned()
    }

    pub fn list(&self) -> Vec<Project> {
        self.inner.lock().expect("project store lock poisoned").clone()
    }

    /// Delete a project. Returns whether anything was removed.
    pub fn delete(&self, project_id: &str) -> Result<bool> {
        let mut projects = self.inner.lock().expect("project store lock poisoned");
        let before = projects.len();
        projects.retain(|p| p.id != project_id);
        let removed = projects.len() != before;
        if removed {
            self.save(&projects)?;
        }
        Ok(removed)
    }

    /// Bump `memory_count` after an ingest lands in the project.
    pub fn increment_memory_count(&self, project_id: &str) -> Result<()> {
        self.touch(project_id, |p| p.memory_count += 1)
    }

    /// Record a project-scoped search.
    pub fn record_usage(&self, project_id: &str) -> Result<()> {
        self.touch(project_id, |p| {
            p.usage_count += 1;
            p.last_accessed = Some(Utc::now());
        })
    }

    fn touch(&self, project_id: &str, apply: impl FnOnce(&mut Project)) -> Result<()> {
        let mut projects = self.inner.lock().expect("project store lock poisoned");
        let Some(project) = projects.iter_mut().find(|p| p.id == project_id) else {
            return Err(StorageError::NotFound(project_id.to_string()));
        };
        apply(project);
        project.updated_at = Utc::now();
        self.save(&projects)
    }

    fn save(&self, projects: &[Project]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ProjectsFile {
            version: FILE_VERSION,
            last_updated: Utc::now(),
            projects: projects.to_vec(),
        };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
