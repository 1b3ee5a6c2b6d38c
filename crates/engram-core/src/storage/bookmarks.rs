//! Bookmark Store
//!
//! Named saved searches (query + filter map). Usage counters are bumped by
//! `use_bookmark`; everything else is plain CRUD over `bookmarks.json`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::{Result, StorageError};
use crate::memory::Metadata;

const FILE_VERSION: u32 = 1;

/// A saved search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBookmark {
    pub id: String,
    /// Unique name
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub filters: Metadata,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct BookmarksFile {
    version: u32,
    last_updated: DateTime<Utc>,
    bookmarks: Vec<SearchBookmark>,
}

/// File-backed bookmark registry.
pub struct BookmarkStore {
    path: Option<PathBuf>,
    inner: Mutex<Vec<SearchBookmark>>,
}

impl BookmarkStore {
    /// Open the store, loading `bookmarks.json` when present.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let bookmarks = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BookmarksFile>(&raw) {
                Ok(file) => file.bookmarks,
                Err(e) => {
                    warn!("corrupt bookmarks.json, starting empty: {e}");
                    vec![]
                }
            },
            Err(_) => vec![],
        };

        Self {
            path: Some(path),
            inner: Mutex::new(bookmarks),
        }
    }

    /// Purely in-memory store (tests).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(vec![]),
        }
    }

    /// Create a bookmark. Names are unique.
    pub fn create(&self, name: &str, query: &str, filters: Metadata) -> Result<SearchBookmark> {
        if name.trim().is_empty() || query.trim().is_empty() {
            return Err(StorageError::InvalidInput(
                "bookmark name and query are required".to_string(),
            ));
        }

        let mut bookmarks = self.inner.lock().expect("bookmark store lock poisoned");
        if bookmarks.iter().any(|b| b.name == name.trim()) {
            return Err(StorageError::InvalidInput(format!(
                "bookmark name already exists: {name}"
            )));
        }

        let bookmark = SearchBookmark {
            id: format!("bm-{}", &Uuid::new_v4().simple().to_string()[..12]),
            name: name.trim().to_string(),
            query: query.to_string(),
            filters,
            usage_count: 0,
            last_used: None,
            created_at: Utc::now(),
        };
        bookmarks.push(bookmark.clone());
        self.save(&bookmarks)?;
        Ok(bookmark)
    }

    pub fn get(&self, bookmark_id: &str) -> Option<SearchBookmark> {
        let bookmarks = self.inner.lock().expect("bookmark store lock poisoned");
        bookmarks.iter().find(|b| b.id == bookmark_id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<SearchBookmark> {
        let bookmarks = self.inner.lock().expect("bookmark store lock poisoned");
        bookmarks.iter().find(|b| b.name == name.trim()).cloned()
    }

    pub fn list(&self) -> Vec<SearchBookmark> {
        self.inner.lock().expect("bookmark store lock poisoned").clone()
    }

    /// Record a use and return the refreshed bookmark.
    pub fn record_use(&self, bookmark_id: &str) -> Result<SearchBookmark> {
        let mut bookmarks = self.inner.lock().expect("bookmark store lock poisoned");
        let Some(bookmark) = bookmarks.iter_mut().find(|b| b.id == bookmark_id) else {
            return Err(StorageError::NotFound(bookmark_id.to_string()));
        };
        bookmark.usage_count += 1;
        bookmark.last_used = Some(Utc::now());
        let updated = bookmark.clone();
        self.save(&bookmarks)?;
        Ok(updated)
    }

    pub fn delete(&self, bookmark_id: &str) -> Result<bool> {
        let mut bookmarks = self.inner.lock().expect("bookmark store lock poisoned");
        let before = bookmarks.len();
        bookmarks.retain(|b| b.id != bookmark_id);
        let removed = bookmarks.len() != before;
        if removed {
            self.save(&bookmarks)?;
        }
        Ok(removed)
    }

    fn save(&self, bookmarks: &[SearchBookmark]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = BookmarksFile {
            version: FILE_VERSION,
            last_updated: Utc::now(),
            bookmarks: bookmarks.to_vec(),
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
