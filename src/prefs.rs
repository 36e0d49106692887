// Persistent per-chat preferences
//
// The whole document is rewritten on every mutation: serialized to
// `<path>.tmp`, then renamed over `<path>`. The cache only ever holds what
// is on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const PREFS_FILE_NAME: &str = "prefs.json";
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize preferences: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

/// On-disk layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefsDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    /// chat id -> user id -> opted out; only `true` entries are kept
    #[serde(default, alias = "opt_out")]
    pub opt_out: BTreeMap<i64, BTreeMap<i64, bool>>,
    #[serde(default)]
    pub welcomed_groups: BTreeSet<i64>,
    #[serde(default)]
    pub welcomed_users: BTreeSet<i64>,
}

impl Default for PrefsDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            opt_out: BTreeMap::new(),
            welcomed_groups: BTreeSet::new(),
            welcomed_users: BTreeSet::new(),
        }
    }
}

impl PrefsDocument {
    fn is_opted_out(&self, chat_id: i64, user_id: i64) -> bool {
        self.opt_out
            .get(&chat_id)
            .and_then(|users| users.get(&user_id))
            .copied()
            .unwrap_or(false)
    }

    fn toggle_opt_out(&mut self, chat_id: i64, user_id: i64) -> bool {
        let new_value = !self.is_opted_out(chat_id, user_id);
        let users = self.opt_out.entry(chat_id).or_default();
        if new_value {
            users.insert(user_id, true);
        } else {
            users.remove(&user_id);
        }
        if users.is_empty() {
            self.opt_out.remove(&chat_id);
        }
        new_value
    }

    fn welcomed(&self, scope: WelcomeScope) -> &BTreeSet<i64> {
        match scope {
            WelcomeScope::Group => &self.welcomed_groups,
            WelcomeScope::User => &self.welcomed_users,
        }
    }

    fn welcomed_mut(&mut self, scope: WelcomeScope) -> &mut BTreeSet<i64> {
        match scope {
            WelcomeScope::Group => &mut self.welcomed_groups,
            WelcomeScope::User => &mut self.welcomed_users,
        }
    }
}

/// Which one-time greeting a marker refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelcomeScope {
    Group,
    User,
}

/// Crash-safe preference store. One lock spans read-modify-persist.
pub struct PreferenceStore {
    path: PathBuf,
    cache: Mutex<Option<PrefsDocument>>,
}

impl PreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Store at `<data_dir>/prefs.json`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(PREFS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    pub async fn is_opted_out(&self, chat_id: i64, user_id: i64) -> bool {
        let mut guard = self.cache.lock().await;
        self.loaded(&mut guard).await.is_opted_out(chat_id, user_id)
    }

    /// Flip the sender's opt-out flag. Returns the new state.
    pub async fn toggle_opt_out(&self, chat_id: i64, user_id: i64) -> Result<bool, PrefsError> {
        let new_state = self
            .mutate(|doc| doc.toggle_opt_out(chat_id, user_id))
            .await?;
        info!(chat_id, user_id, opted_out = new_state, "opt-out toggled");
        Ok(new_state)
    }

    pub async fn was_welcomed(&self, scope: WelcomeScope, id: i64) -> bool {
        let mut guard = self.cache.lock().await;
        self.loaded(&mut guard).await.welcomed(scope).contains(&id)
    }

    /// Record the marker. Returns false when it was already set (no write).
    pub async fn mark_welcomed(&self, scope: WelcomeScope, id: i64) -> Result<bool, PrefsError> {
        if self.was_welcomed(scope, id).await {
            return Ok(false);
        }
        self.mutate(|doc| doc.welcomed_mut(scope).insert(id)).await
    }

    /// Copy of the committed document
    pub async fn snapshot(&self) -> PrefsDocument {
        let mut guard = self.cache.lock().await;
        self.loaded(&mut guard).await.clone()
    }

    /// Apply `f` to a copy, persist it, and only then swap it into the cache.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut PrefsDocument) -> T,
    ) -> Result<T, PrefsError> {
        let mut guard = self.cache.lock().await;
        let mut next = self.loaded(&mut guard).await.clone();
        let out = f(&mut next);
        self.persist(&next).await?;
        *guard = Some(next);
        Ok(out)
    }

    async fn loaded<'a>(&self, slot: &'a mut Option<PrefsDocument>) -> &'a PrefsDocument {
        if slot.is_none() {
            *slot = Some(self.load().await);
        }
        slot.get_or_insert_with(PrefsDocument::default)
    }

    /// Read the committed file. Missing or corrupt files yield an empty
    /// document, which is written back.
    async fn load(&self) -> PrefsDocument {
        let parsed = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str::<PrefsDocument>(&raw) {
                Ok(doc) => {
                    debug!(path = %self.path.display(), "preferences loaded");
                    return doc;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "corrupt preferences, starting empty");
                    PrefsDocument::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PrefsDocument::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable preferences, starting empty");
                PrefsDocument::default()
            }
        };

        if let Err(e) = self.persist(&parsed).await {
            warn!(error = %e, "failed to write initial preferences");
        }
        parsed
    }

    async fn persist(&self, doc: &PrefsDocument) -> Result<(), PrefsError> {
        let io_err = |path: &Path, source| PrefsError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }

        let body = serde_json::to_string_pretty(doc)?;
        let tmp = self.tmp_path();

        if let Err(e) = tokio::fs::write(&tmp, body).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&tmp, e));
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_err(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> PreferenceStore {
        PreferenceStore::in_dir(dir.path())
    }

    async fn read_file(store: &PreferenceStore) -> PrefsDocument {
        let raw = tokio::fs::read_to_string(store.path()).await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::in_dir(&dir.path().join("nested"));

        assert!(!store.is_opted_out(1, 2).await);
        assert_eq!(read_file(&store).await, PrefsDocument::default());
    }

    #[tokio::test]
    async fn test_toggle_pairs_and_stays_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        assert!(store.toggle_opt_out(-100, 7).await.unwrap());
        assert!(store.is_opted_out(-100, 7).await);
        assert!(!store.is_opted_out(-100, 8).await);
        assert_eq!(read_file(&store).await.opt_out[&-100][&7], true);

        assert!(!store.toggle_opt_out(-100, 7).await.unwrap());
        assert!(!store.is_opted_out(-100, 7).await);
        assert!(read_file(&store).await.opt_out.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_keeps_other_users() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store.toggle_opt_out(1, 10).await.unwrap();
        store.toggle_opt_out(1, 11).await.unwrap();
        store.toggle_opt_out(1, 10).await.unwrap();

        let doc = read_file(&store).await;
        assert_eq!(doc.opt_out[&1].len(), 1);
        assert!(doc.opt_out[&1][&11]);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_cache_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        assert!(store.toggle_opt_out(5, 6).await.unwrap());
        let committed = tokio::fs::read_to_string(store.path()).await.unwrap();

        // a directory in the temp file's place makes the write fail
        tokio::fs::create_dir(store.tmp_path()).await.unwrap();

        assert!(store.toggle_opt_out(5, 6).await.is_err());
        assert!(store.is_opted_out(5, 6).await);
        assert!(store.mark_welcomed(WelcomeScope::User, 6).await.is_err());
        assert!(!store.was_welcomed(WelcomeScope::User, 6).await);
        assert_eq!(tokio::fs::read_to_string(store.path()).await.unwrap(), committed);
    }

    #[tokio::test]
    async fn test_stale_temp_file_is_ignored_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(&dir);
            store.toggle_opt_out(1, 2).await.unwrap();
            store.mark_welcomed(WelcomeScope::Group, -1).await.unwrap();
            tokio::fs::write(store.tmp_path(), b"{\"optOut\": {\"1\": {")
                .await
                .unwrap();
        }

        let reloaded = store(&dir);
        assert!(reloaded.is_opted_out(1, 2).await);
        assert!(reloaded.was_welcomed(WelcomeScope::Group, -1).await);
    }

    #[tokio::test]
    async fn test_corrupt_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        tokio::fs::write(store.path(), b"not json").await.unwrap();

        assert!(!store.is_opted_out(1, 2).await);
        assert_eq!(read_file(&store).await, PrefsDocument::default());
    }

    #[tokio::test]
    async fn test_legacy_key_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        tokio::fs::write(store.path(), br#"{"version": 1, "opt_out": {"-42": {"9": true}}}"#)
            .await
            .unwrap();

        assert!(store.is_opted_out(-42, 9).await);
        assert!(!store.was_welcomed(WelcomeScope::User, 9).await);
    }

    #[tokio::test]
    async fn test_mark_welcomed_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        assert!(store.mark_welcomed(WelcomeScope::User, 3).await.unwrap());
        assert!(!store.mark_welcomed(WelcomeScope::User, 3).await.unwrap());
        assert!(store.was_welcomed(WelcomeScope::User, 3).await);
        assert!(!store.was_welcomed(WelcomeScope::Group, 3).await);
        assert_eq!(read_file(&store).await.welcomed_users.len(), 1);
    }

    #[tokio::test]
    async fn test_document_layout() {
        let mut doc = PrefsDocument::default();
        doc.toggle_opt_out(1, 2);
        doc.welcomed_groups.insert(-5);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["optOut"]["1"]["2"], true);
        assert_eq!(json["welcomedGroups"][0], -5);
        assert!(json["welcomedUsers"].as_array().unwrap().is_empty());
    }
}
