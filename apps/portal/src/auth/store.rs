//! Fallback store: synchronous key/value persistence behind local mode.
//!
//! In `Local` mode the record held here IS the identity. In `Remote` mode it is
//! a best-effort cache of role and display name. Only the session resolver
//! writes to it.
//!
//! There are no multi-key transactions: writers order their writes so the
//! authentication flag goes last on login and first on logout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::models::identity::Role;

const PASS_THROUGH_PREFIX: &str = "passthrough:";

/// Logical keys of the fallback record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FallbackKey {
    Authenticated,
    UserId,
    Email,
    DisplayName,
    Role,
    /// The remote provider's serialized session, restored on restart.
    ProviderSession,
    /// Identifiers other subsystems carry alongside identity (e.g. `candidateId`).
    PassThrough(String),
}

impl FallbackKey {
    pub fn storage_key(&self) -> String {
        match self {
            FallbackKey::Authenticated => "isAuthenticated".to_string(),
            FallbackKey::UserId => "userId".to_string(),
            FallbackKey::Email => "userEmail".to_string(),
            FallbackKey::DisplayName => "userName".to_string(),
            FallbackKey::Role => "userRole".to_string(),
            FallbackKey::ProviderSession => "authSession".to_string(),
            FallbackKey::PassThrough(name) => format!("{PASS_THROUGH_PREFIX}{name}"),
        }
    }
}

/// Persistent, synchronous key/value storage. Operations are treated as
/// non-failing; implementations log their own faults.
pub trait FallbackStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    fn clear(&self);
    fn keys(&self) -> Vec<String>;
}

/// Typed helpers over a raw store.
pub trait FallbackStoreExt {
    fn get_field(&self, key: &FallbackKey) -> Option<String>;
    fn set_field(&self, key: &FallbackKey, value: &str);
    fn remove_field(&self, key: &FallbackKey);
    fn is_authenticated(&self) -> bool;
}

impl<S: FallbackStore + ?Sized> FallbackStoreExt for S {
    fn get_field(&self, key: &FallbackKey) -> Option<String> {
        self.get(&key.storage_key())
    }

    fn set_field(&self, key: &FallbackKey, value: &str) {
        debug!("fallback store set {}", key.storage_key());
        self.set(&key.storage_key(), value);
    }

    fn remove_field(&self, key: &FallbackKey) {
        self.remove(&key.storage_key());
    }

    fn is_authenticated(&self) -> bool {
        self.get_field(&FallbackKey::Authenticated).as_deref() == Some("true")
    }
}

/// A one-shot read of every identity field in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackRecord {
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub pass_through: HashMap<String, String>,
}

impl FallbackRecord {
    pub fn load(store: &dyn FallbackStore) -> Self {
        let pass_through = store
            .keys()
            .into_iter()
            .filter_map(|key| {
                let name = key.strip_prefix(PASS_THROUGH_PREFIX)?.to_string();
                store.get(&key).map(|value| (name, value))
            })
            .collect();

        Self {
            authenticated: store.is_authenticated(),
            user_id: non_empty(store.get_field(&FallbackKey::UserId)),
            email: non_empty(store.get_field(&FallbackKey::Email)),
            display_name: non_empty(store.get_field(&FallbackKey::DisplayName)),
            role: non_empty(store.get_field(&FallbackKey::Role)),
            pass_through,
        }
    }

    /// Cached role, with anything outside the closed set mapped to `Unresolved`.
    pub fn role(&self) -> Role {
        Role::from_optional(self.role.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        *self == FallbackRecord::default()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// ────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ────────────────────────────────────────────────────────────────────────────

/// In-process store. Used when no persistence path is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FallbackStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FileStore
// ────────────────────────────────────────────────────────────────────────────

/// A JSON object on disk, loaded once and written through on every mutation.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read fallback store at {}", path.display()))?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw).with_context(|| {
                    format!("Fallback store at {} is not a JSON object", path.display())
                })?
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) {
        if let Err(e) = write_atomic(&self.path, entries) {
            error!("Failed to persist fallback store: {e:?}");
        }
    }
}

fn write_atomic(path: &Path, entries: &HashMap<String, String>) -> Result<()> {
    let body = serde_json::to_vec_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

impl FallbackStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.persist(&entries);
        }
    }

    fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.persist(&entries);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_load_reads_all_fields() {
        let store = MemoryStore::new();
        store.set_field(&FallbackKey::UserId, "u-9");
        store.set_field(&FallbackKey::Email, "c@d.com");
        store.set_field(&FallbackKey::Role, "client");
        store.set_field(&FallbackKey::PassThrough("candidateId".into()), "cand-1");
        store.set_field(&FallbackKey::Authenticated, "true");

        let record = FallbackRecord::load(&store);
        assert!(record.authenticated);
        assert_eq!(record.user_id.as_deref(), Some("u-9"));
        assert_eq!(record.role(), Role::Client);
        assert_eq!(record.display_name, None);
        assert_eq!(
            record.pass_through.get("candidateId").map(String::as_str),
            Some("cand-1")
        );
    }

    #[test]
    fn test_garbage_role_reads_as_unresolved() {
        let store = MemoryStore::new();
        store.set_field(&FallbackKey::Role, "overlord");
        assert_eq!(FallbackRecord::load(&store).role(), Role::Unresolved);
    }

    #[test]
    fn test_authenticated_flag_requires_literal_true() {
        let store = MemoryStore::new();
        store.set_field(&FallbackKey::Authenticated, "yes");
        assert!(!store.is_authenticated());
        store.set_field(&FallbackKey::Authenticated, "true");
        assert!(store.is_authenticated());
    }

    #[test]
    fn test_clear_empties_record() {
        let store = MemoryStore::new();
        store.set_field(&FallbackKey::Email, "x@y.z");
        store.set_field(&FallbackKey::PassThrough("candidateId".into()), "1");
        store.clear();
        assert!(FallbackRecord::load(&store).is_empty());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set_field(&FallbackKey::Email, "a@b.com");
            store.set_field(&FallbackKey::Authenticated, "true");
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("userEmail").as_deref(), Some("a@b.com"));
        assert!(reopened.is_authenticated());

        reopened.clear();
        let again = FileStore::open(&path).unwrap();
        assert!(again.keys().is_empty());
    }

    #[test]
    fn test_file_store_rejects_non_object_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
