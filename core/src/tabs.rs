//! Persistent JSON documents under the daemon's data directory: the tab index plus the
//! favorites and commands stores the external UI contract also expects. Each
//! is read-modify-written as a whole file under a single-writer lock, atomically
//! (write to `.tmp`, then rename).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::HubError;
use crate::session::unix_now_secs;

fn write_atomic(path: &Path, data: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Create `dir` with owner-only permissions if it does not exist yet.
pub fn ensure_data_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_file(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) {}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tab {
    pub id: String,
    pub name: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct TabsDocument {
    tabs: Vec<Tab>,
    #[serde(rename = "lastModified")]
    last_modified: u64,
}

impl TabsDocument {
    fn default_with_one_tab() -> Self {
        Self {
            tabs: vec![Tab {
                id: uuid::Uuid::new_v4().to_string(),
                name: "Terminal 1".to_string(),
                session_id: None,
            }],
            last_modified: unix_now_secs(),
        }
    }
}

/// The tab index: `{ tabs: [{id, name, sessionId}], lastModified }` at `tabs.json`.
pub struct TabStore {
    path: PathBuf,
    doc: Mutex<TabsDocument>,
    max_tabs: usize,
}

impl TabStore {
    pub fn load(data_dir: &Path, max_tabs: usize) -> Self {
        let path = data_dir.join("tabs.json");
        let doc = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<TabsDocument>(&raw).ok())
            .filter(|d| !d.tabs.is_empty())
            .unwrap_or_else(TabsDocument::default_with_one_tab);
        let store = Self {
            path,
            doc: Mutex::new(doc),
            max_tabs,
        };
        // On startup, sessions do not outlive the daemon: clear every session_id.
        store.reset_sessions();
        store
    }

    fn persist(&self, doc: &TabsDocument) -> Result<(), HubError> {
        let data = serde_json::to_string_pretty(doc)
            .map_err(|e| HubError::Transient(format!("serialize tabs.json: {e}")))?;
        write_atomic(&self.path, &data)
            .map_err(|e| HubError::Transient(format!("write tabs.json: {e}")))?;
        restrict_file(&self.path);
        Ok(())
    }

    pub fn get(&self) -> Vec<Tab> {
        self.doc.lock().expect("tabs mutex").tabs.clone()
    }

    fn with_doc_mut<R>(&self, f: impl FnOnce(&mut TabsDocument) -> Result<R, HubError>) -> Result<R, HubError> {
        let mut guard = self.doc.lock().expect("tabs mutex");
        let result = f(&mut guard)?;
        guard.last_modified = unix_now_secs();
        self.persist(&guard)?;
        Ok(result)
    }

    /// Idempotent when `id` already exists.
    pub fn add(&self, id: Option<String>, name: Option<String>) -> Result<Tab, HubError> {
        self.with_doc_mut(|doc| {
            if let Some(ref id) = id {
                if let Some(existing) = doc.tabs.iter().find(|t| &t.id == id) {
                    return Ok(existing.clone());
                }
            }
            if doc.tabs.len() >= self.max_tabs {
                return Err(HubError::Conflict(format!("max tab count {} exceeded", self.max_tabs)));
            }
            let tab = Tab {
                id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: name.unwrap_or_else(|| format!("Terminal {}", doc.tabs.len() + 1)),
                session_id: None,
            };
            doc.tabs.push(tab.clone());
            Ok(tab)
        })
    }

    /// Removing the last tab auto-creates a fresh default tab.
    pub fn remove(&self, id: &str) -> Result<(), HubError> {
        self.with_doc_mut(|doc| {
            doc.tabs.retain(|t| t.id != id);
            if doc.tabs.is_empty() {
                doc.tabs.push(Tab {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: "Terminal 1".to_string(),
                    session_id: None,
                });
            }
            Ok(())
        })
    }

    pub fn rename(&self, id: &str, name: String) -> Result<(), HubError> {
        self.with_doc_mut(|doc| {
            let tab = doc
                .tabs
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| HubError::NotFound(format!("tab {id}")))?;
            tab.name = name;
            Ok(())
        })
    }

    pub fn set_session(&self, id: &str, session_id: Option<String>) -> Result<(), HubError> {
        self.with_doc_mut(|doc| {
            let tab = doc
                .tabs
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| HubError::NotFound(format!("tab {id}")))?;
            tab.session_id = session_id;
            Ok(())
        })
    }

    pub fn reset_sessions(&self) {
        let mut guard = self.doc.lock().expect("tabs mutex");
        for tab in guard.tabs.iter_mut() {
            tab.session_id = None;
        }
        guard.last_modified = unix_now_secs();
        let _ = self.persist(&guard);
    }

    pub fn last_modified(&self) -> u64 {
        self.doc.lock().expect("tabs mutex").last_modified
    }
}

/// `{ items: [...], lastModified }` document shape shared by favorites.json and
/// commands.json — same atomic-write discipline as the tab index, minimal CRUD.
pub struct ItemListStore {
    path: PathBuf,
    items: Mutex<(Vec<serde_json::Value>, u64)>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ItemListDocument {
    items: Vec<serde_json::Value>,
    #[serde(rename = "lastModified")]
    last_modified: u64,
}

impl ItemListStore {
    pub fn load(data_dir: &Path, file_name: &str) -> Self {
        let path = data_dir.join(file_name);
        let doc = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<ItemListDocument>(&raw).ok())
            .unwrap_or(ItemListDocument { items: Vec::new(), last_modified: unix_now_secs() });
        Self {
            path,
            items: Mutex::new((doc.items, doc.last_modified)),
        }
    }

    pub fn list(&self) -> Vec<serde_json::Value> {
        self.items.lock().expect("items mutex").0.clone()
    }

    fn persist(&self, items: &[serde_json::Value], last_modified: u64) -> Result<(), HubError> {
        let doc = ItemListDocument { items: items.to_vec(), last_modified };
        let data = serde_json::to_string_pretty(&doc)
            .map_err(|e| HubError::Transient(format!("serialize {:?}: {e}", self.path)))?;
        write_atomic(&self.path, &data)
            .map_err(|e| HubError::Transient(format!("write {:?}: {e}", self.path)))?;
        restrict_file(&self.path);
        Ok(())
    }

    pub fn add(&self, item: serde_json::Value) -> Result<(), HubError> {
        let mut guard = self.items.lock().expect("items mutex");
        guard.0.push(item);
        guard.1 = unix_now_secs();
        self.persist(&guard.0, guard.1)
    }

    pub fn remove_where(&self, pred: impl Fn(&serde_json::Value) -> bool) -> Result<(), HubError> {
        let mut guard = self.items.lock().expect("items mutex");
        guard.0.retain(|v| !pred(v));
        guard.1 = unix_now_secs();
        self.persist(&guard.0, guard.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_one_default_tab() {
        let dir = tempfile::tempdir().unwrap();
        let store = TabStore::load(dir.path(), 10);
        assert_eq!(store.get().len(), 1);
    }

    #[test]
    fn add_is_idempotent_for_existing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = TabStore::load(dir.path(), 10);
        let first = store.add(Some("fixed".into()), Some("A".into())).unwrap();
        let second = store.add(Some("fixed".into()), Some("B renamed?".into())).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "A");
        assert_eq!(store.get().len(), 2);
    }

    #[test]
    fn max_tabs_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = TabStore::load(dir.path(), 2);
        store.add(None, None).unwrap();
        let err = store.add(None, None).unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));
    }

    #[test]
    fn removing_last_tab_recreates_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = TabStore::load(dir.path(), 10);
        let only = store.get().remove(0);
        store.remove(&only.id).unwrap();
        assert_eq!(store.get().len(), 1);
        assert_ne!(store.get()[0].id, only.id);
    }

    #[test]
    fn last_modified_strictly_increases_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = TabStore::load(dir.path(), 10);
        let before = store.last_modified();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        store.add(None, None).unwrap();
        assert!(store.last_modified() >= before);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TabStore::load(dir.path(), 10);
            store.add(Some("keep-me".into()), Some("Kept".into())).unwrap();
        }
        let reloaded = TabStore::load(dir.path(), 10);
        assert!(reloaded.get().iter().any(|t| t.id == "keep-me"));
    }

    #[test]
    fn reload_clears_session_ids() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TabStore::load(dir.path(), 10);
            let id = store.get()[0].id.clone();
            store.set_session(&id, Some("sess-1".into())).unwrap();
        }
        let reloaded = TabStore::load(dir.path(), 10);
        assert!(reloaded.get()[0].session_id.is_none());
    }
}
