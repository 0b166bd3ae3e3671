//! `pin-settings.json`: `{ pinEnabled, pinHash, themeName, updatedAt }`. The PIN/login
//! gate itself is an out-of-scope collaborator; the core only stores and
//! reflects the settings document so that collaborator and the UI agree on one file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::HubError;
use crate::session::unix_now_secs;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PinSettings {
    #[serde(rename = "pinEnabled")]
    pub pin_enabled: bool,
    #[serde(rename = "pinHash")]
    pub pin_hash: Option<String>,
    #[serde(rename = "themeName")]
    pub theme_name: Option<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<u64>,
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            pin_enabled: false,
            pin_hash: None,
            theme_name: None,
            updated_at: None,
        }
    }
}

/// A partial update: any subset of the fields. `pinHash` must be 64 hex chars when
/// `pinEnabled=true` is being set; otherwise it is cleared to null.
#[derive(Debug, Default, serde::Deserialize)]
pub struct PinSettingsPatch {
    #[serde(rename = "pinEnabled")]
    pub pin_enabled: Option<bool>,
    #[serde(rename = "pinHash")]
    pub pin_hash: Option<String>,
    #[serde(rename = "themeName")]
    pub theme_name: Option<String>,
}

fn is_valid_pin_hash(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct PinSettingsStore {
    path: PathBuf,
    settings: Mutex<PinSettings>,
}

impl PinSettingsStore {
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("pin-settings.json");
        let settings = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PinSettings>(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            settings: Mutex::new(settings),
        }
    }

    pub fn get(&self) -> PinSettings {
        self.settings.lock().expect("pin settings mutex").clone()
    }

    pub fn update(&self, patch: PinSettingsPatch) -> Result<PinSettings, HubError> {
        let mut guard = self.settings.lock().expect("pin settings mutex");
        // Validate into a scratch copy first — on rejection the store (in memory and on
        // disk) must stay exactly as it was, not half-applied.
        let mut next = guard.clone();
        if let Some(enabled) = patch.pin_enabled {
            next.pin_enabled = enabled;
        }
        if let Some(hash) = patch.pin_hash {
            if next.pin_enabled {
                if !is_valid_pin_hash(&hash) {
                    return Err(HubError::BadRequest("pinHash must be 64 hex chars when pinEnabled".into()));
                }
                next.pin_hash = Some(hash);
            } else {
                next.pin_hash = None;
            }
        }
        if !next.pin_enabled {
            next.pin_hash = None;
        }
        if next.pin_enabled && !next.pin_hash.as_deref().is_some_and(is_valid_pin_hash) {
            return Err(HubError::BadRequest(
                "pinHash is required and must be 64 hex chars when pinEnabled".into(),
            ));
        }
        if let Some(theme) = patch.theme_name {
            next.theme_name = Some(theme);
        }
        next.updated_at = Some(unix_now_secs());

        let data = serde_json::to_string_pretty(&next)
            .map_err(|e| HubError::Transient(format!("serialize pin-settings.json: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|e| HubError::Transient(format!("write pin-settings.json: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| HubError::Transient(format!("rename pin-settings.json: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        *guard = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_pin_hash_when_enabling() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinSettingsStore::load(dir.path());
        let patch = PinSettingsPatch {
            pin_enabled: Some(true),
            pin_hash: Some("abc".into()),
            theme_name: None,
        };
        let err = store.update(patch).unwrap_err();
        assert!(matches!(err, HubError::BadRequest(_)));
    }

    #[test]
    fn rejects_enabling_without_any_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinSettingsStore::load(dir.path());
        let patch = PinSettingsPatch { pin_enabled: Some(true), pin_hash: None, theme_name: None };
        let err = store.update(patch).unwrap_err();
        assert!(matches!(err, HubError::BadRequest(_)));
        // Rejected update must not have left the store enabled with no hash.
        assert!(!store.get().pin_enabled);
    }

    #[test]
    fn accepts_valid_pin_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinSettingsStore::load(dir.path());
        let hash = "a".repeat(64);
        let patch = PinSettingsPatch {
            pin_enabled: Some(true),
            pin_hash: Some(hash.clone()),
            theme_name: Some("dark".into()),
        };
        let updated = store.update(patch).unwrap();
        assert_eq!(updated.pin_hash.as_deref(), Some(hash.as_str()));
        assert_eq!(updated.theme_name.as_deref(), Some("dark"));
    }

    #[test]
    fn disabling_clears_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinSettingsStore::load(dir.path());
        let hash = "b".repeat(64);
        store
            .update(PinSettingsPatch { pin_enabled: Some(true), pin_hash: Some(hash), theme_name: None })
            .unwrap();
        let updated = store
            .update(PinSettingsPatch { pin_enabled: Some(false), pin_hash: None, theme_name: None })
            .unwrap();
        assert!(updated.pin_hash.is_none());
    }
}
