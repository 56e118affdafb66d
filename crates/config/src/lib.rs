use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use vaultsync_engine::{ConflictPolicy, SyncSettings};

/// Floor for `sync.poll_interval_ms`; a zero interval would spin.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

// ── Permission answers ────────────────────────────────────────────────────────

/// How the native host answers capability permission requests.
///
/// | Mode     | Behaviour                                          |
/// |----------|----------------------------------------------------|
/// | `prompt` | Ask on the terminal every time a decision is due.  |
/// | `grant`  | Answer every request with "granted".               |
/// | `deny`   | Answer every request with "denied" (read-only use).|
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    #[default]
    Prompt,
    Grant,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault directory used by `scan`.  Overridden at runtime by the
    /// `VAULTSYNC_VAULT_DIR` environment variable when set.
    pub root: String,
    pub note_extension: String,
    /// Name used in `obsidian://` deep links.  Empty means the name of the
    /// root directory.
    pub obsidian_vault_name: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: String::new(),
            note_extension: "md".to_string(),
            obsidian_vault_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    pub autosave_debounce_ms: u64,
    pub autosave_enabled: bool,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            autosave_debounce_ms: 800,
            autosave_enabled: true,
            conflict_policy: ConflictPolicy::PreferExternal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding the persisted handle slots.
    pub handles_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            handles_path: ".vaultsync/handles.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PermissionsConfig {
    pub mode: PermissionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Directory for daily-rotated log files.  Empty logs to stderr only.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
    pub permissions: PermissionsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(dir) = env::var("VAULTSYNC_VAULT_DIR") {
            if !dir.is_empty() {
                config.vault.root = dir;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Engine timing and conflict settings.
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            poll_interval: Duration::from_millis(
                self.sync.poll_interval_ms.max(MIN_POLL_INTERVAL_MS),
            ),
            autosave_debounce: Duration::from_millis(self.sync.autosave_debounce_ms),
            autosave_enabled: self.sync.autosave_enabled,
            conflict_policy: self.sync.conflict_policy,
        }
    }

    pub fn handles_path(&self) -> PathBuf {
        PathBuf::from(&self.store.handles_path)
    }

    pub fn vault_root(&self) -> Option<PathBuf> {
        (!self.vault.root.is_empty()).then(|| PathBuf::from(&self.vault.root))
    }

    pub fn vault_name(&self) -> Option<String> {
        (!self.vault.obsidian_vault_name.is_empty())
            .then(|| self.vault.obsidian_vault_name.clone())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.vault.root, "");
        assert_eq!(cfg.vault.note_extension, "md");
        assert_eq!(cfg.sync.poll_interval_ms, 2000);
        assert_eq!(cfg.sync.autosave_debounce_ms, 800);
        assert!(cfg.sync.autosave_enabled);
        assert_eq!(cfg.sync.conflict_policy, ConflictPolicy::PreferExternal);
        assert_eq!(cfg.store.handles_path, ".vaultsync/handles.json");
        assert_eq!(cfg.permissions.mode, PermissionMode::Prompt);
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(cfg.telemetry.log_dir.is_empty());
        assert!(cfg.vault_name().is_none());
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.sync.poll_interval_ms, 2000);
        assert_eq!(cfg.permissions.mode, PermissionMode::Prompt);
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[vault]
note_extension = "markdown"
obsidian_vault_name = "Work"

[sync]
poll_interval_ms = 500
autosave_debounce_ms = 250
autosave_enabled = false
conflict_policy = "keep-local"

[permissions]
mode = "grant"

[telemetry]
log_level = "debug"
log_dir = "/tmp/vaultsync-logs"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.vault.note_extension, "markdown");
        assert_eq!(cfg.vault_name().as_deref(), Some("Work"));
        assert_eq!(cfg.sync.poll_interval_ms, 500);
        assert_eq!(cfg.sync.autosave_debounce_ms, 250);
        assert!(!cfg.sync.autosave_enabled);
        assert_eq!(cfg.sync.conflict_policy, ConflictPolicy::KeepLocal);
        assert_eq!(cfg.permissions.mode, PermissionMode::Grant);
        assert_eq!(cfg.telemetry.log_level, "debug");
        assert_eq!(cfg.telemetry.log_dir, "/tmp/vaultsync-logs");
        // Unspecified sections should have defaults
        assert_eq!(cfg.store.handles_path, ".vaultsync/handles.json");
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[sync]
poll_interval_ms = 1000
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.sync.poll_interval_ms, 1000);
        assert_eq!(cfg.sync.autosave_debounce_ms, 800);
        assert!(cfg.sync.autosave_enabled);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn unknown_conflict_policy_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.toml");
        fs::write(&path, "[sync]\nconflict_policy = \"merge\"\n").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.vault.obsidian_vault_name = "Personal".to_string();
        cfg.sync.conflict_policy = ConflictPolicy::KeepLocal;
        cfg.permissions.mode = PermissionMode::Deny;
        cfg.store.handles_path = "/var/lib/vaultsync/handles.json".to_string();

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.vault.obsidian_vault_name, "Personal");
        assert_eq!(loaded.sync.conflict_policy, ConflictPolicy::KeepLocal);
        assert_eq!(loaded.permissions.mode, PermissionMode::Deny);
        assert_eq!(
            loaded.handles_path(),
            PathBuf::from("/var/lib/vaultsync/handles.json")
        );
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/config.toml");
        let cfg = AppConfig::default();
        cfg.save_to(&path).unwrap();
        assert!(path.exists());
    }

    // ── sync_settings ──────────────────────────────────────────────────────

    #[test]
    fn sync_settings_converts_durations() {
        let mut cfg = AppConfig::default();
        cfg.sync.poll_interval_ms = 1500;
        cfg.sync.autosave_debounce_ms = 300;
        cfg.sync.conflict_policy = ConflictPolicy::KeepLocal;
        let settings = cfg.sync_settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(1500));
        assert_eq!(settings.autosave_debounce, Duration::from_millis(300));
        assert!(settings.autosave_enabled);
        assert_eq!(settings.conflict_policy, ConflictPolicy::KeepLocal);
    }

    #[test]
    fn sync_settings_clamps_poll_interval() {
        let mut cfg = AppConfig::default();
        cfg.sync.poll_interval_ms = 0;
        assert_eq!(
            cfg.sync_settings().poll_interval,
            Duration::from_millis(MIN_POLL_INTERVAL_MS)
        );
    }

    // ── PermissionMode serde ───────────────────────────────────────────────

    #[test]
    fn permission_mode_serde_roundtrip() {
        for (mode, label) in [
            (PermissionMode::Prompt, "\"prompt\""),
            (PermissionMode::Grant, "\"grant\""),
            (PermissionMode::Deny, "\"deny\""),
        ] {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, label);
            let back: PermissionMode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, mode);
        }
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_vault_dir_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.toml");
        fs::write(
            &path,
            r#"
[vault]
root = "/from/file"
"#,
        )
        .unwrap();

        // SAFETY: no other test reads or writes this env var.
        unsafe { env::set_var("VAULTSYNC_VAULT_DIR", "/from/env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        unsafe { env::remove_var("VAULTSYNC_VAULT_DIR") };
        assert_eq!(cfg.vault_root(), Some(PathBuf::from("/from/env")));
    }
}
