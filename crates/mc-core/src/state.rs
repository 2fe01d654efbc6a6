//! Owner-only persistent JSON state store with atomic updates.
//!
//! Every MasterClaw state file (config, rate limits, circuits, events) goes
//! through this module: bounded parsing, pollution-safe key stripping,
//! temp-file + fsync + rename writes, and permission verification.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::lock::{acquire_lock, LOCK_STALE_AFTER, LOCK_TIMEOUT};
use crate::validate::strip_dangerous_keys;

/// Required mode for every state file.
pub const STATE_FILE_MODE: u32 = 0o600;

/// Required mode for the state directory.
pub const STATE_DIR_MODE: u32 = 0o700;

/// Byte cap applied before parsing any state file.
pub const MAX_STATE_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum JSON nesting depth accepted from disk.
pub const MAX_STATE_DEPTH: usize = 64;

/// Handle to the operator-scoped state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Opens (creating if needed) the state directory with owner-only access.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory {}", root.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(STATE_DIR_MODE);
            fs::set_permissions(&root, permissions).with_context(|| {
                format!("failed to restrict state directory {}", root.display())
            })?;
        }
        Ok(Self { root })
    }

    /// Resolves the default state root: `$MC_STATE_DIR` or `~/.masterclaw`.
    pub fn default_root() -> PathBuf {
        if let Ok(dir) = std::env::var("MC_STATE_DIR") {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Path::new(&home).join(".masterclaw")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Loads a state file, returning the default on absence or corruption.
    ///
    /// Corruption (unreadable bytes, oversized payload, depth bomb, failed
    /// validation) is downgraded to the default value plus one security
    /// event log line; the dispatcher never crashes on bad state.
    pub fn load_state<T>(&self, name: &str, validate: impl Fn(&T) -> Result<(), String>) -> T
    where
        T: DeserializeOwned + Default,
    {
        let path = self.file_path(name);
        match self.try_load(&path, &validate) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(error) => {
                warn!(
                    file = %path.display(),
                    reason_code = "state_corrupt_reset",
                    error = %error,
                    "state file failed validation; using defaults"
                );
                T::default()
            }
        }
    }

    fn try_load<T>(
        &self,
        path: &Path,
        validate: &impl Fn(&T) -> Result<(), String>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        if !path.exists() {
            return Ok(None);
        }
        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to inspect state file {}", path.display()))?;
        if metadata.len() > MAX_STATE_BYTES {
            bail!(
                "state file {} exceeds the {} byte cap",
                path.display(),
                MAX_STATE_BYTES
            );
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        let mut value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse state file {}", path.display()))?;
        if json_depth(&value) > MAX_STATE_DEPTH {
            bail!(
                "state file {} exceeds the nesting depth cap of {}",
                path.display(),
                MAX_STATE_DEPTH
            );
        }
        let removed = strip_dangerous_keys(&mut value);
        if removed > 0 {
            warn!(
                file = %path.display(),
                removed,
                reason_code = "state_dangerous_keys_stripped",
                "stripped dangerous keys while loading state"
            );
        }
        let typed: T = serde_json::from_value(value)
            .with_context(|| format!("state file {} has an unexpected shape", path.display()))?;
        validate(&typed).map_err(|detail| {
            anyhow::anyhow!("state file {} failed validation: {detail}", path.display())
        })?;
        Ok(Some(typed))
    }

    /// Serializes and writes a state file atomically with `0o600` permission.
    pub fn save_state<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.file_path(name);
        let mut tree = serde_json::to_value(value).context("failed to serialize state")?;
        strip_dangerous_keys(&mut tree);
        let mut payload =
            serde_json::to_string_pretty(&tree).context("failed to encode state")?;
        payload.push('\n');
        write_owner_only_atomic(&path, payload.as_bytes())
    }

    /// Load → pure transform → save under the directory's advisory lock.
    ///
    /// A failing transform leaves the previous state intact.
    pub fn atomic_update<T>(
        &self,
        name: &str,
        validate: impl Fn(&T) -> Result<(), String>,
        transform: impl FnOnce(T) -> Result<T>,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Default + Clone,
    {
        let lock_path = self.root.join(format!(".{name}.lock"));
        let _guard = acquire_lock(&lock_path, LOCK_TIMEOUT, LOCK_STALE_AFTER)?;
        let current = self.load_state(name, validate);
        let updated = transform(current)?;
        self.save_state(name, &updated)?;
        Ok(updated)
    }
}

/// Writes bytes via temp file + fsync + rename, then verifies the final
/// permission is owner-only.
pub fn write_owner_only_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state");
    let temp_path = parent.join(format!(
        ".{file_name}.tmp-{}-{}",
        std::process::id(),
        crate::time_utils::current_unix_timestamp_ms()
    ));

    {
        let mut options = OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(STATE_FILE_MODE);
        }
        let mut file = options
            .open(&temp_path)
            .with_context(|| format!("failed to open temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write temp file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file {}", temp_path.display()))?;
    }

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to atomically replace {} with {}",
            path.display(),
            temp_path.display()
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .with_context(|| format!("failed to inspect {}", path.display()))?
            .permissions()
            .mode()
            & 0o777;
        if mode != STATE_FILE_MODE {
            warn!(
                file = %path.display(),
                mode = format!("{mode:o}"),
                reason_code = "state_permission_corrected",
                "state file permission drifted; restoring owner-only mode"
            );
            fs::set_permissions(path, fs::Permissions::from_mode(STATE_FILE_MODE))
                .with_context(|| format!("failed to restrict {}", path.display()))?;
        }
    }

    Ok(())
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}
