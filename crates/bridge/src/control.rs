//! Device control state and its durable single-record store.
//!
//! The record lives in one small JSON document (`{"led":"ON","rgb":128}`).
//! Every write goes to a sibling temp file, is fsynced, and is renamed over
//! the document; the directory is synced after the rename, so a crash leaves
//! either the old or the new record on disk.
//! The in-memory copy is swapped only after the rename succeeds, all under
//! the same write lock, which makes `get`/`replace`/`update` linearizable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};

pub const LEVEL_MIN: i64 = 0;
pub const LEVEL_MAX: i64 = 255;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Power {
    #[serde(rename = "ON")]
    On,
    #[default]
    #[serde(rename = "OFF")]
    Off,
}

impl Power {
    pub fn as_str(self) -> &'static str {
        match self {
            Power::On => "ON",
            Power::Off => "OFF",
        }
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an "ON"/"OFF" token (case-insensitive, trims whitespace).
impl FromStr for Power {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(Power::On),
            "OFF" => Ok(Power::Off),
            other => Err(BridgeError::InvalidInput(format!(
                "unknown power value '{other}', use ON or OFF"
            ))),
        }
    }
}

/// What the API returns: `{"power":"ON","level":128}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlState {
    pub power: Power,
    pub level: u8,
}

impl ControlState {
    pub fn new(power: Power, level: i64) -> Self {
        Self {
            power,
            level: clamp_level(level),
        }
    }
}

pub fn clamp_level(level: i64) -> u8 {
    level.clamp(LEVEL_MIN, LEVEL_MAX) as u8
}

/// A change requested by a client. Absent fields keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlPatch {
    pub power: Option<Power>,
    pub level: Option<i64>,
}

impl ControlPatch {
    pub fn is_empty(&self) -> bool {
        self.power.is_none() && self.level.is_none()
    }

    fn apply(self, current: ControlState) -> ControlState {
        ControlState {
            power: self.power.unwrap_or(current.power),
            level: self.level.map(clamp_level).unwrap_or(current.level),
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk document
// ---------------------------------------------------------------------------

/// Persisted layout. Older documents carry only `led`, so both fields default.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    #[serde(default)]
    led: Power,
    #[serde(default)]
    rgb: i64,
}

impl From<ControlState> for StoredDocument {
    fn from(s: ControlState) -> Self {
        Self {
            led: s.power,
            rgb: i64::from(s.level),
        }
    }
}

impl From<StoredDocument> for ControlState {
    fn from(d: StoredDocument) -> Self {
        ControlState::new(d.led, d.rgb)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ControlStore {
    path: Arc<PathBuf>,
    current: Arc<RwLock<ControlState>>,
}

impl ControlStore {
    /// Open the document at `path`. A missing or malformed document yields
    /// the default state; only a real I/O failure is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = load_document(&path).await?;
        info!(path = %path.display(), power = %state.power, level = state.level, "control state loaded");
        Ok(Self {
            path: Arc::new(path),
            current: Arc::new(RwLock::new(state)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> ControlState {
        *self.current.read().await
    }

    /// Last-writer-wins replacement of the whole record.
    pub async fn replace(&self, power: Power, level: i64) -> Result<ControlState> {
        self.update(ControlPatch {
            power: Some(power),
            level: Some(level),
        })
        .await
    }

    /// Atomic read-modify-write. The write lock is held across the disk
    /// write so no reader sees the new value before it is durable.
    pub async fn update(&self, patch: ControlPatch) -> Result<ControlState> {
        let mut current = self.current.write().await;
        let next = patch.apply(*current);
        write_document(&self.path, next).await?;
        *current = next;
        Ok(next)
    }
}

async fn load_document(path: &Path) -> Result<ControlState> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ControlState::default()),
        Err(err) => {
            return Err(BridgeError::storage(
                format!("read {}", path.display()),
                err,
            ))
        }
    };

    match serde_json::from_slice::<StoredDocument>(&raw) {
        Ok(doc) => Ok(doc.into()),
        Err(err) => {
            warn!(path = %path.display(), "malformed control document, using default: {err}");
            Ok(ControlState::default())
        }
    }
}

async fn write_document(path: &Path, state: ControlState) -> Result<()> {
    let storage_err = |err: std::io::Error| BridgeError::storage(format!("write {}", path.display()), err);

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(dir).await.map_err(storage_err)?;

    let payload = serde_json::to_vec(&StoredDocument::from(state))
        .map_err(|err| BridgeError::storage("encode control document", err))?;

    let tmp = tmp_path(path);
    if let Err(err) = write_and_rename(&tmp, path, &payload).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(storage_err(err));
    }

    // The rename is only durable once the directory entry is synced.
    sync_dir(dir).await.map_err(storage_err)
}

async fn write_and_rename(tmp: &Path, path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, path).await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "control".into());
    name.push(".tmp");
    path.with_file_name(name)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn fresh_store(dir: &tempfile::TempDir) -> ControlStore {
        ControlStore::open(dir.path().join("results.json")).await.unwrap()
    }

    // -- Power parsing ------------------------------------------------------

    #[test]
    fn power_parses_case_insensitive_and_trimmed() {
        assert_eq!("ON".parse::<Power>().unwrap(), Power::On);
        assert_eq!(" off\n".parse::<Power>().unwrap(), Power::Off);
        assert_eq!("oN".parse::<Power>().unwrap(), Power::On);
    }

    #[test]
    fn power_rejects_unknown_tokens() {
        for bad in ["MAYBE", "", "1", "ONN", "TOGGLE"] {
            let err = bad.parse::<Power>().unwrap_err();
            assert!(matches!(err, BridgeError::InvalidInput(_)), "{bad}");
        }
    }

    #[test]
    fn clamp_level_bounds() {
        assert_eq!(clamp_level(-5), 0);
        assert_eq!(clamp_level(0), 0);
        assert_eq!(clamp_level(128), 128);
        assert_eq!(clamp_level(255), 255);
        assert_eq!(clamp_level(999), 255);
        assert_eq!(clamp_level(i64::MIN), 0);
        assert_eq!(clamp_level(i64::MAX), 255);
    }

    #[test]
    fn api_shape_serializes() {
        let json = serde_json::to_value(ControlState::new(Power::On, 128)).unwrap();
        assert_eq!(json, serde_json::json!({"power": "ON", "level": 128}));
    }

    // -- Store --------------------------------------------------------------

    #[tokio::test]
    async fn missing_document_yields_default() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir).await;
        assert_eq!(store.get().await, ControlState::default());
        assert_eq!(store.get().await, ControlState::new(Power::Off, 0));
    }

    #[tokio::test]
    async fn replace_then_get_round_trips_every_valid_state() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir).await;
        for power in [Power::On, Power::Off] {
            for level in [0, 1, 127, 254, 255] {
                store.replace(power, level).await.unwrap();
                assert_eq!(store.get().await, ControlState::new(power, level));
            }
        }
    }

    #[tokio::test]
    async fn out_of_range_levels_are_clamped() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir).await;
        assert_eq!(store.replace(Power::On, 999).await.unwrap().level, 255);
        assert_eq!(store.replace(Power::On, -40).await.unwrap().level, 0);
    }

    #[tokio::test]
    async fn writes_are_persisted_in_document_layout() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir).await;
        store.replace(Power::On, 128).await.unwrap();

        let raw = std::fs::read(store.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc, serde_json::json!({"led": "ON", "rgb": 128}));

        // A new store over the same file sees the write.
        let reopened = ControlStore::open(store.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.get().await, ControlState::new(Power::On, 128));
        assert!(!tmp_path(store.path()).exists());
    }

    #[tokio::test]
    async fn malformed_document_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = ControlStore::open(&path).await.unwrap();
        assert_eq!(store.get().await, ControlState::default());
    }

    #[tokio::test]
    async fn legacy_document_without_rgb_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, br#"{"led":"ON"}"#).unwrap();

        let store = ControlStore::open(&path).await.unwrap();
        assert_eq!(store.get().await, ControlState::new(Power::On, 0));
    }

    #[tokio::test]
    async fn stored_level_out_of_range_is_clamped_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, br#"{"led":"OFF","rgb":4000}"#).unwrap();

        let store = ControlStore::open(&path).await.unwrap();
        assert_eq!(store.get().await, ControlState::new(Power::Off, 255));
    }

    #[tokio::test]
    async fn partial_update_keeps_other_field() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir).await;
        store.replace(Power::On, 10).await.unwrap();

        let s = store
            .update(ControlPatch {
                level: Some(200),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(s, ControlState::new(Power::On, 200));

        let s = store
            .update(ControlPatch {
                power: Some(Power::Off),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(s, ControlState::new(Power::Off, 200));
    }

    #[tokio::test]
    async fn failed_write_leaves_state_unchanged() {
        let dir = tempdir().unwrap();
        let store = ControlStore::open(dir.path().join("sub").join("results.json"))
            .await
            .unwrap();
        // Parent "directory" becomes a regular file, so the write cannot succeed.
        std::fs::write(dir.path().join("sub"), b"").unwrap();

        let err = store.replace(Power::On, 50).await.unwrap_err();
        assert!(matches!(err, BridgeError::StorageUnavailable { .. }));
        assert_eq!(store.get().await, ControlState::default());
    }

    #[tokio::test]
    async fn failed_rename_removes_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        let store = ControlStore::open(&path).await.unwrap();
        // A non-empty directory at the document path makes the rename fail
        // after the temp file is fully written.
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"").unwrap();

        let err = store.replace(Power::On, 9).await.unwrap_err();
        assert!(matches!(err, BridgeError::StorageUnavailable { .. }));
        assert!(!tmp_path(&path).exists());
        assert_eq!(store.get().await, ControlState::default());
    }

    #[tokio::test]
    async fn nested_document_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("control").join("results.json");
        let store = ControlStore::open(&path).await.unwrap();
        store.replace(Power::On, 64).await.unwrap();

        assert!(!tmp_path(&path).exists());
        let reopened = ControlStore::open(&path).await.unwrap();
        assert_eq!(reopened.get().await, ControlState::new(Power::On, 64));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_sync_reports_missing_directory() {
        let dir = tempdir().unwrap();
        sync_dir(dir.path()).await.unwrap();
        assert!(sync_dir(&dir.path().join("gone")).await.is_err());
    }

    #[tokio::test]
    async fn repeated_get_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir).await;
        store.replace(Power::On, 77).await.unwrap();
        let a = store.get().await;
        let b = store.get().await;
        assert_eq!(a, b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replaces_never_tear() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir).await;
        let a = ControlState::new(Power::On, 11);
        let b = ControlState::new(Power::Off, 222);

        for _ in 0..20 {
            let (s1, s2) = (store.clone(), store.clone());
            let reader = store.clone();
            let t1 = tokio::spawn(async move { s1.replace(a.power, a.level.into()).await });
            let t2 = tokio::spawn(async move { s2.replace(b.power, b.level.into()).await });
            let r = tokio::spawn(async move { reader.get().await });

            t1.await.unwrap().unwrap();
            t2.await.unwrap().unwrap();
            let seen = r.await.unwrap();
            assert!(seen == a || seen == b || seen == ControlState::default());

            let fin = store.get().await;
            assert!(fin == a || fin == b, "torn state {fin:?}");

            let on_disk = ControlStore::open(store.path().to_path_buf()).await.unwrap();
            assert_eq!(on_disk.get().await, fin);
        }
    }
}
