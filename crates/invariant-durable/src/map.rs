//! The snapshot + append-journal map itself.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{DurableError, Result};

const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TMP: &str = "snapshot.tmp";
const JOURNAL_PREFIX: &str = "journal-";
const JOURNAL_SUFFIX: &str = ".jsonl";

/// Configuration for a [`DurableMap`].
#[derive(Debug, Clone)]
pub struct DurableMapConfig {
    /// Interval between snapshot rotations. `None` disables the background
    /// task; [`DurableMap::rotate_snapshot`] can still be called directly.
    pub snapshot_interval: Option<Duration>,
}

impl Default for DurableMapConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Some(Duration::from_secs(600)),
        }
    }
}

/// One mutation, as recorded on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRecord {
    op: JournalOp,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum JournalOp {
    Create,
    Update,
    Delete,
}

struct MapState {
    entries: HashMap<String, String>,
    journal: File,
    journal_name: String,
}

/// A string map persisted as `snapshot.json` plus newline-delimited JSON
/// journals inside one directory. Mutations are CAS-guarded and fsynced
/// before they are acknowledged.
pub struct DurableMap {
    id: String,
    dir: PathBuf,
    state: Arc<RwLock<MapState>>,
    snapshot_task: Option<tokio::task::JoinHandle<()>>,
}

impl DurableMap {
    /// Open (or initialize) the map stored in `dir`. Loads the snapshot if
    /// present, replays journals in ascending name order skipping malformed
    /// lines, then opens a fresh journal for new mutations.
    ///
    /// A configured `snapshot_interval` spawns the rotation timer and so
    /// requires a tokio runtime; pass `None` to manage rotation manually.
    pub fn open(dir: impl AsRef<Path>, config: DurableMapConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let id = load_or_create_id(&dir)?;

        let mut entries = HashMap::new();
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        match fs::read(&snapshot_path) {
            Ok(data) => {
                entries = serde_json::from_slice(&data)?;
                debug!(entries = entries.len(), "loaded snapshot");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        for name in journal_files(&dir)? {
            replay_journal(&dir.join(&name), &mut entries)?;
        }

        let (journal, journal_name) = open_journal(&dir)?;
        let state = Arc::new(RwLock::new(MapState {
            entries,
            journal,
            journal_name,
        }));

        let snapshot_task = config.snapshot_interval.map(|interval| {
            let state = Arc::clone(&state);
            let dir = dir.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let state = Arc::clone(&state);
                    let dir = dir.clone();
                    let result =
                        tokio::task::spawn_blocking(move || rotate(&dir, &state)).await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "snapshot rotation failed"),
                        Err(_) => return,
                    }
                }
            })
        });

        Ok(Self {
            id,
            dir,
            state,
            snapshot_task,
        })
    }

    /// The persistent 64-hex identity of this map, generated on first open.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Look up the value for `key`.
    pub fn get(&self, key: &str) -> Result<String> {
        let state = self.state.read().expect("durable map lock poisoned");
        state
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| DurableError::NotFound(key.to_string()))
    }

    /// Create a new key. Fails with [`DurableError::Conflict`] if it exists.
    pub fn create(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.write().expect("durable map lock poisoned");
        if state.entries.contains_key(key) {
            return Err(DurableError::Conflict(key.to_string()));
        }
        append_record(
            &mut state.journal,
            &JournalRecord {
                op: JournalOp::Create,
                key: key.to_string(),
                value: Some(value.to_string()),
            },
        )?;
        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Compare-and-swap update. The stored value must equal `expected`.
    pub fn update(&self, key: &str, value: &str, expected: &str) -> Result<()> {
        let mut state = self.state.write().expect("durable map lock poisoned");
        let current = state
            .entries
            .get(key)
            .ok_or_else(|| DurableError::NotFound(key.to_string()))?;
        if current != expected {
            return Err(DurableError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        append_record(
            &mut state.journal,
            &JournalRecord {
                op: JournalOp::Update,
                key: key.to_string(),
                value: Some(value.to_string()),
            },
        )?;
        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Delete a key. A non-empty `expected` must match the stored value.
    pub fn delete(&self, key: &str, expected: &str) -> Result<()> {
        let mut state = self.state.write().expect("durable map lock poisoned");
        let current = state
            .entries
            .get(key)
            .ok_or_else(|| DurableError::NotFound(key.to_string()))?;
        if !expected.is_empty() && current != expected {
            return Err(DurableError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        append_record(
            &mut state.journal,
            &JournalRecord {
                op: JournalOp::Delete,
                key: key.to_string(),
                value: None,
            },
        )?;
        state.entries.remove(key);
        Ok(())
    }

    /// Snapshot of all entries, for serving list/bulk reads.
    pub fn entries(&self) -> HashMap<String, String> {
        let state = self.state.read().expect("durable map lock poisoned");
        state.entries.clone()
    }

    /// Collapse the journal history into `snapshot.json` and delete
    /// superseded journals. Safe to call at any time; on failure the temp
    /// file is removed and the previous snapshot stays in place.
    pub fn rotate_snapshot(&self) -> Result<()> {
        rotate(&self.dir, &self.state)
    }
}

impl Drop for DurableMap {
    fn drop(&mut self) {
        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }
    }
}

fn load_or_create_id(dir: &Path) -> Result<String> {
    let path = dir.join("id");
    if let Ok(data) = fs::read_to_string(&path) {
        let trimmed = data.trim();
        if trimmed.len() == 64 {
            return Ok(trimmed.to_string());
        }
    }
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let id = hex::encode(bytes);
    fs::write(&path, &id)?;
    Ok(id)
}

fn journal_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(JOURNAL_PREFIX) && name.ends_with(JOURNAL_SUFFIX) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn replay_journal(path: &Path, entries: &mut HashMap<String, String>) -> Result<()> {
    let file = File::open(path)?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(_) => {
                warn!(path = %path.display(), "skipping malformed journal line");
                continue;
            }
        };
        match record.op {
            JournalOp::Create | JournalOp::Update => {
                if let Some(value) = record.value {
                    entries.insert(record.key, value);
                }
            }
            JournalOp::Delete => {
                entries.remove(&record.key);
            }
        }
    }
    Ok(())
}

fn open_journal(dir: &Path) -> Result<(File, String)> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let name = format!("{JOURNAL_PREFIX}{nanos}{JOURNAL_SUFFIX}");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(&name))?;
    Ok((file, name))
}

fn append_record(journal: &mut File, record: &JournalRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    journal.write_all(&line)?;
    journal.sync_data()?;
    Ok(())
}

fn rotate(dir: &Path, state: &Arc<RwLock<MapState>>) -> Result<()> {
    // Copy the map and switch journals under the lock; serialize outside it.
    let (copy, active_journal) = {
        let mut state = state.write().expect("durable map lock poisoned");
        let (journal, name) = open_journal(dir)?;
        state.journal = journal;
        state.journal_name = name.clone();
        (state.entries.clone(), name)
    };

    let tmp_path = dir.join(SNAPSHOT_TMP);
    let write_snapshot = || -> Result<()> {
        let mut file = File::create(&tmp_path)?;
        serde_json::to_writer(&mut file, &copy)?;
        file.sync_all()?;
        fs::rename(&tmp_path, dir.join(SNAPSHOT_FILE))?;
        Ok(())
    };
    if let Err(e) = write_snapshot() {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    for name in journal_files(dir)? {
        if name != active_journal {
            let _ = fs::remove_file(dir.join(name));
        }
    }
    debug!(entries = copy.len(), "snapshot rotated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> DurableMapConfig {
        DurableMapConfig {
            snapshot_interval: None,
        }
    }

    #[test]
    fn create_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let map = DurableMap::open(dir.path(), config()).unwrap();
        map.create("k", "v").unwrap();
        assert_eq!(map.get("k").unwrap(), "v");
    }

    #[test]
    fn create_existing_conflicts() {
        let dir = TempDir::new().unwrap();
        let map = DurableMap::open(dir.path(), config()).unwrap();
        map.create("k", "v").unwrap();
        assert!(matches!(
            map.create("k", "w"),
            Err(DurableError::Conflict(_))
        ));
    }

    #[test]
    fn update_checks_expected() {
        let dir = TempDir::new().unwrap();
        let map = DurableMap::open(dir.path(), config()).unwrap();
        map.create("k", "v0").unwrap();
        assert!(matches!(
            map.update("k", "v1", "wrong"),
            Err(DurableError::PreconditionFailed { .. })
        ));
        assert_eq!(map.get("k").unwrap(), "v0");
        map.update("k", "v1", "v0").unwrap();
        assert_eq!(map.get("k").unwrap(), "v1");
    }

    #[test]
    fn update_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let map = DurableMap::open(dir.path(), config()).unwrap();
        assert!(matches!(
            map.update("missing", "v", ""),
            Err(DurableError::NotFound(_))
        ));
    }

    #[test]
    fn delete_with_empty_expected_skips_check() {
        let dir = TempDir::new().unwrap();
        let map = DurableMap::open(dir.path(), config()).unwrap();
        map.create("k", "v").unwrap();
        map.delete("k", "").unwrap();
        assert!(matches!(map.get("k"), Err(DurableError::NotFound(_))));
    }

    #[test]
    fn delete_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let map = DurableMap::open(dir.path(), config()).unwrap();
        map.create("k", "v").unwrap();
        assert!(matches!(
            map.delete("k", "other"),
            Err(DurableError::PreconditionFailed { .. })
        ));
        assert_eq!(map.get("k").unwrap(), "v");
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let map = DurableMap::open(dir.path(), config()).unwrap();
            map.create("k", "v").unwrap();
            map.create("gone", "x").unwrap();
            map.delete("gone", "").unwrap();
        }
        let map = DurableMap::open(dir.path(), config()).unwrap();
        assert_eq!(map.get("k").unwrap(), "v");
        assert!(matches!(map.get("gone"), Err(DurableError::NotFound(_))));
    }

    #[test]
    fn identity_is_stable_across_reopen() {
        let dir = TempDir::new().unwrap();
        let first = DurableMap::open(dir.path(), config()).unwrap().id().to_string();
        let second = DurableMap::open(dir.path(), config()).unwrap().id().to_string();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn rotation_keeps_only_active_journal() {
        let dir = TempDir::new().unwrap();
        let map = DurableMap::open(dir.path(), config()).unwrap();
        map.create("k", "v0").unwrap();
        map.update("k", "v1", "v0").unwrap();
        map.rotate_snapshot().unwrap();

        let journals = journal_files(dir.path()).unwrap();
        assert_eq!(journals.len(), 1);
        assert!(dir.path().join(SNAPSHOT_FILE).exists());

        drop(map);
        let map = DurableMap::open(dir.path(), config()).unwrap();
        assert_eq!(map.get("k").unwrap(), "v1");
    }

    #[test]
    fn malformed_journal_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        {
            let map = DurableMap::open(dir.path(), config()).unwrap();
            map.create("k", "v").unwrap();
        }
        // Corrupt the journal with a half-written trailing line.
        let journal = journal_files(dir.path()).unwrap().pop().unwrap();
        let path = dir.path().join(journal);
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(b"{\"op\":\"Create\",\"ke");
        fs::write(&path, data).unwrap();

        let map = DurableMap::open(dir.path(), config()).unwrap();
        assert_eq!(map.get("k").unwrap(), "v");
    }
}
