//! Durable storage for cache entries
//!
//! Each entry is two files in one directory: `<fingerprint>.state` holds the
//! raw prefix state and `<fingerprint>.json` holds metadata and units. Both are
//! written under a temporary name and renamed into place, the metadata file
//! last, so an entry is only visible once it is complete.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backend::PrefixState;
use crate::cache::entry::{CacheEntry, CacheEntryMetadata};
use crate::cache::types::Fingerprint;
use crate::error::{CagError, Result};
use crate::record::KnowledgeUnit;

const STATE_EXT: &str = "state";
const META_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

/// Where published entries survive a restart
pub trait EntryPersistence: Send + Sync + fmt::Debug {
    /// Durably write an entry; must not leave a partially visible entry behind
    fn save(&self, entry: &CacheEntry) -> Result<()>;

    /// Load every complete, verified, unexpired entry
    fn load_all(&self) -> Result<Vec<CacheEntry>>;

    /// Forget an entry; missing entries are not an error
    fn remove(&self, fingerprint: &Fingerprint) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    metadata: CacheEntryMetadata,
    units: Vec<KnowledgeUnit>,
}

/// File-per-entry persistence in a single directory
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, fingerprint: &Fingerprint, ext: &str) -> Result<PathBuf> {
        if !fingerprint.is_well_formed() {
            return Err(CagError::Other(format!(
                "refusing to persist malformed fingerprint {:?}",
                fingerprint.as_str()
            )));
        }
        Ok(self.dir.join(format!("{}.{}", fingerprint, ext)))
    }

    /// Write `bytes` to `target` through a synced temporary file
    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("entry");
        let tmp = self
            .dir
            .join(format!(".{}.{}.{}", name, uuid::Uuid::new_v4(), TMP_EXT));

        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, target)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        Ok(result?)
    }

    fn remove_pair(&self, fingerprint: &Fingerprint) {
        for ext in [META_EXT, STATE_EXT] {
            if let Ok(path) = self.path_for(fingerprint, ext) {
                let _ = fs::remove_file(path);
            }
        }
    }

    fn load_one(&self, meta_path: &Path) -> Result<Option<CacheEntry>> {
        let persisted: PersistedEntry = serde_json::from_slice(&fs::read(meta_path)?)?;
        let fingerprint = persisted.metadata.fingerprint.clone();

        if persisted.metadata.is_expired() {
            debug!("Dropping expired persisted entry {}", fingerprint.short());
            self.remove_pair(&fingerprint);
            return Ok(None);
        }

        let state_path = self.path_for(&fingerprint, STATE_EXT)?;
        let state = match fs::read(&state_path) {
            Ok(bytes) => PrefixState::new(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Persisted entry {} has no state file", fingerprint.short());
                self.remove_pair(&fingerprint);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let entry = CacheEntry::from_parts(persisted.metadata, state, persisted.units);
        if let Err(e) = entry.verify_state() {
            warn!("Discarding persisted entry: {}", e);
            self.remove_pair(&fingerprint);
            return Ok(None);
        }
        Ok(Some(entry))
    }
}

impl EntryPersistence for FilePersistence {
    fn save(&self, entry: &CacheEntry) -> Result<()> {
        let fingerprint = entry.fingerprint();
        let state_path = self.path_for(fingerprint, STATE_EXT)?;
        let meta_path = self.path_for(fingerprint, META_EXT)?;

        let persisted = PersistedEntry {
            metadata: entry.metadata.clone(),
            units: entry.units().to_vec(),
        };
        let meta = serde_json::to_vec_pretty(&persisted)?;

        self.write_atomic(&state_path, entry.prefix_state().as_bytes())?;
        self.write_atomic(&meta_path, &meta)?;

        debug!(
            "Persisted entry {} ({} state bytes)",
            fingerprint.short(),
            entry.prefix_state().len()
        );
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut orphans = 0usize;

        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if !path.is_file() {
                continue;
            }

            match path.extension().and_then(|e| e.to_str()) {
                Some(TMP_EXT) => {
                    // leftover from an interrupted write
                    let _ = fs::remove_file(&path);
                    orphans += 1;
                }
                Some(META_EXT) => match self.load_one(&path) {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping unreadable entry {}: {}", path.display(), e),
                },
                _ => {}
            }
        }

        if orphans > 0 {
            info!("Removed {} incomplete entry files", orphans);
        }
        entries.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
        info!(
            "Loaded {} persisted entries from {}",
            entries.len(),
            self.dir.display()
        );
        Ok(entries)
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<()> {
        // metadata first so a half-removed entry is never loaded
        for ext in [META_EXT, STATE_EXT] {
            match fs::remove_file(self.path_for(fingerprint, ext)?) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WarmState;
    use crate::record::{RawEvent, RecordNormalizer};
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(fp: &str, ttl: Duration) -> CacheEntry {
        let unit = RecordNormalizer::default()
            .normalize(
                &RawEvent::new()
                    .with("id", "evt-1")
                    .with("timestamp", "2024-05-01T10:00:00Z")
                    .with("rule_level", 10)
                    .with("rule_description", "rootkit detected"),
            )
            .unwrap();
        CacheEntry::new(
            Fingerprint::new(fp),
            "snap",
            "extractive",
            WarmState {
                state: PrefixState::new(b"warm state".to_vec()),
                origin_length: 2,
            },
            vec![unit],
            0,
            ttl,
        )
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let persistence = FilePersistence::new(tmp.path()).unwrap();

        persistence.save(&entry("aa11", Duration::from_secs(60))).unwrap();

        let loaded = persistence.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].fingerprint().as_str(), "aa11");
        assert_eq!(loaded[0].prefix_state().as_bytes(), b"warm state");
        assert_eq!(loaded[0].units()[0].source_id(), "evt-1");
        assert!(tmp.path().join("aa11.state").exists());
        assert!(tmp.path().join("aa11.json").exists());
    }

    #[test]
    fn test_temp_files_are_never_entries() {
        let tmp = TempDir::new().unwrap();
        let persistence = FilePersistence::new(tmp.path()).unwrap();

        fs::write(tmp.path().join(".bb22.json.1234.tmp"), b"{ half").unwrap();
        let loaded = persistence.load_all().unwrap();

        assert!(loaded.is_empty());
        assert!(!tmp.path().join(".bb22.json.1234.tmp").exists());
    }

    #[test]
    fn test_corrupt_state_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let persistence = FilePersistence::new(tmp.path()).unwrap();
        persistence.save(&entry("cc33", Duration::from_secs(60))).unwrap();

        fs::write(tmp.path().join("cc33.state"), b"tampered!!").unwrap();
        assert!(persistence.load_all().unwrap().is_empty());
        assert!(!tmp.path().join("cc33.json").exists());
    }

    #[test]
    fn test_expired_entries_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let persistence = FilePersistence::new(tmp.path()).unwrap();
        persistence.save(&entry("dd44", Duration::from_millis(10))).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert!(persistence.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_remove_and_reject_bad_names() {
        let tmp = TempDir::new().unwrap();
        let persistence = FilePersistence::new(tmp.path()).unwrap();
        persistence.save(&entry("ee55", Duration::from_secs(60))).unwrap();

        persistence.remove(&Fingerprint::new("ee55")).unwrap();
        persistence.remove(&Fingerprint::new("ee55")).unwrap();
        assert!(persistence.load_all().unwrap().is_empty());

        assert!(persistence.remove(&Fingerprint::new("../x")).is_err());
    }
}
