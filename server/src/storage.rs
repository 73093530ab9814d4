use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use tracing::{debug, info};

const PREFIX: &str = "photo_";
const EXTENSION: &str = ".jpg";
/// Suffixes tried when several captures land in the same second.
const MAX_SAME_SECOND: u32 = 99;
const STAGING_PREFIX: &str = ".staging-";

/// A photo written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Flat directory of `photo_<timestamp>.jpg` files.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    dir: PathBuf,
}

impl PhotoStore {
    /// Use `dir`, creating it if it does not exist.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::CreateDir(dir.display().to_string(), e))?;
        info!(dir = %dir.display(), "photo directory ready");
        Ok(Self { dir })
    }

    /// Write `data` under a fresh timestamped name. Never overwrites, and the
    /// name only appears once the file is complete.
    pub fn save_new(&self, data: &[u8]) -> Result<CaptureRecord, StorageError> {
        self.save_new_at(data, Local::now())
    }

    fn save_new_at(&self, data: &[u8], now: DateTime<Local>) -> Result<CaptureRecord, StorageError> {
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let base_name = format!("{PREFIX}{stamp}{EXTENSION}");

        // Staged under a hidden name so readers never see a partial photo.
        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| StorageError::Write(base_name.clone(), e))?;
        staged
            .write_all(data)
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|e| StorageError::Write(base_name.clone(), e))?;

        for n in 1..=MAX_SAME_SECOND {
            let name = if n == 1 {
                base_name.clone()
            } else {
                format!("{PREFIX}{stamp}_{n}{EXTENSION}")
            };
            let path = self.dir.join(&name);
            match staged.persist_noclobber(&path) {
                Ok(_) => {
                    debug!(name, bytes = data.len(), "photo written");
                    return Ok(CaptureRecord {
                        name,
                        path,
                        bytes: data.len() as u64,
                    });
                }
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => staged = e.file,
                Err(e) => return Err(StorageError::Write(name, e.error)),
            }
        }
        Err(StorageError::NameExhausted(stamp))
    }

    /// Photo names, most recent first.
    pub fn list(&self) -> Result<Vec<String>, StorageError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| StorageError::List(self.dir.display().to_string(), e))?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_photo_name(name))
            .collect();
        names.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
        Ok(names)
    }

    /// Full path of a stored photo, after checking the name.
    pub fn path_of(&self, name: &str) -> Result<PathBuf, StorageError> {
        if !is_photo_name(name) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_of(name)?;
        std::fs::read(&path).map_err(|e| StorageError::Read(name.to_string(), e))
    }
}

/// `photo_<anything safe>.jpg` with no path components.
fn is_photo_name(name: &str) -> bool {
    let Some(stem) = name
        .strip_prefix(PREFIX)
        .and_then(|rest| rest.strip_suffix(EXTENSION))
    else {
        return false;
    };
    !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Orders `photo_<ts>_N.jpg` after `photo_<ts>.jpg` and `_10` after `_9`.
fn sort_key(name: &str) -> (String, u32) {
    let stem = name
        .strip_prefix(PREFIX)
        .and_then(|rest| rest.strip_suffix(EXTENSION))
        .unwrap_or(name);
    // Timestamps are `YYYYMMDD_HHMMSS`; anything after that is the suffix.
    match stem.get(..15).zip(stem.get(15..)) {
        Some((ts, rest)) => {
            let n = rest
                .strip_prefix('_')
                .and_then(|n| n.parse().ok())
                .unwrap_or(if rest.is_empty() { 1 } else { 0 });
            (ts.to_string(), n)
        }
        None => (stem.to_string(), 0),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create photo directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to write photo {0}: {1}")]
    Write(String, std::io::Error),
    #[error("no free photo name left for timestamp {0}")]
    NameExhausted(String),
    #[error("failed to list photo directory {0}: {1}")]
    List(String, std::io::Error),
    #[error("invalid photo name: {0}")]
    InvalidName(String),
    #[error("photo not found: {0}")]
    NotFound(String),
    #[error("failed to read photo {0}: {1}")]
    Read(String, std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, h, m, s).single().unwrap()
    }

    #[test]
    fn open_creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("photos");
        let store = PhotoStore::open(&dir).unwrap();
        assert!(dir.is_dir());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn save_uses_timestamp_name_and_exact_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(tmp.path()).unwrap();
        let record = store.save_new_at(b"jpeg-bytes", at(12, 30, 5)).unwrap();
        assert_eq!(record.name, "photo_20260314_123005.jpg");
        assert_eq!(record.bytes, 10);
        assert_eq!(std::fs::read(&record.path).unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn same_second_captures_get_distinct_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(tmp.path()).unwrap();
        let first = store.save_new_at(b"one", at(9, 0, 0)).unwrap();
        let second = store.save_new_at(b"two", at(9, 0, 0)).unwrap();
        assert_eq!(first.name, "photo_20260314_090000.jpg");
        assert_eq!(second.name, "photo_20260314_090000_2.jpg");
        assert_eq!(store.read(&first.name).unwrap(), b"one");
        assert_eq!(store.read(&second.name).unwrap(), b"two");
    }

    #[test]
    fn list_is_most_recent_first_and_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(tmp.path()).unwrap();
        for _ in 0..10 {
            store.save_new_at(b"x", at(10, 0, 0)).unwrap();
        }
        store.save_new_at(b"x", at(9, 59, 59)).unwrap();
        store.save_new_at(b"x", at(10, 0, 1)).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"ignored").unwrap();

        let names = store.list().unwrap();
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "photo_20260314_100001.jpg");
        assert_eq!(names[1], "photo_20260314_100000_10.jpg");
        assert_eq!(names[2], "photo_20260314_100000_9.jpg");
        assert_eq!(names[10], "photo_20260314_100000.jpg");
        assert_eq!(names[11], "photo_20260314_095959.jpg");
        assert_eq!(store.list().unwrap(), names);
    }

    #[test]
    fn rejects_traversal_and_foreign_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(tmp.path()).unwrap();
        for bad in ["../etc/passwd", "photo_../x.jpg", "photo_.jpg", "other.jpg", "photo_a/b.jpg"] {
            assert!(
                matches!(store.read(bad), Err(StorageError::InvalidName(_))),
                "{bad} should be rejected"
            );
        }
        assert!(matches!(
            store.read("photo_20260101_000000.jpg"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("photos");
        let store = PhotoStore::open(&dir).unwrap();
        std::fs::remove_dir(&dir).unwrap();

        assert!(matches!(
            store.save_new_at(b"x", at(8, 0, 0)),
            Err(StorageError::Write(..))
        ));
        std::fs::create_dir(&dir).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn no_staging_files_remain_after_saves() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(tmp.path()).unwrap();
        for _ in 0..3 {
            store.save_new_at(b"x", at(11, 0, 0)).unwrap();
        }
        let entries: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|name| !name.starts_with(STAGING_PREFIX)));
    }
}
