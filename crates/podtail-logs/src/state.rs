use std::path::Path;

use crate::error::StateError;

const OFFSETS_TREE: &str = "podtail-offsets";

/// Durable mapping of absolute file path to the byte offset forwarded so far.
///
/// Backed by an embedded sled database. Cloning is cheap and every clone
/// shares the same store, so one recorder can be handed to any number of
/// tailers.
#[derive(Clone)]
pub struct StateRecorder {
    db: sled::Db,
    offsets: sled::Tree,
}

impl StateRecorder {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let db = sled::Config::new()
            .path(path)
            .open()
            .map_err(|source| StateError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let offsets = db.open_tree(OFFSETS_TREE)?;

        Ok(Self { db, offsets })
    }

    /// Upsert the offset for a path
    pub fn record(&self, path: &Path, offset: u64) -> Result<(), StateError> {
        self.offsets
            .insert(key(path), offset.to_be_bytes().to_vec())?;
        Ok(())
    }

    /// Get the recorded offset for a path, if any
    pub fn get(&self, path: &Path) -> Result<Option<u64>, StateError> {
        let Some(value) = self.offsets.get(key(path))? else {
            return Ok(None);
        };

        let bytes: [u8; 8] = value
            .as_ref()
            .try_into()
            .map_err(|_| StateError::Corrupt(path.to_path_buf()))?;
        Ok(Some(u64::from_be_bytes(bytes)))
    }

    /// Forget a path's offset
    pub fn delete(&self, path: &Path) -> Result<(), StateError> {
        self.offsets.remove(key(path))?;
        Ok(())
    }

    /// Force pending writes to disk
    pub fn flush(&self) -> Result<(), StateError> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of paths with a recorded offset
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl std::fmt::Debug for StateRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRecorder")
            .field("offsets", &self.offsets.len())
            .finish()
    }
}

fn key(path: &Path) -> &[u8] {
    path.as_os_str().as_encoded_bytes()
}
