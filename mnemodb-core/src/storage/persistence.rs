/// On-disk layout
///
/// <dir>/metadata.json              one section per category (serde_json)
/// <dir>/<category>.<gen>.index     bincode snapshot of the category index
///
/// A save writes fresh index files first, then swaps metadata.json in
/// with a rename, then deletes index files no section references. A crash
/// at any point leaves the previous metadata pointing at files that still
/// exist.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use crate::clustering::ClusterTable;
use crate::core::errors::{MnemoError, Result};
use crate::index::SlotId;
use crate::memory::record::{ArchivedRecord, MemoryRecord, SlotMetadata};
use crate::partition::PartitionTable;

pub const METADATA_FILE: &str = "metadata.json";
pub const FORMAT_VERSION: u32 = 1;
const INDEX_EXTENSION: &str = "index";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub version: u32,
    pub saved_at: u64,
    pub categories: BTreeMap<String, CategorySection>,
}

impl MetadataDocument {
    pub fn new(saved_at: u64) -> Self {
        MetadataDocument {
            version: FORMAT_VERSION,
            saved_at,
            categories: BTreeMap::new(),
        }
    }
}

/// Everything needed to rebuild one category, apart from the index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySection {
    pub dimension: usize,
    pub index_file: String,
    pub index_generation: u64,
    pub slots: BTreeMap<SlotId, SlotMetadata>,
    pub records: BTreeMap<SlotId, MemoryRecord>,
    pub archive: Vec<ArchivedRecord>,
    pub clusters: ClusterTable,
    pub partitions: PartitionTable,
    pub saved_at: u64,
}

/// Category name as used in file names. ASCII letters, digits and '-'
/// pass through; every other byte becomes `_xx` (lowercase hex), so two
/// distinct names never share a stem.
pub fn file_stem(category: &str) -> String {
    let mut stem = String::with_capacity(category.len());
    for byte in category.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("_{:02x}", byte));
        }
    }
    stem
}

pub fn index_file_name(category: &str, generation: u64) -> String {
    format!("{}.{}.{}", file_stem(category), generation, INDEX_EXTENSION)
}

/// Read metadata.json. `Ok(None)` when the file does not exist.
pub fn read_document(dir: &Path) -> Result<Option<MetadataDocument>> {
    let path = dir.join(METADATA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path).map_err(|e| MnemoError::persistence("read metadata", e))?;
    let doc: MetadataDocument =
        serde_json::from_slice(&bytes).map_err(|e| MnemoError::persistence("parse metadata", e))?;
    if doc.version != FORMAT_VERSION {
        return Err(MnemoError::PersistenceFailure(format!(
            "unsupported metadata version {} (expected {})",
            doc.version, FORMAT_VERSION
        )));
    }
    Ok(Some(doc))
}

/// Write metadata.json through a temp file and rename.
pub fn write_document(dir: &Path, doc: &MetadataDocument) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(doc).map_err(|e| MnemoError::persistence("encode metadata", e))?;
    let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
    {
        let mut file = fs::File::create(&tmp).map_err(|e| MnemoError::persistence("create metadata", e))?;
        file.write_all(&bytes).map_err(|e| MnemoError::persistence("write metadata", e))?;
        file.sync_all().map_err(|e| MnemoError::persistence("sync metadata", e))?;
    }
    fs::rename(&tmp, dir.join(METADATA_FILE)).map_err(|e| MnemoError::persistence("rename metadata", e))?;
    Ok(())
}

/// Delete index files of `category` not listed in `keep`. Returns the
/// number removed; failures are logged and skipped.
pub fn remove_stale_indexes(dir: &Path, category: &str, keep: &BTreeSet<String>) -> usize {
    let stem = file_stem(category);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot list data dir for index cleanup");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if keep.contains(&name) {
            continue;
        }
        let Some(rest) = name.strip_suffix(&format!(".{}", INDEX_EXTENSION)) else { continue };
        let Some((owner, generation)) = rest.rsplit_once('.') else { continue };
        if owner != stem || generation.parse::<u64>().is_err() {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                removed += 1;
                debug!(file = %name, "Removed stale index file");
            }
            Err(e) => warn!(file = %name, error = %e, "Failed to remove stale index file"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_names() {
        assert_eq!(file_stem("work/notes v2"), "work_2fnotes_20v2");
        assert_eq!(file_stem("a b"), "a_20b");
        assert_eq!(file_stem("a_b"), "a_5fb");
        assert_eq!(file_stem("a.1"), "a_2e1");
        assert_eq!(index_file_name("episodic", 17), "episodic.17.index");
    }

    #[test]
    fn test_document_round_trip() {
        let dir = TempDir::new().unwrap();
        assert!(read_document(dir.path()).unwrap().is_none());

        let doc = MetadataDocument::new(1234);
        write_document(dir.path(), &doc).unwrap();
        let loaded = read_document(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.saved_at, 1234);
        assert!(loaded.categories.is_empty());
        assert!(!dir.path().join("metadata.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_document_is_persistence_failure() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(METADATA_FILE), b"{ not json").unwrap();
        let err = read_document(dir.path()).unwrap_err();
        assert!(matches!(err, MnemoError::PersistenceFailure(_)));
    }

    #[test]
    fn test_remove_stale_indexes_only_touches_owner() {
        let dir = TempDir::new().unwrap();
        for name in ["episodic.1.index", "episodic.2.index", "episodic_5fx.1.index", "semantic.1.index", "episodic.notes"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let keep = BTreeSet::from(["episodic.2.index".to_string()]);
        assert_eq!(remove_stale_indexes(dir.path(), "episodic", &keep), 1);
        assert!(dir.path().join("episodic.2.index").exists());
        assert!(dir.path().join("episodic_5fx.1.index").exists());
        assert!(dir.path().join("semantic.1.index").exists());
        assert!(dir.path().join("episodic.notes").exists());
    }
}
