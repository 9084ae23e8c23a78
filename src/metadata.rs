//! The per-copy `meta.json` record.
//!
//! Every field is defaulted so records written by older versions, or only
//! partially written, still load.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::resolve::AmbiguityMap;
use crate::score::ScoreSummary;
use crate::types::{Center, QuestionNumber};

pub const METADATA_VERSION: u32 = 1;
pub const METADATA_FILE_NAME: &str = "meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyRecord {
    pub version: u32,
    /// Scan the copy was imported from.
    pub image: Option<PathBuf>,
    #[serde(alias = "nom")]
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub name_ambiguous_columns: Vec<usize>,
    pub aligned: bool,
    pub filled: Vec<bool>,
    pub centers: Vec<Center>,
    #[serde(alias = "douteux")]
    pub ambiguous: AmbiguityMap,
    /// Questions whose answers a reviewer changed.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub modified: BTreeSet<QuestionNumber>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(flatten)]
    pub score: ScoreSummary,
}

impl Default for CopyRecord {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            image: None,
            name: String::new(),
            name_ambiguous_columns: vec![],
            aligned: false,
            filled: vec![],
            centers: vec![],
            ambiguous: BTreeMap::new(),
            modified: BTreeSet::new(),
            issues: vec![],
            score: ScoreSummary::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("cannot read {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("cannot parse {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("cannot write {0}: {1}")]
    Persist(PathBuf, tempfile::PersistError),
    #[error("{0} was written by a newer version ({1})")]
    UnsupportedVersion(PathBuf, u32),
}

impl CopyRecord {
    pub fn path_in(copy_dir: &Path) -> PathBuf {
        copy_dir.join(METADATA_FILE_NAME)
    }

    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let json =
            std::fs::read_to_string(path).map_err(|e| MetadataError::Io(path.to_path_buf(), e))?;
        let record: CopyRecord =
            serde_json::from_str(&json).map_err(|e| MetadataError::Parse(path.to_path_buf(), e))?;
        if record.version > METADATA_VERSION {
            return Err(MetadataError::UnsupportedVersion(
                path.to_path_buf(),
                record.version,
            ));
        }
        Ok(record)
    }

    /// Writes the record next to `path` and renames it into place, so readers
    /// see either the old record or the new one.
    pub fn save(&self, path: &Path) -> Result<(), MetadataError> {
        let io_error = |e: std::io::Error| MetadataError::Io(path.to_path_buf(), e);
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
        let json = serde_json::to_string_pretty(&CopyRecord {
            version: METADATA_VERSION,
            ..self.clone()
        })
        .map_err(|e| MetadataError::Parse(path.to_path_buf(), e))?;
        file.write_all(json.as_bytes()).map_err(io_error)?;
        file.as_file().sync_all().map_err(io_error)?;
        file.persist(path)
            .map_err(|e| MetadataError::Persist(path.to_path_buf(), e))?;
        Ok(())
    }
}
