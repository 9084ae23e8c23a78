//! One student's copy on disk and the manual review hand-off.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::debug::trace_block;
use crate::metadata::{CopyRecord, MetadataError};
use crate::name::folder_name;
use crate::score::Scorer;
use crate::template::Block;
use crate::types::QuestionNumber;

/// Corrected fill vector per question, as returned by a reviewer.
pub type Corrections = BTreeMap<QuestionNumber, Vec<bool>>;

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("cannot read corrections {0}: {1}")]
    CorrectionsIo(PathBuf, std::io::Error),
    #[error("cannot parse corrections {0}: {1}")]
    CorrectionsParse(PathBuf, serde_json::Error),
    #[error("correction for question {question} has {found} choices, expected {expected}")]
    CorrectionLength {
        question: QuestionNumber,
        expected: usize,
        found: usize,
    },
    #[error("question {question} is not on this copy ({questions} questions)")]
    UnknownQuestion {
        question: QuestionNumber,
        questions: usize,
    },
    #[error("cannot rename {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
    #[error("cannot write {0}: {1}")]
    Image(PathBuf, image::ImageError),
}

pub fn load_corrections(path: &Path) -> Result<Corrections, CopyError> {
    let json =
        std::fs::read_to_string(path).map_err(|e| CopyError::CorrectionsIo(path.to_path_buf(), e))?;
    serde_json::from_str(&json).map_err(|e| CopyError::CorrectionsParse(path.to_path_buf(), e))
}

/// File name of an extracted block image for a scan named `stem`.
pub fn block_file_name(stem: &str, block: Block) -> String {
    format!("{}_{}.png", stem, block.label())
}

/// File name of the traced version of a block image.
pub fn traced_file_name(stem: &str, block: Block) -> String {
    format!("{}_{}_traced.png", stem, block.label())
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReviewOutcome {
    /// Questions whose answers the correction changed.
    pub modified: Vec<QuestionNumber>,
    /// Ambiguous questions the correction did not cover.
    pub still_ambiguous: Vec<QuestionNumber>,
}

#[derive(Debug, Clone)]
pub struct StudentCopy {
    pub dir: PathBuf,
    pub record: CopyRecord,
}

impl StudentCopy {
    pub fn new(dir: PathBuf, record: CopyRecord) -> Self {
        Self { dir, record }
    }

    pub fn open(dir: &Path) -> Result<Self, CopyError> {
        let record = CopyRecord::load(&CopyRecord::path_in(dir))?;
        Ok(Self::new(dir.to_path_buf(), record))
    }

    pub fn meta_path(&self) -> PathBuf {
        CopyRecord::path_in(&self.dir)
    }

    pub fn save(&self) -> Result<(), CopyError> {
        self.record.save(&self.meta_path())?;
        Ok(())
    }

    pub fn needs_review(&self) -> bool {
        !self.record.ambiguous.is_empty()
    }

    /// Stem of the scan this copy came from, used to name its block images.
    pub fn stem(&self) -> String {
        self.record
            .image
            .as_deref()
            .and_then(Path::file_stem)
            .map_or_else(|| "copy".to_string(), |s| s.to_string_lossy().into_owned())
    }

    /// Applies a reviewer's corrections, rescores, and persists the result.
    /// The in-memory record only changes once the new record is on disk.
    pub fn apply_review(
        &mut self,
        corrections: &Corrections,
        scorer: &Scorer,
        choices: usize,
    ) -> Result<ReviewOutcome, CopyError> {
        let questions = self.record.filled.len() / choices.max(1);
        for (&question, values) in corrections {
            if question == 0 || question as usize > questions {
                return Err(CopyError::UnknownQuestion {
                    question,
                    questions,
                });
            }
            if values.len() != choices {
                return Err(CopyError::CorrectionLength {
                    question,
                    expected: choices,
                    found: values.len(),
                });
            }
        }

        let mut record = self.record.clone();
        let mut outcome = ReviewOutcome::default();
        for (&question, values) in corrections {
            let start = (question as usize - 1) * choices;
            let group = &mut record.filled[start..start + choices];
            if *group != values[..] {
                group.copy_from_slice(values);
                record.modified.insert(question);
                outcome.modified.push(question);
            }
        }
        record.ambiguous.retain(|question, _| !corrections.contains_key(question));
        outcome.still_ambiguous = record.ambiguous.keys().copied().collect();
        record.score = scorer.score(&record.filled);

        record.save(&self.meta_path())?;
        self.record = record;
        info!(
            "{}: {} questions changed, {} still ambiguous, raw score {}",
            self.dir.display(),
            outcome.modified.len(),
            outcome.still_ambiguous.len(),
            self.record.score.raw_score
        );
        Ok(outcome)
    }

    /// Redraws the traced questions image from the current record, when the
    /// extracted block is still next to it.
    pub fn retrace_questions(&self, choices: usize) -> Result<Option<PathBuf>, CopyError> {
        let stem = self.stem();
        let block_path = self.dir.join(block_file_name(&stem, Block::Questions));
        let block = match image::open(&block_path) {
            Ok(block) => block.into_luma8(),
            Err(e) => {
                warn!("cannot reopen {}: {}", block_path.display(), e);
                return Ok(None);
            }
        };
        let traced_path = self.dir.join(traced_file_name(&stem, Block::Questions));
        trace_block(
            &block,
            &self.record.centers,
            &self.record.filled,
            choices,
            &self.record.ambiguous,
            &self.record.modified,
        )
        .save(&traced_path)
        .map_err(|e| CopyError::Image(traced_path.clone(), e))?;
        Ok(Some(traced_path))
    }

    /// Renames the copy's directory after the decoded name. Leaves it alone
    /// when the name is empty or the target is taken.
    pub fn rename_after_name(&mut self) -> Result<bool, CopyError> {
        let Some(folder) = folder_name(&self.record.name) else {
            return Ok(false);
        };
        let Some(parent) = self.dir.parent() else {
            return Ok(false);
        };
        let target = parent.join(folder);
        if target == self.dir {
            return Ok(false);
        }
        if target.exists() {
            warn!(
                "{} already exists, keeping {}",
                target.display(),
                self.dir.display()
            );
            return Ok(false);
        }
        std::fs::rename(&self.dir, &target)
            .map_err(|e| CopyError::Rename(self.dir.clone(), target.clone(), e))?;
        info!("renamed {} to {}", self.dir.display(), target.display());
        self.dir = target;
        Ok(true)
    }
}

/// Questions a reviewer needs to look at across a batch, by copy directory.
pub fn pending_reviews(copies: &[StudentCopy]) -> BTreeMap<PathBuf, BTreeSet<QuestionNumber>> {
    copies
        .iter()
        .filter(|copy| copy.needs_review())
        .map(|copy| {
            (
                copy.dir.clone(),
                copy.record.ambiguous.keys().copied().collect(),
            )
        })
        .collect()
}
