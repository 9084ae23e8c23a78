//! Raw and scaled scoring of a copy against a correction key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::types::{letter_index, Part, QuestionNumber, Section};

/// Highest scaled score of either section.
pub const MAX_SCALED_SECTION_SCORE: u32 = 495;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRow {
    pub question: QuestionNumber,
    pub letter: char,
}

/// Correct answer per question, in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnswerKey {
    pub rows: Vec<KeyRow>,
}

#[derive(Debug, thiserror::Error)]
pub enum AnswerKeyError {
    #[error("cannot read answer key {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("malformed answer key line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

impl AnswerKey {
    pub fn load(path: &Path) -> Result<Self, AnswerKeyError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| AnswerKeyError::Io(path.to_path_buf(), e))?;
        Self::parse(&text)
    }

    /// Parses `question,letter` lines. Blank lines are skipped; the letter is
    /// trimmed and upper-cased. Any other malformed line rejects the key.
    pub fn parse(text: &str) -> Result<Self, AnswerKeyError> {
        let mut rows = vec![];
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let malformed = || AnswerKeyError::Malformed {
                line: index + 1,
                text: line.to_string(),
            };
            let (question, letter) = line.split_once(',').ok_or_else(malformed)?;
            let question = question.trim().parse().map_err(|_| malformed())?;
            let mut letters = letter.trim().chars();
            let letter = match (letters.next(), letters.next()) {
                (Some(letter), None) => letter.to_ascii_uppercase(),
                _ => return Err(malformed()),
            };
            rows.push(KeyRow { question, letter });
        }
        Ok(Self { rows })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaledEntry {
    pub listening: u32,
    pub reading: u32,
}

/// Raw section score → scaled score lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScaledScoreTable {
    entries: BTreeMap<u32, ScaledEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScoreTableError {
    #[error("cannot read score table {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("cannot parse score table: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("score table key {0:?} is not a raw score")]
    Key(String),
}

impl ScaledScoreTable {
    pub fn new(entries: BTreeMap<u32, ScaledEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, ScoreTableError> {
        let json =
            std::fs::read_to_string(path).map_err(|e| ScoreTableError::Io(path.to_path_buf(), e))?;
        Self::from_json(&json)
    }

    /// Reads `{ "<raw>": { "listening": n, "reading": n } }`.
    pub fn from_json(json: &str) -> Result<Self, ScoreTableError> {
        let raw: BTreeMap<String, ScaledEntry> = serde_json::from_str(json)?;
        let entries = raw
            .into_iter()
            .map(|(key, entry)| {
                key.trim()
                    .parse::<u32>()
                    .map(|raw| (raw, entry))
                    .map_err(|_| ScoreTableError::Key(key))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// Scaled score for a raw section score; unknown raw scores count as 0.
    pub fn scaled(&self, section: Section, raw: u32) -> u32 {
        let entry = self.entries.get(&raw).copied().unwrap_or_default();
        let value = match section {
            Section::Listening => entry.listening,
            Section::Reading => entry.reading,
        };
        value.min(MAX_SCALED_SECTION_SCORE)
    }
}

fn zeroed_subparts() -> BTreeMap<Part, u32> {
    Part::ALL.into_iter().map(|part| (part, 0)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreSummary {
    pub raw_score: u32,
    pub listening: u32,
    pub reading: u32,
    pub subparts: BTreeMap<Part, u32>,
    pub scaled_listening: u32,
    pub scaled_reading: u32,
    pub scaled_total: u32,
}

impl Default for ScoreSummary {
    fn default() -> Self {
        Self {
            raw_score: 0,
            listening: 0,
            reading: 0,
            subparts: zeroed_subparts(),
            scaled_listening: 0,
            scaled_reading: 0,
            scaled_total: 0,
        }
    }
}

pub struct Scorer {
    key: Option<AnswerKey>,
    table: ScaledScoreTable,
    choices: usize,
}

impl Scorer {
    pub fn new(key: Option<AnswerKey>, table: ScaledScoreTable, choices: usize) -> Self {
        Self {
            key,
            table,
            choices,
        }
    }

    /// Loads whatever is available. A missing or broken key scores every copy
    /// 0; a missing or broken table scales every raw score to 0.
    pub fn from_paths(key: Option<&Path>, table: Option<&Path>, choices: usize) -> Self {
        let key = key.and_then(|path| match AnswerKey::load(path) {
            Ok(key) => {
                debug!("loaded {} answer key rows from {}", key.rows.len(), path.display());
                Some(key)
            }
            Err(e) => {
                warn!("{}; scores will be 0", e);
                None
            }
        });
        let table = table.map_or_else(ScaledScoreTable::default, |path| {
            ScaledScoreTable::load(path).unwrap_or_else(|e| {
                warn!("{} ({}); scaled scores will be 0", e, path.display());
                ScaledScoreTable::default()
            })
        });
        Self::new(key, table, choices)
    }

    pub fn score(&self, filled: &[bool]) -> ScoreSummary {
        let mut summary = ScoreSummary::default();
        let Some(key) = &self.key else {
            return summary;
        };

        for row in &key.rows {
            let Some(start) = (row.question as usize)
                .checked_sub(1)
                .map(|q| q * self.choices)
            else {
                continue;
            };
            let Some(group) = filled.get(start..start + self.choices) else {
                continue;
            };
            let mut marked = group.iter().enumerate().filter(|&(_, &f)| f).map(|(i, _)| i);
            let only_mark = match (marked.next(), marked.next()) {
                (Some(index), None) => Some(index),
                _ => None,
            };
            if only_mark.is_none() || only_mark != letter_index(row.letter, self.choices) {
                continue;
            }

            summary.raw_score += 1;
            match Section::for_question(row.question) {
                Some(Section::Listening) => summary.listening += 1,
                Some(Section::Reading) => summary.reading += 1,
                None => {}
            }
            if let Some(part) = Part::for_question(row.question) {
                *summary.subparts.entry(part).or_default() += 1;
            }
        }

        summary.scaled_listening = self.table.scaled(Section::Listening, summary.listening);
        summary.scaled_reading = self.table.scaled(Section::Reading, summary.reading);
        summary.scaled_total = summary.scaled_listening + summary.scaled_reading;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    fn one_hot(answers: &[Option<usize>]) -> Vec<bool> {
        answers
            .iter()
            .flat_map(|a| (0..4).map(move |i| *a == Some(i)))
            .collect()
    }

    fn table(pairs: &[(u32, u32, u32)]) -> ScaledScoreTable {
        ScaledScoreTable::new(
            pairs
                .iter()
                .map(|&(raw, listening, reading)| (raw, ScaledEntry { listening, reading }))
                .collect(),
        )
    }

    #[test]
    fn single_correct_mark_scores() {
        let key = AnswerKey::parse("1,B\n").unwrap();
        let scorer = Scorer::new(Some(key), ScaledScoreTable::default(), 4);
        let summary = scorer.score(&[false, true, false, false]);
        assert_eq!(summary.raw_score, 1);
        assert_eq!(summary.listening, 1);
        assert_eq!(summary.subparts[&Part::Part1], 1);
    }

    #[test]
    fn zero_or_multiple_marks_never_score() {
        let key = AnswerKey::parse("1,A\n2,A\n3,C").unwrap();
        let scorer = Scorer::new(Some(key), ScaledScoreTable::default(), 4);
        let mut filled = one_hot(&[None, Some(0), Some(2)]);
        filled[5] = true;
        assert_eq!(scorer.score(&filled).raw_score, 1);
    }

    #[test]
    fn sections_parts_and_scaling() {
        let key = AnswerKey::parse("7, b\n101,d\n150,A\n250,A\n\n").unwrap();
        let mut answers = vec![None; 200];
        answers[6] = Some(1);
        answers[100] = Some(3);
        answers[149] = Some(0);
        let scorer = Scorer::new(Some(key), table(&[(1, 10, 20), (2, 15, 600)]), 4);

        let summary = scorer.score(&one_hot(&answers));
        assert_eq!(summary.raw_score, 3);
        assert_eq!(summary.listening, 1);
        assert_eq!(summary.reading, 2);
        assert_eq!(summary.subparts[&Part::Part2], 1);
        assert_eq!(summary.subparts[&Part::Part5], 1);
        assert_eq!(summary.subparts[&Part::Part7], 1);
        assert_eq!(summary.subparts[&Part::Part3], 0);
        assert_eq!(summary.scaled_listening, 10);
        assert_eq!(summary.scaled_reading, 495);
        assert_eq!(summary.scaled_total, 505);
    }

    #[test]
    fn malformed_key_is_rejected() {
        assert!(matches!(
            AnswerKey::parse("1,A\nfoo,B\n"),
            Err(AnswerKeyError::Malformed { line: 2, .. })
        ));
        assert!(AnswerKey::parse("1,AB").is_err());
        assert!(AnswerKey::parse("1").is_err());
    }

    #[test]
    fn missing_files_give_a_zero_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut key = std::fs::File::create(dir.path().join("key.csv")).unwrap();
        writeln!(key, "1,A").unwrap();

        let scorer = Scorer::from_paths(
            Some(&dir.path().join("missing.csv")),
            Some(&dir.path().join("missing.json")),
            4,
        );
        assert_eq!(scorer.score(&one_hot(&[Some(0)])), ScoreSummary::default());

        let scorer = Scorer::from_paths(
            Some(&dir.path().join("key.csv")),
            Some(&dir.path().join("missing.json")),
            4,
        );
        let summary = scorer.score(&one_hot(&[Some(0)]));
        assert_eq!(summary.raw_score, 1);
        assert_eq!(summary.scaled_total, 0);
    }

    #[test]
    fn table_accepts_padded_keys_and_partial_entries() {
        let table = ScaledScoreTable::from_json(r#"{"0": {"listening": 5}, " 12 ": {"reading": 60}}"#)
            .unwrap();
        assert_eq!(table.scaled(Section::Listening, 0), 5);
        assert_eq!(table.scaled(Section::Reading, 0), 0);
        assert_eq!(table.scaled(Section::Reading, 12), 60);
        assert_eq!(table.scaled(Section::Reading, 13), 0);
        assert!(matches!(
            ScaledScoreTable::from_json(r#"{"ten": {}}"#),
            Err(ScoreTableError::Key(_))
        ));
    }

    proptest! {
        #[test]
        fn raw_score_never_exceeds_key_rows(
            key in proptest::collection::vec((1u32..=210, 0usize..5), 0..60),
            filled in proptest::collection::vec(any::<bool>(), 0..800),
            scaled in proptest::collection::vec((0u32..=200, 0u32..1000, 0u32..1000), 0..20),
        ) {
            let rows = key
                .iter()
                .map(|&(question, letter)| KeyRow { question, letter: (b'A' + letter as u8) as char })
                .collect::<Vec<_>>();
            let row_count = rows.len() as u32;
            let scorer = Scorer::new(Some(AnswerKey { rows }), table(&scaled), 4);
            let summary = scorer.score(&filled);
            prop_assert!(summary.raw_score <= row_count);
            prop_assert_eq!(summary.raw_score, summary.listening + summary.reading);
            prop_assert!(summary.scaled_listening <= MAX_SCALED_SECTION_SCORE);
            prop_assert!(summary.scaled_reading <= MAX_SCALED_SECTION_SCORE);
        }
    }
}
