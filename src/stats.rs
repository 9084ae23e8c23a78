//! Score statistics over a processed batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Serialize;

use crate::metadata::{CopyRecord, METADATA_FILE_NAME};
use crate::types::Part;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: u32,
    pub max: u32,
}

impl Summary {
    pub fn of(values: &[u32]) -> Option<Self> {
        let mut sorted = values.to_vec();
        sorted.sort_unstable();
        let (&min, &max) = (sorted.first()?, sorted.last()?);
        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2] as f64
        } else {
            (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0
        };
        Some(Self {
            count: n,
            mean: sorted.iter().map(|&v| v as f64).sum::<f64>() / n as f64,
            median,
            min,
            max,
        })
    }
}

/// Statistics of one part, with its display name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartStatistics {
    pub label: &'static str,
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub copies: usize,
    pub needs_review: usize,
    pub raw_score: Option<Summary>,
    pub listening: Option<Summary>,
    pub reading: Option<Summary>,
    pub parts: BTreeMap<Part, PartStatistics>,
    pub scaled_listening: Option<Summary>,
    pub scaled_reading: Option<Summary>,
    pub scaled_total: Option<Summary>,
}

fn summarize(records: &[CopyRecord], value: impl Fn(&CopyRecord) -> u32) -> Option<Summary> {
    Summary::of(&records.iter().map(value).collect::<Vec<_>>())
}

pub fn batch_statistics(records: &[CopyRecord]) -> BatchStatistics {
    BatchStatistics {
        copies: records.len(),
        needs_review: records.iter().filter(|r| !r.ambiguous.is_empty()).count(),
        raw_score: summarize(records, |r| r.score.raw_score),
        listening: summarize(records, |r| r.score.listening),
        reading: summarize(records, |r| r.score.reading),
        parts: Part::ALL
            .into_iter()
            .map(|part| {
                let statistics = PartStatistics {
                    label: part.label(),
                    summary: summarize(records, |r| {
                        r.score.subparts.get(&part).copied().unwrap_or(0)
                    }),
                };
                (part, statistics)
            })
            .collect(),
        scaled_listening: summarize(records, |r| r.score.scaled_listening),
        scaled_reading: summarize(records, |r| r.score.scaled_reading),
        scaled_total: summarize(records, |r| r.score.scaled_total),
    }
}

/// Every metadata file at any depth below `dir`, in path order.
pub fn find_records(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = vec![];
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.file_name().map_or(false, |n| n == METADATA_FILE_NAME) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Loads every record below `dir`; unreadable ones are logged and skipped.
pub fn load_records(dir: &Path) -> std::io::Result<Vec<CopyRecord>> {
    Ok(find_records(dir)?
        .iter()
        .filter_map(|path| match CopyRecord::load(path) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("skipping record: {}", e);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::ScoreSummary;

    fn record(raw: u32, part1: u32, scaled_total: u32) -> CopyRecord {
        let mut score = ScoreSummary {
            raw_score: raw,
            listening: raw,
            scaled_total,
            ..ScoreSummary::default()
        };
        score.subparts.insert(Part::Part1, part1);
        CopyRecord {
            score,
            ..CopyRecord::default()
        }
    }

    #[test]
    fn summary_of_odd_and_even_samples() {
        assert_eq!(Summary::of(&[]), None);
        let odd = Summary::of(&[5, 1, 3]).unwrap();
        assert_eq!((odd.min, odd.max, odd.median, odd.mean), (1, 5, 3.0, 3.0));
        let even = Summary::of(&[4, 1, 2, 10]).unwrap();
        assert_eq!((even.median, even.mean, even.count), (3.0, 4.25, 4));
    }

    #[test]
    fn statistics_cover_parts_and_scaled_scores() {
        let stats = batch_statistics(&[record(10, 2, 300), record(20, 4, 500)]);
        assert_eq!(stats.copies, 2);
        assert_eq!(stats.raw_score.unwrap().mean, 15.0);
        assert_eq!(stats.parts[&Part::Part1].summary.unwrap().max, 4);
        assert_eq!(stats.parts[&Part::Part1].label, "Photographs");
        assert_eq!(stats.parts[&Part::Part7].summary.unwrap().max, 0);
        assert_eq!(stats.scaled_total.unwrap().median, 400.0);
        assert_eq!(stats.needs_review, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["parts"]["part5"]["label"], "Incomplete Sentences");
        assert_eq!(json["parts"]["part1"]["summary"]["max"], 4);
    }

    #[test]
    fn records_are_found_at_any_depth() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["copy_1", "Jean_Dupont", "nested/copy_2"] {
            let copy_dir = dir.path().join(sub);
            std::fs::create_dir_all(&copy_dir).unwrap();
            record(1, 1, 10).save(&CopyRecord::path_in(&copy_dir)).unwrap();
        }
        std::fs::write(dir.path().join("copy_1").join("notes.txt"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(METADATA_FILE_NAME), "{").unwrap();

        assert_eq!(find_records(dir.path()).unwrap().len(), 4);
        assert_eq!(load_records(dir.path()).unwrap().len(), 3);
    }
}
