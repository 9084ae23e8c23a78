//! Decoding the student name from the filled bubbles of the name block.
//!
//! Each grid column is one character slot. The top rows carry accents, the
//! rows below carry letters; a slot with an accent and a letter composes them
//! into one accented character.

use std::collections::BTreeSet;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterParams, Reducer};
use crate::grid::{BubbleGrid, GridError, NameLayout};
use crate::types::Center;

pub const ACCENTS: [char; 7] = ['ˆ', '°', '`', '´', '”', '~', '¸'];

pub const LETTERS: [char; 28] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '-', ',',
];

/// `(accent, letter, composed)`
const ACCENT_COMBINATIONS: [(char, char, char); 24] = [
    ('ˆ', 'A', 'Â'),
    ('ˆ', 'E', 'Ê'),
    ('ˆ', 'I', 'Î'),
    ('ˆ', 'O', 'Ô'),
    ('ˆ', 'U', 'Û'),
    ('°', 'A', 'Å'),
    ('´', 'A', 'Á'),
    ('´', 'E', 'É'),
    ('´', 'I', 'Í'),
    ('´', 'O', 'Ó'),
    ('´', 'U', 'Ú'),
    ('”', 'A', 'Ä'),
    ('”', 'E', 'Ë'),
    ('”', 'I', 'Ï'),
    ('”', 'O', 'Ö'),
    ('”', 'U', 'Ü'),
    ('”', 'Y', 'Ÿ'),
    ('~', 'A', 'Ã'),
    ('~', 'N', 'Ñ'),
    ('~', 'O', 'Õ'),
    ('¸', 'C', 'Ç'),
    ('`', 'A', 'À'),
    ('`', 'E', 'È'),
    ('`', 'U', 'Ù'),
];

/// Marker for a slot whose bubbles cannot be read unambiguously.
pub const UNREADABLE: char = '?';

/// Composes an accent with a letter; pairs with no composed form are written
/// as the accent followed by the letter.
pub fn compose(accent: Option<char>, letter: char) -> String {
    let Some(accent) = accent else {
        return letter.to_string();
    };
    ACCENT_COMBINATIONS
        .iter()
        .find(|(a, l, _)| *a == accent && *l == letter)
        .map_or_else(|| format!("{}{}", accent, letter), |(_, _, c)| c.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NameDecoderConfig {
    /// Clustering of the name grid's x values into character slots.
    pub columns: ClusterParams,
    /// Clustering of the name grid's y values into accent and letter rows.
    pub rows: ClusterParams,
    /// A filled cell belongs to a slot when strictly closer than this.
    pub column_tolerance: i32,
    /// A filled cell belongs to a row when strictly closer than this.
    pub row_tolerance: i32,
}

impl Default for NameDecoderConfig {
    fn default() -> Self {
        Self {
            columns: ClusterParams {
                eps: 10.0,
                min_samples: 2,
                reducer: Reducer::Median,
            },
            rows: ClusterParams {
                eps: 8.0,
                min_samples: 2,
                reducer: Reducer::Median,
            },
            column_tolerance: 10,
            row_tolerance: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("{centers} name centers but {filled} fill decisions")]
    Parity { centers: usize, filled: usize },
    #[error("name grid: {0}")]
    Grid(#[from] GridError),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedName {
    pub text: String,
    /// Slot indices, left to right, that decoded to [`UNREADABLE`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous_columns: Vec<usize>,
}

enum Slot {
    Blank,
    Text(String),
    Unreadable,
}

pub fn decode_name(
    centers: &[Center],
    filled: &[bool],
    layout: &NameLayout,
    config: &NameDecoderConfig,
) -> Result<DecodedName, NameError> {
    if centers.len() != filled.len() {
        return Err(NameError::Parity {
            centers: centers.len(),
            filled: filled.len(),
        });
    }

    let grid = BubbleGrid::from_centers(centers, &config.columns, &config.rows);
    layout.validate(&grid)?;

    let marked = centers
        .iter()
        .zip(filled)
        .filter(|&(_, &f)| f)
        .map(|(c, _)| *c)
        .collect::<Vec<_>>();

    let mut raw = String::new();
    let mut ambiguous_columns = vec![];
    for (index, &column) in grid.columns.iter().enumerate() {
        let cells = marked
            .iter()
            .filter(|c| (c.x - column).abs() < config.column_tolerance)
            .collect::<Vec<_>>();
        match decode_slot(&cells, &grid.rows, layout, config.row_tolerance) {
            Slot::Blank => raw.push(' '),
            Slot::Text(text) => raw.push_str(&text),
            Slot::Unreadable => {
                warn!("name slot {} has conflicting marks", index);
                raw.push(UNREADABLE);
                ambiguous_columns.push(index);
            }
        }
    }

    let text = normalize_whitespace(&raw);
    debug!("decoded name {:?} from {} marked cells", text, marked.len());
    Ok(DecodedName {
        text,
        ambiguous_columns,
    })
}

fn decode_slot(cells: &[&Center], rows: &[i32], layout: &NameLayout, tolerance: i32) -> Slot {
    if cells.is_empty() {
        return Slot::Blank;
    }

    let mut accents = BTreeSet::new();
    let mut letters = BTreeSet::new();
    for cell in cells {
        let matching = rows
            .iter()
            .enumerate()
            .filter(|&(_, &row)| (cell.y - row).abs() < tolerance)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        match matching[..] {
            [] => {}
            [row] if row < layout.accent_rows => {
                accents.insert(row);
            }
            [row] => {
                letters.insert(row - layout.accent_rows);
            }
            _ => return Slot::Unreadable,
        }
    }

    if accents.len() > 1 || letters.len() > 1 {
        return Slot::Unreadable;
    }
    let accent = accents.first().and_then(|&i| ACCENTS.get(i)).copied();
    match letters.first().and_then(|&i| LETTERS.get(i)) {
        Some(&letter) => Slot::Text(compose(accent, letter)),
        None => Slot::Blank,
    }
}

/// Trims and collapses runs of whitespace into a single space.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Directory-friendly form of a decoded name: accented letters folded to
/// their base letter, loose accent marks dropped, words title-cased and
/// joined with `_`. `None` when nothing usable is left.
pub fn folder_name(name: &str) -> Option<String> {
    let folded = name
        .chars()
        .filter_map(|c| {
            if ACCENTS.contains(&c) {
                return None;
            }
            Some(
                ACCENT_COMBINATIONS
                    .iter()
                    .find(|(_, _, composed)| *composed == c)
                    .map_or(c, |(_, letter, _)| *letter),
            )
        })
        .collect::<String>();
    let normalized = normalize_whitespace(&folded);
    if normalized.is_empty() {
        return None;
    }

    let mut title = String::with_capacity(normalized.len());
    let mut previous_alphabetic = false;
    for c in normalized.chars() {
        if previous_alphabetic {
            title.extend(c.to_lowercase());
        } else {
            title.extend(c.to_uppercase());
        }
        previous_alphabetic = c.is_alphabetic();
    }
    Some(title.replace(' ', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const X0: i32 = 20;
    const DX: i32 = 40;
    const Y0: i32 = 15;
    const DY: i32 = 30;

    /// Full name grid with `slots` columns and the given `(slot, row)` marks.
    fn name_sheet(slots: usize, marks: &[(usize, usize)]) -> (Vec<Center>, Vec<bool>) {
        let layout = NameLayout::default();
        let mut centers = vec![];
        let mut filled = vec![];
        for row in 0..layout.row_count() {
            for slot in 0..slots {
                centers.push(Center::new(X0 + slot as i32 * DX, Y0 + row as i32 * DY));
                filled.push(marks.contains(&(slot, row)));
            }
        }
        (centers, filled)
    }

    fn letter_row(letter: char) -> usize {
        7 + LETTERS.iter().position(|&l| l == letter).unwrap()
    }

    fn accent_row(accent: char) -> usize {
        ACCENTS.iter().position(|&a| a == accent).unwrap()
    }

    fn decode(slots: usize, marks: &[(usize, usize)]) -> DecodedName {
        let (centers, filled) = name_sheet(slots, marks);
        decode_name(
            &centers,
            &filled,
            &NameLayout::default(),
            &NameDecoderConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn composes_accents_and_letters() {
        assert_eq!(compose(Some('”'), 'A'), "Ä");
        assert_eq!(compose(Some('¸'), 'C'), "Ç");
        assert_eq!(compose(Some('°'), 'E'), "°E");
        assert_eq!(compose(None, '-'), "-");
    }

    #[test]
    fn decodes_letters_accents_and_spaces() {
        let name = decode(
            7,
            &[
                (0, letter_row('L')),
                (1, letter_row('E')),
                (1, accent_row('´')),
                (2, letter_row('A')),
                (4, letter_row('B')),
                (5, letter_row('O')),
            ],
        );
        assert_eq!(name.text, "LÉA BO");
        assert!(name.ambiguous_columns.is_empty());
    }

    #[test]
    fn accent_without_letter_is_a_space() {
        let name = decode(
            3,
            &[
                (0, letter_row('A')),
                (1, accent_row('~')),
                (2, letter_row('N')),
            ],
        );
        assert_eq!(name.text, "A N");
    }

    #[test]
    fn empty_sheet_decodes_to_empty_name() {
        assert_eq!(decode(4, &[]), DecodedName::default());
    }

    #[test]
    fn two_letters_in_one_slot_are_flagged() {
        let name = decode(
            3,
            &[
                (0, letter_row('A')),
                (1, letter_row('B')),
                (1, letter_row('C')),
                (2, letter_row('D')),
            ],
        );
        assert_eq!(name.text, "A?D");
        assert_eq!(name.ambiguous_columns, vec![1]);
    }

    #[test]
    fn cell_between_two_rows_is_flagged() {
        let (mut centers, filled) = name_sheet(2, &[(0, letter_row('A'))]);
        // a stray mark straddling two row windows in slot 1
        centers.push(Center::new(X0 + DX, Y0 + 10 * DY + DY / 2));
        let mut filled = filled;
        filled.push(true);
        let config = NameDecoderConfig {
            row_tolerance: 20,
            ..NameDecoderConfig::default()
        };
        let name = decode_name(&centers, &filled, &NameLayout::default(), &config).unwrap();
        assert_eq!(name.text, "A?");
        assert_eq!(name.ambiguous_columns, vec![1]);
    }

    #[test]
    fn wrong_row_count_is_a_grid_error() {
        let (centers, filled) = name_sheet(3, &[]);
        let truncated = centers.len() - 3;
        let result = decode_name(
            &centers[..truncated],
            &filled[..truncated],
            &NameLayout::default(),
            &NameDecoderConfig::default(),
        );
        assert!(matches!(
            result,
            Err(NameError::Grid(GridError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn parity_is_checked() {
        let (centers, filled) = name_sheet(2, &[]);
        assert_eq!(
            decode_name(
                &centers,
                &filled[1..],
                &NameLayout::default(),
                &NameDecoderConfig::default()
            ),
            Err(NameError::Parity {
                centers: 70,
                filled: 69
            })
        );
    }

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(normalize_whitespace("  JEAN   PAUL "), "JEAN PAUL");
        assert_eq!(normalize_whitespace("   "), "");
    }

    #[test]
    fn folder_names_are_ascii_title_case() {
        assert_eq!(folder_name("LÉA DUPONT").as_deref(), Some("Lea_Dupont"));
        assert_eq!(
            folder_name("JEAN-PIERRE ÇA").as_deref(),
            Some("Jean-Pierre_Ca")
        );
        assert_eq!(folder_name("°E").as_deref(), Some("E"));
        assert_eq!(folder_name("  "), None);
    }
}
