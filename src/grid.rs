use image::GrayImage;
use log::debug;
use logging_timer::time;
use serde::{Deserialize, Serialize};

use crate::cluster::{canonical_positions, ClusterParams};
use crate::hough::{detect_circles, Circle, HoughCircleParams};
use crate::types::{Center, QuestionNumber};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("no circles detected")]
    NoCircles,
    #[error("expected a {}x{} grid, found {}x{}", .expected.0, .expected.1, .found.0, .found.1)]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("expected {expected} bubble centers, found {found}")]
    CenterCount { expected: usize, found: usize },
}

/// Canonical bubble columns × rows of one block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BubbleGrid {
    pub columns: Vec<i32>,
    pub rows: Vec<i32>,
}

impl BubbleGrid {
    /// Clusters raw centers into canonical columns and rows. Points that fall
    /// in no cluster are ignored; missing bubbles are filled in by the cross
    /// product.
    pub fn from_centers(centers: &[Center], columns: &ClusterParams, rows: &ClusterParams) -> Self {
        let xs = centers.iter().map(|c| c.x).collect::<Vec<_>>();
        let ys = centers.iter().map(|c| c.y).collect::<Vec<_>>();
        Self {
            columns: canonical_positions(&xs, columns),
            rows: canonical_positions(&ys, rows),
        }
    }

    /// `(columns, rows)`
    pub fn shape(&self) -> (usize, usize) {
        (self.columns.len(), self.rows.len())
    }

    pub fn len(&self) -> usize {
        self.columns.len() * self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every center, row by row, left to right within a row.
    pub fn centers_row_major(&self) -> Vec<Center> {
        self.rows
            .iter()
            .flat_map(|&y| self.columns.iter().map(move |&x| Center::new(x, y)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GridParams {
    pub hough: HoughCircleParams,
    pub columns: ClusterParams,
    pub rows: ClusterParams,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            hough: HoughCircleParams::default(),
            columns: ClusterParams::default(),
            rows: ClusterParams::default(),
        }
    }
}

/// Grid inferred from one block image, with the raw detections it came from.
#[derive(Debug, Clone)]
pub struct InferredGrid {
    pub grid: BubbleGrid,
    pub circles: Vec<Circle>,
}

#[time]
pub fn infer_grid(block: &GrayImage, params: &GridParams) -> Result<InferredGrid, GridError> {
    let circles = detect_circles(block, &params.hough);
    if circles.is_empty() {
        return Err(GridError::NoCircles);
    }
    let centers = circles.iter().map(|c| c.center).collect::<Vec<_>>();
    let grid = BubbleGrid::from_centers(&centers, &params.columns, &params.rows);
    debug!(
        "{} circles (weakest {} votes) clustered into {} columns x {} rows",
        circles.len(),
        circles.iter().map(|c| c.votes).min().unwrap_or(0),
        grid.columns.len(),
        grid.rows.len()
    );
    Ok(InferredGrid { grid, circles })
}

/// Arrangement of the questions block: answer columns side by side, each a
/// vertical run of questions with `choices` bubbles per question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuestionLayout {
    pub answer_columns: usize,
    pub questions_per_column: usize,
    pub choices: usize,
}

impl Default for QuestionLayout {
    fn default() -> Self {
        Self {
            answer_columns: 8,
            questions_per_column: 25,
            choices: 4,
        }
    }
}

/// The bubbles of one question, in choice order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionGroup {
    pub question: QuestionNumber,
    pub centers: Vec<Center>,
}

impl QuestionLayout {
    pub fn question_count(&self) -> usize {
        self.answer_columns * self.questions_per_column
    }

    pub fn bubble_count(&self) -> usize {
        self.question_count() * self.choices
    }

    /// `(columns, rows)` of the bubble grid.
    pub fn expected_shape(&self) -> (usize, usize) {
        (self.answer_columns * self.choices, self.questions_per_column)
    }

    pub fn question_groups(&self, grid: &BubbleGrid) -> Result<Vec<QuestionGroup>, GridError> {
        if grid.shape() != self.expected_shape() {
            return Err(GridError::ShapeMismatch {
                expected: self.expected_shape(),
                found: grid.shape(),
            });
        }
        self.groups_from_centers(&grid.centers_row_major())
    }

    /// Groups a row-major list of centers into questions numbered down each
    /// answer column, then across. Anything but exactly
    /// [`bubble_count`](Self::bubble_count) centers is rejected, since
    /// numbering would silently shift.
    pub fn groups_from_centers(&self, centers: &[Center]) -> Result<Vec<QuestionGroup>, GridError> {
        if centers.len() != self.bubble_count() || self.choices == 0 {
            return Err(GridError::CenterCount {
                expected: self.bubble_count(),
                found: centers.len(),
            });
        }
        let row_width = self.answer_columns * self.choices;

        let mut groups = Vec::with_capacity(self.question_count());
        for column in 0..self.answer_columns {
            for row in 0..self.questions_per_column {
                let start = row * row_width + column * self.choices;
                groups.push(QuestionGroup {
                    question: (column * self.questions_per_column + row + 1) as QuestionNumber,
                    centers: centers[start..start + self.choices].to_vec(),
                });
            }
        }
        Ok(groups)
    }
}

/// Rows of the name block: accent rows on top, then letter rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NameLayout {
    pub accent_rows: usize,
    pub letter_rows: usize,
}

impl Default for NameLayout {
    fn default() -> Self {
        Self {
            accent_rows: 7,
            letter_rows: 28,
        }
    }
}

impl NameLayout {
    pub fn row_count(&self) -> usize {
        self.accent_rows + self.letter_rows
    }

    pub fn validate(&self, grid: &BubbleGrid) -> Result<(), GridError> {
        if grid.rows.len() != self.row_count() || grid.columns.is_empty() {
            return Err(GridError::ShapeMismatch {
                expected: (grid.columns.len().max(1), self.row_count()),
                found: grid.shape(),
            });
        }
        Ok(())
    }
}
