use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_hollow_circle_mut};
use log::{debug, warn};

use crate::{
    grid::BubbleGrid,
    hough::Circle,
    image_utils::{to_rgb, BLUE, CYAN, GREEN, PINK, YELLOW},
    resolve::AmbiguityMap,
    types::{Center, QuestionNumber},
};

/// Radius of the rings drawn around traced bubbles.
const TRACE_RADIUS: i32 = 12;

/// Creates a path for a debug image.
pub fn debug_image_path(base: &Path, label: &str) -> PathBuf {
    let mut result = PathBuf::from(base);
    result.set_file_name(format!(
        "{}_debug_{}.png",
        base.file_stem().unwrap_or_default().to_string_lossy(),
        label
    ));
    result
}

/// Writes labelled debug images next to `base`, or nothing when disabled.
pub struct ImageDebugWriter {
    base: PathBuf,
    input_image: Option<GrayImage>,
}

impl ImageDebugWriter {
    pub fn new(base: PathBuf, input_image: GrayImage) -> Self {
        Self {
            base,
            input_image: Some(input_image),
        }
    }

    pub fn disabled() -> Self {
        Self {
            base: PathBuf::new(),
            input_image: None,
        }
    }

    /// Draws on a color copy of the input image and saves it. Returns the
    /// written path.
    pub fn write(&self, label: &str, draw: impl FnOnce(&mut RgbImage)) -> Option<PathBuf> {
        let input_image = self.input_image.as_ref()?;
        let mut canvas = to_rgb(input_image);
        draw(&mut canvas);
        let path = debug_image_path(&self.base, label);
        match canvas.save(&path) {
            Ok(()) => {
                debug!("wrote debug image {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("cannot write debug image {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn draw_ring_mut(canvas: &mut RgbImage, center: &Center, color: Rgb<u8>) {
    // two pixels thick
    for radius in [TRACE_RADIUS, TRACE_RADIUS + 1] {
        draw_hollow_circle_mut(canvas, (center.x, center.y), radius, color);
    }
}

/// Draws every raw Hough detection with its estimated radius.
pub fn draw_circles_debug_image_mut(canvas: &mut RgbImage, circles: &[Circle]) {
    for circle in circles {
        draw_hollow_circle_mut(
            canvas,
            (circle.center.x, circle.center.y),
            circle.radius as i32,
            PINK,
        );
        draw_cross_mut(canvas, PINK, circle.center.x, circle.center.y);
    }
}

/// Draws a cross at every canonical grid position.
pub fn draw_grid_debug_image_mut(canvas: &mut RgbImage, grid: &BubbleGrid) {
    for center in grid.centers_row_major() {
        draw_cross_mut(canvas, CYAN, center.x, center.y);
    }
}

/// Draws the reviewer's view of a block: every bubble of an ambiguous
/// question in yellow, filled bubbles in green, or blue when a reviewer
/// changed that question. `centers` come in question order, `choices` per
/// question.
pub fn draw_bubble_trace_mut(
    canvas: &mut RgbImage,
    centers: &[Center],
    filled: &[bool],
    choices: usize,
    ambiguous: &AmbiguityMap,
    modified: &BTreeSet<QuestionNumber>,
) {
    for (i, (center, &is_filled)) in centers.iter().zip(filled).enumerate() {
        let question = (i / choices.max(1) + 1) as QuestionNumber;
        if ambiguous.contains_key(&question) {
            draw_ring_mut(canvas, center, YELLOW);
        }
        if is_filled {
            let color = if modified.contains(&question) {
                BLUE
            } else {
                GREEN
            };
            draw_ring_mut(canvas, center, color);
        }
    }
}

/// Color copy of `block` with the bubble trace drawn on it.
pub fn trace_block(
    block: &GrayImage,
    centers: &[Center],
    filled: &[bool],
    choices: usize,
    ambiguous: &AmbiguityMap,
    modified: &BTreeSet<QuestionNumber>,
) -> RgbImage {
    let mut canvas = to_rgb(block);
    draw_bubble_trace_mut(&mut canvas, centers, filled, choices, ambiguous, modified);
    canvas
}
