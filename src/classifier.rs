//! Fill probability for a bubble, from a patch centered on it.
//!
//! The model is a capability handed to the pipeline; nothing here holds a
//! process-wide instance.

use std::path::{Path, PathBuf};

use image::GrayImage;
use logging_timer::time;
use serde::{Deserialize, Serialize};

use crate::image_utils::{crop_patch, dark_ratio_in_disk};
use crate::types::Center;

pub const DEFAULT_PATCH_SIZE: u32 = 30;

pub trait FillClassifier: Send + Sync {
    /// Side of the square patch the classifier was built for.
    fn patch_size(&self) -> u32 {
        DEFAULT_PATCH_SIZE
    }

    /// Probability in `[0, 1]` that the bubble in `patch` is filled. Callers
    /// only pass patches of exactly `patch_size()` pixels square.
    fn predict_fill(&self, patch: &GrayImage) -> f32;
}

/// Ratio of dark pixels inside the bubble's inner disk, which excludes the
/// printed outline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DarknessClassifier {
    pub patch_size: u32,
    /// Pixels strictly below this gray level count as ink.
    pub dark_level: u8,
    /// Inner disk radius as a fraction of the patch side.
    pub inner_radius: f32,
}

impl Default for DarknessClassifier {
    fn default() -> Self {
        Self {
            patch_size: DEFAULT_PATCH_SIZE,
            dark_level: 210,
            inner_radius: 0.3,
        }
    }
}

impl FillClassifier for DarknessClassifier {
    fn patch_size(&self) -> u32 {
        self.patch_size
    }

    fn predict_fill(&self, patch: &GrayImage) -> f32 {
        dark_ratio_in_disk(patch, self.dark_level, patch.width() as f32 * self.inner_radius)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("cannot read classifier {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("cannot parse classifier {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("classifier expects {expected} weights for a {patch_size}px patch, found {found}")]
    WeightCount {
        patch_size: u32,
        expected: usize,
        found: usize,
    },
}

/// Logistic regression over row-major patch pixels, exported as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogisticClassifier {
    pub patch_size: u32,
    pub weights: Vec<f32>,
    pub bias: f32,
    /// Applied to each raw pixel value before the dot product.
    #[serde(default = "default_pixel_scale")]
    pub pixel_scale: f32,
}

fn default_pixel_scale() -> f32 {
    1.0 / 255.0
}

impl LogisticClassifier {
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let json =
            std::fs::read_to_string(path).map_err(|e| ClassifierError::Io(path.to_path_buf(), e))?;
        let classifier: LogisticClassifier =
            serde_json::from_str(&json).map_err(|e| ClassifierError::Parse(path.to_path_buf(), e))?;
        classifier.validate()?;
        Ok(classifier)
    }

    pub fn validate(&self) -> Result<(), ClassifierError> {
        let expected = (self.patch_size * self.patch_size) as usize;
        if self.weights.len() != expected {
            return Err(ClassifierError::WeightCount {
                patch_size: self.patch_size,
                expected,
                found: self.weights.len(),
            });
        }
        Ok(())
    }
}

impl FillClassifier for LogisticClassifier {
    fn patch_size(&self) -> u32 {
        self.patch_size
    }

    fn predict_fill(&self, patch: &GrayImage) -> f32 {
        let z = patch
            .pixels()
            .zip(&self.weights)
            .map(|(p, w)| p.0[0] as f32 * self.pixel_scale * w)
            .sum::<f32>()
            + self.bias;
        1.0 / (1.0 + (-z).exp())
    }
}

/// Fill probability of one center; a patch that does not fit in the image
/// carries no information and scores 0.
pub fn fill_probability(img: &GrayImage, center: &Center, classifier: &dyn FillClassifier) -> f32 {
    let side = classifier.patch_size();
    match crop_patch(img, center, side) {
        Some(patch) if patch.dimensions() == (side, side) => {
            let p = classifier.predict_fill(&patch);
            if p.is_nan() {
                0.0
            } else {
                p.clamp(0.0, 1.0)
            }
        }
        _ => 0.0,
    }
}

#[time]
pub fn fill_probabilities(
    img: &GrayImage,
    centers: &[Center],
    classifier: &dyn FillClassifier,
) -> Vec<f32> {
    centers
        .iter()
        .map(|center| fill_probability(img, center, classifier))
        .collect()
}

/// Independent filled/empty decisions, used where no choice group applies.
pub fn fill_decisions(
    img: &GrayImage,
    centers: &[Center],
    classifier: &dyn FillClassifier,
    threshold: f32,
) -> Vec<bool> {
    fill_probabilities(img, centers, classifier)
        .into_iter()
        .map(|p| p > threshold)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::image_utils::{BLACK, WHITE};
    use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};
    use std::io::Write;

    /// Answers the same probability for every patch.
    pub(crate) struct StubClassifier(pub f32);

    impl FillClassifier for StubClassifier {
        fn predict_fill(&self, _patch: &GrayImage) -> f32 {
            self.0
        }
    }

    fn sheet_with_bubbles() -> GrayImage {
        let mut img = GrayImage::from_pixel(120, 60, WHITE);
        draw_hollow_circle_mut(&mut img, (30, 30), 13, BLACK);
        draw_filled_circle_mut(&mut img, (80, 30), 13, BLACK);
        img
    }

    #[test]
    fn darkness_separates_filled_from_empty() {
        let img = sheet_with_bubbles();
        let classifier = DarknessClassifier::default();
        let probabilities = fill_probabilities(
            &img,
            &[Center::new(30, 30), Center::new(80, 30)],
            &classifier,
        );
        assert!(probabilities[0] < 0.05, "{:?}", probabilities);
        assert!(probabilities[1] > 0.95, "{:?}", probabilities);
        assert_eq!(
            fill_decisions(&img, &[Center::new(30, 30), Center::new(80, 30)], &classifier, 0.5),
            vec![false, true]
        );
    }

    #[test]
    fn out_of_bounds_patch_is_never_filled() {
        let img = sheet_with_bubbles();
        let classifier = StubClassifier(0.99);
        assert_eq!(fill_probability(&img, &Center::new(5, 30), &classifier), 0.0);
        assert_eq!(fill_probability(&img, &Center::new(110, 30), &classifier), 0.0);
        assert_eq!(fill_probability(&img, &Center::new(60, 30), &classifier), 0.99);
    }

    #[test]
    fn classifier_output_is_clamped() {
        let img = sheet_with_bubbles();
        assert_eq!(fill_probability(&img, &Center::new(60, 30), &StubClassifier(1.7)), 1.0);
        assert_eq!(fill_probability(&img, &Center::new(60, 30), &StubClassifier(f32::NAN)), 0.0);
    }

    #[test]
    fn logistic_classifier_loads_and_scores_dark_patches_higher() {
        let patch_size = 4u32;
        let model = LogisticClassifier {
            patch_size,
            weights: vec![-1.0; 16],
            bias: 8.0,
            pixel_scale: 1.0 / 255.0,
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&model).unwrap()).unwrap();

        let loaded = LogisticClassifier::load(file.path()).unwrap();
        let dark = GrayImage::from_pixel(4, 4, BLACK);
        let light = GrayImage::from_pixel(4, 4, WHITE);
        assert!(loaded.predict_fill(&dark) > 0.99);
        assert!(loaded.predict_fill(&light) < 0.01);
    }

    #[test]
    fn logistic_classifier_rejects_wrong_weight_count() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"patchSize": 30, "weights": [0.5, 0.5], "bias": 0.0}}"#).unwrap();
        assert!(matches!(
            LogisticClassifier::load(file.path()),
            Err(ClassifierError::WeightCount {
                expected: 900,
                found: 2,
                ..
            })
        ));
    }
}
