//! Warps a captured sheet onto the template's pixel frame.
//!
//! Keypoints are FAST corners with an intensity-centroid orientation and a
//! rotated, normalized patch descriptor. Template features are extracted once
//! when the [`Aligner`] is built and shared by every copy.

use image::GrayImage;
use imageproc::{
    corners::corners_fast9,
    filter::gaussian_blur_f32,
    geometric_transformations::{warp_into, Interpolation, Projection},
};
use log::{debug, warn};
use logging_timer::time;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::geometry::PointF;
use crate::homography::{fit_ransac, Homography, HomographyError, RansacConfig};
use crate::image_utils::{size_image_to_width, WHITE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
}

#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Vec<f32>>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }
}

/// Produces keypoints with descriptors comparable by euclidean distance.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, img: &GrayImage) -> Features;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrientedPatchExtractor {
    pub blur_sigma: f32,
    pub fast_threshold: u8,
    pub max_keypoints: usize,
    /// Minimum spacing between kept keypoints, in pixels.
    pub spacing: u32,
    pub patch_radius: f32,
    /// Descriptor samples per side.
    pub samples: usize,
}

impl Default for OrientedPatchExtractor {
    fn default() -> Self {
        Self {
            blur_sigma: 1.0,
            fast_threshold: 20,
            max_keypoints: 2000,
            spacing: 6,
            patch_radius: 12.0,
            samples: 8,
        }
    }
}

impl FeatureExtractor for OrientedPatchExtractor {
    fn extract(&self, img: &GrayImage) -> Features {
        let blurred = gaussian_blur_f32(img, self.blur_sigma);
        let (width, height) = blurred.dimensions();
        let border = (self.patch_radius * std::f32::consts::SQRT_2).ceil() as u32 + 2;
        if width <= 2 * border || height <= 2 * border {
            return Features::default();
        }

        let mut corners = corners_fast9(&blurred, self.fast_threshold)
            .into_iter()
            .filter(|c| {
                c.x >= border && c.y >= border && c.x < width - border && c.y < height - border
            })
            .collect::<Vec<_>>();
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));

        let spacing = self.spacing.max(1);
        let cells_x = (width / spacing + 1) as usize;
        let cells_y = (height / spacing + 1) as usize;
        let mut occupied = vec![false; cells_x * cells_y];
        let mut features = Features::default();

        for corner in corners {
            if features.len() >= self.max_keypoints {
                break;
            }
            let cell = (corner.y / spacing) as usize * cells_x + (corner.x / spacing) as usize;
            if occupied[cell] {
                continue;
            }
            let x = corner.x as f32;
            let y = corner.y as f32;
            let angle = intensity_centroid_angle(&blurred, x, y, self.patch_radius);
            if let Some(descriptor) =
                rotated_patch_descriptor(&blurred, x, y, angle, self.patch_radius, self.samples)
            {
                occupied[cell] = true;
                features.keypoints.push(Keypoint { x, y, angle });
                features.descriptors.push(descriptor);
            }
        }

        features
    }
}

fn intensity_centroid_angle(img: &GrayImage, cx: f32, cy: f32, radius: f32) -> f32 {
    let r = radius as i32;
    let (mut m10, mut m01) = (0.0f32, 0.0f32);
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let value = sample_bilinear(img, cx + dx as f32, cy + dy as f32);
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10)
}

fn rotated_patch_descriptor(
    img: &GrayImage,
    cx: f32,
    cy: f32,
    angle: f32,
    radius: f32,
    samples: usize,
) -> Option<Vec<f32>> {
    let (sin, cos) = angle.sin_cos();
    let step = 2.0 * radius / (samples.max(2) - 1) as f32;
    let mut values = Vec::with_capacity(samples * samples);
    for j in 0..samples {
        for i in 0..samples {
            let u = -radius + i as f32 * step;
            let v = -radius + j as f32 * step;
            let x = cx + u * cos - v * sin;
            let y = cy + u * sin + v * cos;
            values.push(sample_bilinear(img, x, y));
        }
    }

    let mean = values.iter().sum::<f32>() / values.len() as f32;
    values.iter_mut().for_each(|v| *v -= mean);
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < 1e-3 {
        return None;
    }
    values.iter_mut().for_each(|v| *v /= norm);
    Some(values)
}

fn sample_bilinear(img: &GrayImage, x: f32, y: f32) -> f32 {
    let (width, height) = img.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let p = |x, y| img.get_pixel(x, y).0[0] as f32;
    p(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + p(x1, y0) * fx * (1.0 - fy)
        + p(x0, y1) * (1.0 - fx) * fy
        + p(x1, y1) * fx * fy
}

/// A template point and the captured point matched to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub captured: PointF,
    pub template: PointF,
}

/// Finds, for each template descriptor, its two nearest captured descriptors
/// and keeps the pair only when the best is closer than `ratio` times the
/// second best.
#[time]
pub fn match_features(template: &Features, captured: &Features, ratio: f32) -> Vec<Correspondence> {
    if captured.len() < 2 {
        return vec![];
    }
    let ratio_sq = ratio * ratio;

    template
        .descriptors
        .par_iter()
        .zip(template.keypoints.par_iter())
        .filter_map(|(descriptor, template_keypoint)| {
            let mut best = (f32::INFINITY, usize::MAX);
            let mut second = f32::INFINITY;
            for (i, candidate) in captured.descriptors.iter().enumerate() {
                let d = squared_distance(descriptor, candidate);
                if d < best.0 {
                    second = best.0;
                    best = (d, i);
                } else if d < second {
                    second = d;
                }
            }
            if best.1 == usize::MAX || best.0 >= ratio_sq * second {
                return None;
            }
            let captured_keypoint = captured.keypoints[best.1];
            Some(Correspondence {
                captured: [captured_keypoint.x as f64, captured_keypoint.y as f64],
                template: [template_keypoint.x as f64, template_keypoint.y as f64],
            })
        })
        .collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlignConfig {
    /// Lowe ratio for the disambiguation filter.
    pub ratio: f32,
    pub min_matches: usize,
    pub ransac: RansacConfig,
    pub features: OrientedPatchExtractor,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            ratio: 0.7,
            min_matches: 10,
            ransac: RansacConfig::default(),
            features: OrientedPatchExtractor::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlignmentFailure {
    #[error("only {found} good matches, need {needed}")]
    TooFewMatches { found: usize, needed: usize },
    #[error("homography estimation failed: {0}")]
    Homography(#[from] HomographyError),
    #[error("estimated transform is not invertible")]
    SingularTransform,
}

/// Outcome of aligning one copy. On failure `image` is the captured image,
/// untouched.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub image: GrayImage,
    pub homography: Option<Homography>,
    pub failure: Option<AlignmentFailure>,
}

impl Alignment {
    pub fn aligned(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct Aligner {
    extractor: Box<dyn FeatureExtractor>,
    config: AlignConfig,
    template_features: Features,
    template_size: (u32, u32),
}

impl Aligner {
    pub fn new(template: &GrayImage, config: AlignConfig) -> Self {
        let extractor = Box::new(config.features.clone());
        Self::with_extractor(template, config, extractor)
    }

    pub fn with_extractor(
        template: &GrayImage,
        config: AlignConfig,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Self {
        let template_features = extractor.extract(template);
        debug!("template has {} keypoints", template_features.len());
        Self {
            extractor,
            config,
            template_features,
            template_size: template.dimensions(),
        }
    }

    #[time]
    pub fn align(&self, captured: &GrayImage) -> Alignment {
        let (resized, _) = size_image_to_width(captured, self.template_size.0);
        let features = self.extractor.extract(&resized);
        let matches = match_features(&self.template_features, &features, self.config.ratio);
        debug!(
            "{} captured keypoints, {} good matches",
            features.len(),
            matches.len()
        );

        match warp_to_template(&resized, self.template_size, &matches, &self.config) {
            Ok((image, homography)) => Alignment {
                image,
                homography: Some(homography),
                failure: None,
            },
            Err(failure) => {
                warn!("alignment failed, keeping the captured image: {}", failure);
                Alignment {
                    image: captured.clone(),
                    homography: None,
                    failure: Some(failure),
                }
            }
        }
    }
}

/// Estimates the captured→template transform from `matches` and warps `image`
/// to exactly `template_size`.
pub fn warp_to_template(
    image: &GrayImage,
    template_size: (u32, u32),
    matches: &[Correspondence],
    config: &AlignConfig,
) -> Result<(GrayImage, Homography), AlignmentFailure> {
    if matches.len() < config.min_matches {
        return Err(AlignmentFailure::TooFewMatches {
            found: matches.len(),
            needed: config.min_matches,
        });
    }

    let src = matches.iter().map(|m| m.captured).collect::<Vec<_>>();
    let dst = matches.iter().map(|m| m.template).collect::<Vec<_>>();
    let fit = fit_ransac(&src, &dst, &config.ransac)?;
    debug!("{} of {} matches are inliers", fit.inlier_count(), matches.len());

    let projection = Projection::from_matrix(fit.homography.to_row_major_f32())
        .ok_or(AlignmentFailure::SingularTransform)?;
    let mut out = GrayImage::from_pixel(template_size.0, template_size.1, WHITE);
    warp_into(image, &projection, Interpolation::Bilinear, WHITE, &mut out);
    Ok((out, fit.homography))
}
