//! Projective transform estimation from point correspondences.
//!
//! The normalized DLT solves for the null vector of `AᵀA` rather than taking a
//! thin SVD of `A`, which would drop it for the minimal 4-point case.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::geometry::{distance, PointF};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HomographyError {
    #[error("need at least {needed} correspondences, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("source and destination point counts differ ({0} vs {1})")]
    MismatchedPoints(usize, usize),
    #[error("degenerate point configuration")]
    Degenerate,
    #[error("only {found} inliers, need {needed}")]
    InsufficientInliers { needed: usize, found: usize },
}

/// A 3×3 projective transform mapping source points to destination points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(pub Matrix3<f64>);

impl Homography {
    /// Maps a point through the transform, or `None` if it lands at infinity.
    pub fn project(&self, p: &PointF) -> Option<PointF> {
        let q = self.0 * Vector3::new(p[0], p[1], 1.0);
        if q[2].abs() < 1e-12 {
            return None;
        }
        Some([q[0] / q[2], q[1] / q[2]])
    }

    pub fn reprojection_error(&self, src: &PointF, dst: &PointF) -> f64 {
        self.project(src)
            .map_or(f64::INFINITY, |projected| distance(&projected, dst))
    }

    /// Row-major matrix in the layout `imageproc`'s `Projection` expects.
    pub fn to_row_major_f32(&self) -> [f32; 9] {
        let m = &self.0;
        [
            m[(0, 0)] as f32,
            m[(0, 1)] as f32,
            m[(0, 2)] as f32,
            m[(1, 0)] as f32,
            m[(1, 1)] as f32,
            m[(1, 2)] as f32,
            m[(2, 0)] as f32,
            m[(2, 1)] as f32,
            m[(2, 2)] as f32,
        ]
    }

    /// Direct linear transform over every correspondence.
    pub fn estimate(src: &[PointF], dst: &[PointF]) -> Result<Homography, HomographyError> {
        if src.len() != dst.len() {
            return Err(HomographyError::MismatchedPoints(src.len(), dst.len()));
        }
        if src.len() < 4 {
            return Err(HomographyError::TooFewPoints {
                needed: 4,
                got: src.len(),
            });
        }

        let (t_src, src_n) = normalize(src).ok_or(HomographyError::Degenerate)?;
        let (t_dst, dst_n) = normalize(dst).ok_or(HomographyError::Degenerate)?;

        let n = src.len();
        let mut a = DMatrix::<f64>::zeros(2 * n, 9);
        for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
            let (x, y) = (s[0], s[1]);
            let (u, v) = (d[0], d[1]);
            let r = 2 * i;
            a[(r, 0)] = x;
            a[(r, 1)] = y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -u * x;
            a[(r, 7)] = -u * y;
            a[(r, 8)] = -u;
            a[(r + 1, 3)] = x;
            a[(r + 1, 4)] = y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -v * x;
            a[(r + 1, 7)] = -v * y;
            a[(r + 1, 8)] = -v;
        }

        let eigen = SymmetricEigen::new(a.transpose() * &a);
        let smallest = eigen
            .eigenvalues
            .iter()
            .enumerate()
            .min_by(|(_, l), (_, r)| l.abs().total_cmp(&r.abs()))
            .map(|(i, _)| i)
            .ok_or(HomographyError::Degenerate)?;
        let h = eigen.eigenvectors.column(smallest);
        let h_n = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

        let t_dst_inv = t_dst.try_inverse().ok_or(HomographyError::Degenerate)?;
        let m = t_dst_inv * h_n * t_src;
        if m[(2, 2)].abs() < 1e-12 || m.determinant().abs() < 1e-12 {
            return Err(HomographyError::Degenerate);
        }
        Ok(Homography(m / m[(2, 2)]))
    }
}

/// Translates the centroid to the origin and scales the mean distance to √2.
fn normalize(points: &[PointF]) -> Option<(Matrix3<f64>, Vec<PointF>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = points.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_distance = points
        .iter()
        .map(|p| distance(p, &[cx, cy]))
        .sum::<f64>()
        / n;
    if mean_distance < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_distance;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();
    Some((t, normalized))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RansacConfig {
    pub max_iterations: usize,
    /// Reprojection error in pixels under which a correspondence is an inlier.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            inlier_threshold: 5.0,
            min_inliers: 6,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacFit {
    pub homography: Homography,
    pub inliers: Vec<bool>,
}

impl RansacFit {
    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|inlier| **inlier).count()
    }
}

/// Consensus-sampling fit: repeatedly estimates from 4 random
/// correspondences, keeps the model with the most inliers, then refits on
/// those inliers.
pub fn fit_ransac(
    src: &[PointF],
    dst: &[PointF],
    config: &RansacConfig,
) -> Result<RansacFit, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::MismatchedPoints(src.len(), dst.len()));
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Homography, Vec<bool>, usize)> = None;

    for _ in 0..config.max_iterations {
        let sample = rand::seq::index::sample(&mut rng, n, 4);
        let s4: Vec<PointF> = sample.iter().map(|i| src[i]).collect();
        let d4: Vec<PointF> = sample.iter().map(|i| dst[i]).collect();
        let candidate = match Homography::estimate(&s4, &d4) {
            Ok(h) => h,
            Err(_) => continue,
        };

        let inliers: Vec<bool> = src
            .iter()
            .zip(dst)
            .map(|(s, d)| candidate.reprojection_error(s, d) < config.inlier_threshold)
            .collect();
        let count = inliers.iter().filter(|inlier| **inlier).count();

        if best.as_ref().map_or(true, |(_, _, best_count)| count > *best_count) {
            best = Some((candidate, inliers, count));
            if count == n {
                break;
            }
        }
    }

    let (candidate, inliers, count) = best.ok_or(HomographyError::Degenerate)?;
    if count < config.min_inliers.max(4) {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers.max(4),
            found: count,
        });
    }

    let inlier_src: Vec<PointF> = src
        .iter()
        .zip(&inliers)
        .filter_map(|(p, inlier)| inlier.then_some(*p))
        .collect();
    let inlier_dst: Vec<PointF> = dst
        .iter()
        .zip(&inliers)
        .filter_map(|(p, inlier)| inlier.then_some(*p))
        .collect();
    let homography = Homography::estimate(&inlier_src, &inlier_dst).unwrap_or(candidate);

    Ok(RansacFit {
        homography,
        inliers,
    })
}
