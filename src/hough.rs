//! Gradient Hough transform for circles.
//!
//! Each Canny edge pixel votes along its gradient direction, in both senses,
//! at every radius in `[min_radius, max_radius]`. Bubble centers show up as
//! accumulator peaks; peaks closer than `min_dist` to a stronger one are
//! dropped.

use image::GrayImage;
use imageproc::{
    edges::canny,
    filter::gaussian_blur_f32,
    gradients::{horizontal_sobel, vertical_sobel},
};
use logging_timer::time;
use serde::{Deserialize, Serialize};

use crate::types::Center;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HoughCircleParams {
    /// Gaussian pre-blur; 1.1 matches a 5×5 kernel.
    pub blur_sigma: f32,
    /// Minimum distance between two detected centers.
    pub min_dist: f32,
    /// Upper Canny threshold; the lower one is half of it.
    pub canny_high: f32,
    /// Minimum accumulator votes for a center.
    pub accumulator_threshold: u32,
    pub min_radius: u32,
    pub max_radius: u32,
}

impl Default for HoughCircleParams {
    fn default() -> Self {
        Self {
            blur_sigma: 1.1,
            min_dist: 20.0,
            canny_high: 100.0,
            accumulator_threshold: 15,
            min_radius: 12,
            max_radius: 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Circle {
    pub center: Center,
    pub radius: u32,
    pub votes: u32,
}

#[time]
pub fn detect_circles(img: &GrayImage, params: &HoughCircleParams) -> Vec<Circle> {
    let (width, height) = img.dimensions();
    if width < 3 || height < 3 || params.max_radius < params.min_radius {
        return vec![];
    }

    let blurred = gaussian_blur_f32(img, params.blur_sigma);
    let edges = canny(&blurred, params.canny_high / 2.0, params.canny_high);
    let gx = horizontal_sobel(&blurred);
    let gy = vertical_sobel(&blurred);

    let w = width as usize;
    let mut accumulator = vec![0u32; w * height as usize];
    let mut edge_points = vec![];

    for (x, y, pixel) in edges.enumerate_pixels() {
        if pixel.0[0] == 0 {
            continue;
        }
        edge_points.push((x as i32, y as i32));
        let dx = gx.get_pixel(x, y).0[0] as f32;
        let dy = gy.get_pixel(x, y).0[0] as f32;
        let magnitude = (dx * dx + dy * dy).sqrt();
        if magnitude < 1.0 {
            continue;
        }
        let (ux, uy) = (dx / magnitude, dy / magnitude);
        for sign in [-1.0f32, 1.0] {
            for r in params.min_radius..=params.max_radius {
                let vx = (x as f32 + sign * ux * r as f32).round() as i32;
                let vy = (y as f32 + sign * uy * r as f32).round() as i32;
                if vx >= 0 && vy >= 0 && (vx as u32) < width && (vy as u32) < height {
                    accumulator[vy as usize * w + vx as usize] += 1;
                }
            }
        }
    }

    let mut peaks = local_maxima(&accumulator, width, height, params.accumulator_threshold);
    peaks.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let min_dist_sq = params.min_dist * params.min_dist;
    let mut circles: Vec<Circle> = vec![];
    for ((y, x), votes) in peaks {
        let too_close = circles.iter().any(|c| {
            let dx = (c.center.x - x) as f32;
            let dy = (c.center.y - y) as f32;
            dx * dx + dy * dy < min_dist_sq
        });
        if too_close {
            continue;
        }
        let center = Center::new(x, y);
        circles.push(Circle {
            center,
            radius: estimate_radius(&center, &edge_points, params),
            votes,
        });
    }

    circles
}

/// Accumulator cells at or above `threshold` that are maximal in their 3×3
/// neighbourhood, as `((y, x), votes)`. Plateaus keep their first cell in scan
/// order.
fn local_maxima(
    accumulator: &[u32],
    width: u32,
    height: u32,
    threshold: u32,
) -> Vec<((i32, i32), u32)> {
    let (w, h) = (width as i32, height as i32);
    let at = |x: i32, y: i32| accumulator[(y * w + x) as usize];
    let mut peaks = vec![];
    for y in 0..h {
        for x in 0..w {
            let votes = at(x, y);
            if votes < threshold.max(1) {
                continue;
            }
            let mut is_max = true;
            'neighbours: for ny in (y - 1).max(0)..=(y + 1).min(h - 1) {
                for nx in (x - 1).max(0)..=(x + 1).min(w - 1) {
                    if (nx, ny) == (x, y) {
                        continue;
                    }
                    let other = at(nx, ny);
                    let earlier = (ny, nx) < (y, x);
                    if other > votes || (other == votes && earlier) {
                        is_max = false;
                        break 'neighbours;
                    }
                }
            }
            if is_max {
                peaks.push(((y, x), votes));
            }
        }
    }
    peaks
}

/// Picks the radius with the most edge support around `center`.
fn estimate_radius(center: &Center, edge_points: &[(i32, i32)], params: &HoughCircleParams) -> u32 {
    let reach = params.max_radius as i32 + 1;
    let mut support = vec![0u32; (params.max_radius - params.min_radius + 1) as usize];
    for (x, y) in edge_points {
        let (dx, dy) = (x - center.x, y - center.y);
        if dx.abs() > reach || dy.abs() > reach {
            continue;
        }
        let r = ((dx * dx + dy * dy) as f32).sqrt().round() as u32;
        if r >= params.min_radius && r <= params.max_radius {
            support[(r - params.min_radius) as usize] += 1;
        }
    }
    support
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        .map_or(params.min_radius, |(i, _)| params.min_radius + i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_utils::{BLACK, WHITE};
    use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};

    #[test]
    fn blank_image_has_no_circles() {
        let img = GrayImage::from_pixel(120, 80, WHITE);
        assert!(detect_circles(&img, &HoughCircleParams::default()).is_empty());
    }

    #[test]
    fn finds_filled_and_outlined_bubbles() {
        let mut img = GrayImage::from_pixel(260, 120, WHITE);
        let expected = [(40, 40), (90, 40), (140, 40), (190, 80)];
        draw_filled_circle_mut(&mut img, expected[0], 13, BLACK);
        draw_filled_circle_mut(&mut img, expected[1], 13, BLACK);
        for r in 12..=14 {
            draw_hollow_circle_mut(&mut img, expected[2], r, BLACK);
            draw_hollow_circle_mut(&mut img, expected[3], r, BLACK);
        }

        let circles = detect_circles(&img, &HoughCircleParams::default());
        assert_eq!(circles.len(), expected.len(), "{:?}", circles);
        for (ex, ey) in expected {
            assert!(
                circles
                    .iter()
                    .any(|c| (c.center.x - ex).abs() <= 2 && (c.center.y - ey).abs() <= 2),
                "no circle near ({}, {}) in {:?}",
                ex,
                ey,
                circles
            );
        }
    }

    #[test]
    fn centers_respect_min_dist() {
        let mut img = GrayImage::from_pixel(200, 100, WHITE);
        for i in 0..5 {
            draw_filled_circle_mut(&mut img, (30 + i * 34, 50), 13, BLACK);
        }
        let params = HoughCircleParams::default();
        let circles = detect_circles(&img, &params);
        for (i, a) in circles.iter().enumerate() {
            for b in &circles[i + 1..] {
                let dx = (a.center.x - b.center.x) as f32;
                let dy = (a.center.y - b.center.y) as f32;
                assert!((dx * dx + dy * dy).sqrt() >= params.min_dist);
            }
        }
    }
}
