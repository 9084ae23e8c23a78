use imageproc::rect::Rect;

use crate::types::Center;

/// A 2D point in floating point pixel coordinates.
pub type PointF = [f64; 2];

pub fn distance(p1: &PointF, p2: &PointF) -> f64 {
    ((p1[0] - p2[0]).powi(2) + (p1[1] - p2[1]).powi(2)).sqrt()
}

/// Clips a rect to an image of the given dimensions, returning `None` when
/// nothing of the rect lies inside the image.
pub fn clip_rect(rect: &Rect, (width, height): (u32, u32)) -> Option<Rect> {
    if width == 0 || height == 0 {
        return None;
    }
    rect.intersect(Rect::at(0, 0).of_size(width, height))
}

/// The square of side `side` centered on `center`, if it fits entirely in an
/// image of the given dimensions.
pub fn centered_square(center: &Center, side: u32, (width, height): (u32, u32)) -> Option<Rect> {
    let half = (side / 2) as i32;
    let left = center.x - half;
    let top = center.y - half;
    if left < 0
        || top < 0
        || left + side as i32 > width as i32
        || top + side as i32 > height as i32
        || side == 0
    {
        return None;
    }
    Some(Rect::at(left, top).of_size(side, side))
}
