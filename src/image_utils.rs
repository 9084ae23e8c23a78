use image::{
    imageops::{self, FilterType},
    DynamicImage, GrayImage, Luma, Rgb, RgbImage,
};
use imageproc::rect::Rect;

use crate::geometry::{centered_square, clip_rect};
use crate::types::Center;

pub const WHITE: Luma<u8> = Luma([u8::MAX]);
#[cfg(test)]
pub const BLACK: Luma<u8> = Luma([u8::MIN]);

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
pub const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
pub const PINK: Rgb<u8> = Rgb([255, 0, 255]);
pub const CYAN: Rgb<u8> = Rgb([0, 255, 255]);

/// Resizes an image so that its width matches `width`, keeping the aspect
/// ratio. Returns the resized image and the scale factor applied.
pub fn size_image_to_width(img: &GrayImage, width: u32) -> (GrayImage, f32) {
    if img.width() == width || img.width() == 0 {
        return (img.clone(), 1.0);
    }
    let scale = width as f32 / img.width() as f32;
    let height = ((img.height() as f32) * scale).round().max(1.0) as u32;
    (
        imageops::resize(img, width, height, FilterType::Triangle),
        scale,
    )
}

/// Crops `rect` out of `img`, clipped to the image bounds.
pub fn crop_clipped(img: &GrayImage, rect: &Rect) -> Option<GrayImage> {
    let clipped = clip_rect(rect, img.dimensions())?;
    Some(
        imageops::crop_imm(
            img,
            clipped.left() as u32,
            clipped.top() as u32,
            clipped.width(),
            clipped.height(),
        )
        .to_image(),
    )
}

/// Extracts the `side`×`side` patch centered on `center`, or `None` when the
/// patch would leave the image.
pub fn crop_patch(img: &GrayImage, center: &Center, side: u32) -> Option<GrayImage> {
    let rect = centered_square(center, side, img.dimensions())?;
    Some(
        imageops::crop_imm(
            img,
            rect.left() as u32,
            rect.top() as u32,
            rect.width(),
            rect.height(),
        )
        .to_image(),
    )
}

/// Determines the ratio of pixels strictly darker than `level` among those
/// within `radius` of the image center.
pub fn dark_ratio_in_disk(img: &GrayImage, level: u8, radius: f32) -> f32 {
    let cx = (img.width() as f32 - 1.0) / 2.0;
    let cy = (img.height() as f32 - 1.0) / 2.0;
    let radius_sq = radius * radius;
    let mut total = 0u32;
    let mut dark = 0u32;
    for (x, y, pixel) in img.enumerate_pixels() {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        if dx * dx + dy * dy > radius_sq {
            continue;
        }
        total += 1;
        if pixel.0[0] < level {
            dark += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    dark as f32 / total as f32
}

pub fn to_rgb(img: &GrayImage) -> RgbImage {
    DynamicImage::ImageLuma8(img.clone()).into_rgb8()
}
