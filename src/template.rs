use std::fmt::Display;
use std::path::{Path, PathBuf};

use image::GrayImage;
use imageproc::rect::Rect;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::image_utils::crop_clipped;
use crate::types::Size;

/// A rectangle in the template frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BlockRect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn to_rect(&self) -> Option<Rect> {
        (self.width > 0 && self.height > 0)
            .then(|| Rect::at(self.x, self.y).of_size(self.width, self.height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Block {
    Name,
    Questions,
}

impl Block {
    pub fn label(&self) -> &'static str {
        match self {
            Block::Name => "name",
            Block::Questions => "questions",
        }
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Where the blocks sit on the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateGeometry {
    pub name_block: BlockRect,
    pub questions_block: BlockRect,
}

impl Default for TemplateGeometry {
    fn default() -> Self {
        Self {
            name_block: BlockRect::new(240, 140, 1310, 1217),
            questions_block: BlockRect::new(190, 1357, 1400, 923),
        }
    }
}

impl TemplateGeometry {
    pub fn block(&self, block: Block) -> BlockRect {
        match block {
            Block::Name => self.name_block,
            Block::Questions => self.questions_block,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("cannot open template {0}: {1}")]
    ImageOpen(PathBuf, image::ImageError),
    #[error("template {path} is {found:?}, too small for the {block} block")]
    TooSmall {
        path: PathBuf,
        block: Block,
        found: (u32, u32),
    },
}

/// The blank reference sheet every copy is aligned to.
#[derive(Debug, Clone)]
pub struct Template {
    pub image: GrayImage,
    pub geometry: TemplateGeometry,
}

impl Template {
    pub fn load(path: &Path, geometry: TemplateGeometry) -> Result<Self, TemplateError> {
        let image = image::open(path)
            .map_err(|e| TemplateError::ImageOpen(path.to_path_buf(), e))?
            .into_luma8();
        let template = Self { image, geometry };
        for block in [Block::Name, Block::Questions] {
            if template.contains(block) {
                continue;
            }
            return Err(TemplateError::TooSmall {
                path: path.to_path_buf(),
                block,
                found: template.image.dimensions(),
            });
        }
        Ok(template)
    }

    pub fn size(&self) -> Size<u32> {
        Size {
            width: self.image.width(),
            height: self.image.height(),
        }
    }

    fn contains(&self, block: Block) -> bool {
        let rect = self.geometry.block(block);
        rect.x >= 0
            && rect.y >= 0
            && rect.width > 0
            && rect.height > 0
            && rect.x as u32 + rect.width <= self.image.width()
            && rect.y as u32 + rect.height <= self.image.height()
    }
}

/// Crops a block out of a sheet in the template frame. A rect that spills
/// over the sheet (an unaligned fallback can be smaller than the template) is
/// clipped; `None` when nothing of it is left.
pub fn extract_block(sheet: &GrayImage, geometry: &TemplateGeometry, block: Block) -> Option<GrayImage> {
    let rect = geometry.block(block).to_rect()?;
    let cropped = crop_clipped(sheet, &rect)?;
    if cropped.dimensions() != (rect.width(), rect.height()) {
        warn!(
            "{} block clipped from {}x{} to {}x{}",
            block,
            rect.width(),
            rect.height(),
            cropped.width(),
            cropped.height()
        );
    }
    Some(cropped)
}
