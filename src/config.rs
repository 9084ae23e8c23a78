use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::align::AlignConfig;
use crate::classifier::DarknessClassifier;
use crate::grid::{GridParams, NameLayout, QuestionLayout};
use crate::name::NameDecoderConfig;
use crate::resolve::ResolverConfig;
use crate::template::TemplateGeometry;

/// Everything tunable about reading a sheet. Every field has a default, so an
/// empty JSON object is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OmrConfig {
    pub template: TemplateGeometry,
    pub align: AlignConfig,
    pub name_grid: GridParams,
    pub questions_grid: GridParams,
    pub name_layout: NameLayout,
    pub question_layout: QuestionLayout,
    pub name_decoder: NameDecoderConfig,
    pub resolver: ResolverConfig,
    /// Used when no trained classifier is given.
    pub darkness: DarknessClassifier,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("cannot parse configuration {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl OmrConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: OmrConfig =
            serde_json::from_str(&json).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.resolver.margin) {
            return Err(ConfigError::Invalid(format!(
                "resolver margin {} is outside [0, 1)",
                self.resolver.margin
            )));
        }
        if !(0.0..=1.0).contains(&self.resolver.fill_threshold) {
            return Err(ConfigError::Invalid(format!(
                "fill threshold {} is outside [0, 1]",
                self.resolver.fill_threshold
            )));
        }
        if self.question_layout.choices == 0 || self.question_layout.choices > 26 {
            return Err(ConfigError::Invalid(format!(
                "{} choices per question",
                self.question_layout.choices
            )));
        }
        for (label, grid) in [("name", &self.name_grid), ("questions", &self.questions_grid)] {
            if grid.hough.min_radius > grid.hough.max_radius {
                return Err(ConfigError::Invalid(format!(
                    "{} grid radius range {}..{} is empty",
                    label, grid.hough.min_radius, grid.hough.max_radius
                )));
            }
        }
        Ok(())
    }
}
