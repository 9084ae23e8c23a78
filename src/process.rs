use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use image::GrayImage;
use log::{debug, info, warn};
use logging_timer::time;
use rayon::prelude::*;

use crate::align::Aligner;
use crate::classifier::{fill_decisions, FillClassifier};
use crate::config::OmrConfig;
use crate::copy::{block_file_name, traced_file_name, CopyError, StudentCopy};
use crate::debug::{
    draw_circles_debug_image_mut, draw_grid_debug_image_mut, trace_block, ImageDebugWriter,
};
use crate::grid::{infer_grid, GridError};
use crate::metadata::CopyRecord;
use crate::name::{decode_name, DecodedName, NameError};
use crate::resolve::{resolve_questions, AmbiguityMap, ResolveError, ResolvedAnswers};
use crate::score::Scorer;
use crate::template::{extract_block, Block, Template};
use crate::types::Center;

#[derive(Debug, thiserror::Error)]
pub enum ProcessCopyError {
    #[error("cannot open {0}: {1}")]
    ImageOpen(PathBuf, image::ImageError),
    #[error("cannot create {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("cannot write {0}: {1}")]
    WriteImage(PathBuf, image::ImageError),
    #[error("{0}: {1}")]
    Name(PathBuf, NameError),
    #[error("{0}: {1}")]
    Resolve(PathBuf, ResolveError),
    #[error("{0}: {1}")]
    Copy(PathBuf, CopyError),
    #[error("{0}: cancelled before processing started")]
    Cancelled(PathBuf),
}

#[derive(Debug, thiserror::Error)]
enum QuestionsError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Name block reading: every bubble of the grid with its fill decision.
struct NameReading {
    centers: Vec<Center>,
    filled: Vec<bool>,
    name: DecodedName,
}

pub struct Pipeline {
    config: OmrConfig,
    template: Template,
    aligner: Aligner,
    classifier: Box<dyn FillClassifier>,
    scorer: Scorer,
    output_dir: PathBuf,
    debug: bool,
}

impl Pipeline {
    pub fn new(
        config: OmrConfig,
        template: Template,
        classifier: Box<dyn FillClassifier>,
        scorer: Scorer,
        output_dir: PathBuf,
        debug: bool,
    ) -> Self {
        let aligner = Aligner::new(&template.image, config.align.clone());
        Self {
            config,
            template,
            aligner,
            classifier,
            scorer,
            output_dir,
            debug,
        }
    }

    /// Processes every image on the rayon pool. Each copy succeeds or fails
    /// on its own; once `cancel` is set, copies not yet started report
    /// [`ProcessCopyError::Cancelled`]. Results keep the input order.
    #[time]
    pub fn process_batch(
        &self,
        images: &[PathBuf],
        cancel: &AtomicBool,
    ) -> Vec<Result<StudentCopy, ProcessCopyError>> {
        let results = images
            .par_iter()
            .enumerate()
            .map(|(index, path)| {
                if cancel.load(Ordering::Relaxed) {
                    return Err(ProcessCopyError::Cancelled(path.clone()));
                }
                self.process_copy(index + 1, path)
            })
            .collect::<Vec<_>>();

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            "processed {} copies, {} failed",
            results.len() - failed,
            failed
        );
        results
    }

    #[time]
    pub fn process_copy(
        &self,
        number: usize,
        image_path: &Path,
    ) -> Result<StudentCopy, ProcessCopyError> {
        let captured = image::open(image_path)
            .map_err(|e| ProcessCopyError::ImageOpen(image_path.to_path_buf(), e))?
            .into_luma8();

        let copy_dir = claim_copy_dir(&self.output_dir, number)
            .map_err(|e| ProcessCopyError::CreateDir(self.output_dir.clone(), e))?;

        let mut record = CopyRecord {
            image: Some(image_path.to_path_buf()),
            ..CopyRecord::default()
        };
        let mut copy = StudentCopy::new(copy_dir, record.clone());
        let stem = copy.stem();

        let alignment = self.aligner.align(&captured);
        record.aligned = alignment.aligned();
        if let Some(failure) = &alignment.failure {
            record
                .issues
                .push(format!("alignment failed, using the unaligned image: {}", failure));
        }
        let sheet = alignment.image;
        save_gray(&sheet, &copy.dir.join(format!("{}_aligned.png", stem)))?;

        let choices = self.config.question_layout.choices;
        for block in [Block::Name, Block::Questions] {
            let Some(block_image) = extract_block(&sheet, &self.template.geometry, block) else {
                warn!("{}: {} block is outside the sheet", image_path.display(), block);
                record.issues.push(format!("{} block is outside the sheet", block));
                continue;
            };
            let block_path = copy.dir.join(block_file_name(&stem, block));
            save_gray(&block_image, &block_path)?;
            let debug = if self.debug {
                ImageDebugWriter::new(block_path, block_image.clone())
            } else {
                ImageDebugWriter::disabled()
            };

            match block {
                Block::Name => match self.read_name(&block_image, &debug) {
                    Ok(reading) => {
                        info!("{}: name {:?}", image_path.display(), reading.name.text);
                        let traced = trace_block(
                            &block_image,
                            &reading.centers,
                            &reading.filled,
                            1,
                            &AmbiguityMap::new(),
                            &Default::default(),
                        );
                        save_rgb(&traced, &copy.dir.join(traced_file_name(&stem, block)))?;
                        record.name = reading.name.text;
                        record.name_ambiguous_columns = reading.name.ambiguous_columns;
                    }
                    Err(e @ NameError::Parity { .. }) => {
                        return Err(ProcessCopyError::Name(image_path.to_path_buf(), e))
                    }
                    Err(e) => {
                        warn!("{}: {}", image_path.display(), e);
                        record.issues.push(e.to_string());
                    }
                },
                Block::Questions => match self.read_questions(&block_image, &debug) {
                    Ok(resolved) => {
                        if !resolved.ambiguous.is_empty() {
                            info!(
                                "{}: questions {:?} need review",
                                image_path.display(),
                                resolved.ambiguous.keys().collect::<Vec<_>>()
                            );
                        }
                        let traced = trace_block(
                            &block_image,
                            &resolved.centers,
                            &resolved.filled,
                            choices,
                            &resolved.ambiguous,
                            &Default::default(),
                        );
                        save_rgb(&traced, &copy.dir.join(traced_file_name(&stem, block)))?;
                        record.centers = resolved.centers;
                        record.filled = resolved.filled;
                        record.ambiguous = resolved.ambiguous;
                    }
                    Err(QuestionsError::Resolve(e)) => {
                        return Err(ProcessCopyError::Resolve(image_path.to_path_buf(), e))
                    }
                    Err(QuestionsError::Grid(e)) => {
                        warn!("{}: questions grid: {}", image_path.display(), e);
                        record.issues.push(format!("questions grid: {}", e));
                    }
                },
            }
        }

        record.score = self.scorer.score(&record.filled);
        debug!(
            "{}: raw score {}, scaled total {}",
            image_path.display(),
            record.score.raw_score,
            record.score.scaled_total
        );

        copy.record = record;
        copy.save()
            .map_err(|e| ProcessCopyError::Copy(image_path.to_path_buf(), e))?;
        if let Err(e) = copy.rename_after_name() {
            warn!("{}: {}", image_path.display(), e);
        }
        Ok(copy)
    }

    fn read_name(
        &self,
        block: &GrayImage,
        debug: &ImageDebugWriter,
    ) -> Result<NameReading, NameError> {
        let inferred = infer_grid(block, &self.config.name_grid)?;
        debug.write("circles", |canvas| {
            draw_circles_debug_image_mut(canvas, &inferred.circles)
        });
        debug.write("grid", |canvas| {
            draw_grid_debug_image_mut(canvas, &inferred.grid)
        });

        let centers = inferred.grid.centers_row_major();
        let filled = fill_decisions(
            block,
            &centers,
            self.classifier.as_ref(),
            self.config.resolver.fill_threshold,
        );
        let name = decode_name(
            &centers,
            &filled,
            &self.config.name_layout,
            &self.config.name_decoder,
        )?;
        Ok(NameReading {
            centers,
            filled,
            name,
        })
    }

    fn read_questions(
        &self,
        block: &GrayImage,
        debug: &ImageDebugWriter,
    ) -> Result<ResolvedAnswers, QuestionsError> {
        let inferred = infer_grid(block, &self.config.questions_grid)?;
        debug.write("circles", |canvas| {
            draw_circles_debug_image_mut(canvas, &inferred.circles)
        });
        debug.write("grid", |canvas| {
            draw_grid_debug_image_mut(canvas, &inferred.grid)
        });

        let layout = &self.config.question_layout;
        let groups = layout.question_groups(&inferred.grid)?;
        Ok(resolve_questions(
            block,
            &groups,
            layout.choices,
            self.classifier.as_ref(),
            &self.config.resolver,
        )?)
    }
}

/// Creates the first `copy_<n>` directory with `n >= first` that does not
/// exist yet. `create_dir` fails on an existing directory, so two workers
/// never claim the same number and earlier copies are never reused.
fn claim_copy_dir(output_dir: &Path, first: usize) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let mut number = first.max(1);
    loop {
        let dir = output_dir.join(format!("copy_{}", number));
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("{} is taken", dir.display());
                number += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn save_gray(image: &GrayImage, path: &Path) -> Result<(), ProcessCopyError> {
    image
        .save(path)
        .map_err(|e| ProcessCopyError::WriteImage(path.to_path_buf(), e))
}

fn save_rgb(image: &image::RgbImage, path: &Path) -> Result<(), ProcessCopyError> {
    image
        .save(path)
        .map_err(|e| ProcessCopyError::WriteImage(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DarknessClassifier;
    use crate::grid::{NameLayout, QuestionLayout};
    use crate::image_utils::{BLACK, WHITE};
    use crate::score::{AnswerKey, ScaledScoreTable};
    use crate::template::{BlockRect, TemplateGeometry};
    use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};

    const NAME_ORIGIN: (i32, i32) = (20, 20);
    const QUESTIONS_ORIGIN: (i32, i32) = (20, 240);

    fn small_config() -> OmrConfig {
        let mut config = OmrConfig::default();
        config.template = TemplateGeometry {
            name_block: BlockRect::new(NAME_ORIGIN.0, NAME_ORIGIN.1, 200, 200),
            questions_block: BlockRect::new(QUESTIONS_ORIGIN.0, QUESTIONS_ORIGIN.1, 400, 160),
        };
        config.name_layout = NameLayout {
            accent_rows: 1,
            letter_rows: 3,
        };
        config.question_layout = QuestionLayout {
            answer_columns: 2,
            questions_per_column: 3,
            choices: 4,
        };
        // small grids: a column or row may have as few as two detections
        for grid in [&mut config.name_grid, &mut config.questions_grid] {
            grid.columns.min_samples = 2;
            grid.rows.min_samples = 2;
        }
        // make alignment fall back so the sheet is read as scanned
        config.align.min_matches = usize::MAX;
        config
    }

    fn name_bubble(slot: i32, row: i32) -> (i32, i32) {
        (NAME_ORIGIN.0 + 30 + slot * 40, NAME_ORIGIN.1 + 30 + row * 40)
    }

    fn question_bubble(column: i32, row: i32) -> (i32, i32) {
        (
            QUESTIONS_ORIGIN.0 + 30 + column * 45,
            QUESTIONS_ORIGIN.1 + 30 + row * 45,
        )
    }

    fn blank_sheet() -> GrayImage {
        let mut sheet = GrayImage::from_pixel(600, 500, WHITE);
        let bubbles = (0..3)
            .flat_map(|slot| (0..4).map(move |row| name_bubble(slot, row)))
            .chain((0..8).flat_map(|column| (0..3).map(move |row| question_bubble(column, row))));
        for center in bubbles {
            for r in 12..=14 {
                draw_hollow_circle_mut(&mut sheet, center, r, BLACK);
            }
        }
        sheet
    }

    fn pipeline(output_dir: PathBuf, template: GrayImage) -> Pipeline {
        let config = small_config();
        let template = Template {
            image: template,
            geometry: config.template,
        };
        let scorer = Scorer::new(
            Some(AnswerKey::parse("1,B\n2,A\n4,D").unwrap()),
            ScaledScoreTable::default(),
            4,
        );
        Pipeline::new(
            config,
            template,
            Box::new(DarknessClassifier::default()),
            scorer,
            output_dir,
            false,
        )
    }

    #[test]
    fn reads_a_synthetic_sheet_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let template = blank_sheet();
        let mut sheet = template.clone();
        // name: B, A, then an accent without a letter
        for center in [name_bubble(0, 2), name_bubble(1, 1), name_bubble(2, 0)] {
            draw_filled_circle_mut(&mut sheet, center, 13, BLACK);
        }
        // question 1 → B, question 4 → D
        for center in [question_bubble(1, 0), question_bubble(7, 0)] {
            draw_filled_circle_mut(&mut sheet, center, 13, BLACK);
        }
        let scan = dir.path().join("scan_01.png");
        sheet.save(&scan).unwrap();

        let output = dir.path().join("out");
        let pipeline = pipeline(output.clone(), template);
        let copy = pipeline.process_copy(1, &scan).unwrap();

        assert_eq!(copy.record.name, "BA");
        assert_eq!(copy.dir, output.join("Ba"));
        assert!(!copy.record.aligned);
        assert_eq!(copy.record.filled.len(), 24);
        assert_eq!(copy.record.centers.len(), 24);
        assert_eq!(&copy.record.filled[0..4], &[false, true, false, false]);
        assert_eq!(&copy.record.filled[12..16], &[false, false, false, true]);
        assert!(copy.record.ambiguous.contains_key(&2));
        assert!(!copy.record.ambiguous.contains_key(&1));
        assert_eq!(copy.record.score.raw_score, 2);

        for file in [
            "scan_01_aligned.png",
            "scan_01_name.png",
            "scan_01_questions.png",
            "scan_01_name_traced.png",
            "scan_01_questions_traced.png",
            "meta.json",
        ] {
            assert!(copy.dir.join(file).is_file(), "missing {}", file);
        }
        assert_eq!(StudentCopy::open(&copy.dir).unwrap().record, copy.record);
    }

    #[test]
    fn missing_grid_is_an_issue_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blank = GrayImage::from_pixel(600, 500, WHITE);
        let scan = dir.path().join("blank.png");
        blank.save(&scan).unwrap();

        let pipeline = pipeline(dir.path().join("out"), blank_sheet());
        let copy = pipeline.process_copy(3, &scan).unwrap();
        assert_eq!(copy.dir, dir.path().join("out").join("copy_3"));
        assert_eq!(copy.record.name, "");
        assert!(copy.record.filled.is_empty());
        assert_eq!(copy.record.issues.len(), 3, "{:?}", copy.record.issues);
        assert_eq!(copy.record.score.raw_score, 0);
    }

    #[test]
    fn batch_reports_each_copy_and_honors_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("blank.png");
        GrayImage::from_pixel(600, 500, WHITE).save(&scan).unwrap();
        let missing = dir.path().join("missing.png");

        let pipeline = pipeline(dir.path().join("out"), blank_sheet());
        let results = pipeline.process_batch(
            &[scan.clone(), missing.clone()],
            &AtomicBool::new(false),
        );
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ProcessCopyError::ImageOpen(..))));

        let cancelled = pipeline.process_batch(&[scan], &AtomicBool::new(true));
        assert!(matches!(cancelled[0], Err(ProcessCopyError::Cancelled(_))));
    }

    #[test]
    fn rerunning_into_the_same_output_keeps_earlier_copies() {
        let dir = tempfile::tempdir().unwrap();
        let template = blank_sheet();
        let mut first_sheet = template.clone();
        draw_filled_circle_mut(&mut first_sheet, question_bubble(1, 0), 13, BLACK);
        let first_scan = dir.path().join("scan_a.png");
        first_sheet.save(&first_scan).unwrap();
        let second_scan = dir.path().join("scan_b.png");
        template.save(&second_scan).unwrap();

        let output = dir.path().join("out");
        let pipeline = pipeline(output.clone(), template);
        let no_cancel = AtomicBool::new(false);
        let first = pipeline.process_batch(&[first_scan.clone()], &no_cancel);
        let second = pipeline.process_batch(&[second_scan.clone()], &no_cancel);
        let first = first[0].as_ref().unwrap();
        let second = second[0].as_ref().unwrap();

        assert_eq!(first.dir, output.join("copy_1"));
        assert_eq!(second.dir, output.join("copy_2"));
        let kept = StudentCopy::open(&first.dir).unwrap();
        assert_eq!(kept.record.image, Some(first_scan));
        assert_eq!(kept.record.score.raw_score, 1);
        assert_eq!(
            StudentCopy::open(&second.dir).unwrap().record.image,
            Some(second_scan)
        );
    }

    #[test]
    fn copy_numbers_skip_taken_directories() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");
        assert_eq!(claim_copy_dir(&output, 1).unwrap(), output.join("copy_1"));
        assert_eq!(claim_copy_dir(&output, 1).unwrap(), output.join("copy_2"));
        assert_eq!(claim_copy_dir(&output, 5).unwrap(), output.join("copy_5"));
        assert_eq!(claim_copy_dir(&output, 0).unwrap(), output.join("copy_3"));
    }
}
