extern crate log;
extern crate pretty_env_logger;

use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::atomic::AtomicBool;

use clap::{arg, command, ArgMatches, Command};
use log::info;

use crate::classifier::{FillClassifier, LogisticClassifier};
use crate::config::OmrConfig;
use crate::copy::{load_corrections, pending_reviews, StudentCopy};
use crate::process::Pipeline;
use crate::score::Scorer;
use crate::stats::{batch_statistics, load_records};
use crate::template::Template;

mod align;
mod classifier;
mod cluster;
mod config;
mod copy;
mod debug;
mod geometry;
mod grid;
mod homography;
mod hough;
mod image_utils;
mod metadata;
mod name;
mod process;
mod resolve;
mod score;
mod stats;
mod template;
mod types;

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let matches = cli().get_matches();
    let result = match matches.subcommand() {
        Some(("process", matches)) => process(matches),
        Some(("review", matches)) => review(matches),
        Some(("stats", matches)) => stats(matches),
        _ => unreachable!("a subcommand is required"),
    };

    if let Err(message) = result {
        eprintln!("Error: {}", message);
        exit(1);
    }
}

fn path_arg<'a>(matches: &'a ArgMatches, id: &str) -> Option<&'a Path> {
    matches.get_one::<String>(id).map(Path::new)
}

fn load_config(matches: &ArgMatches) -> Result<OmrConfig, String> {
    match path_arg(matches, "config") {
        Some(path) => OmrConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(OmrConfig::default()),
    }
}

fn load_scorer(matches: &ArgMatches, config: &OmrConfig) -> Scorer {
    Scorer::from_paths(
        path_arg(matches, "key"),
        path_arg(matches, "scores"),
        config.question_layout.choices,
    )
}

fn process(matches: &ArgMatches) -> Result<(), String> {
    let config = load_config(matches)?;
    let template_path = path_arg(matches, "template").ok_or("template path is required")?;
    let template = Template::load(template_path, config.template).map_err(|e| e.to_string())?;
    let size = template.size();
    info!(
        "template {} is {}x{}",
        template_path.display(),
        size.width,
        size.height
    );
    let classifier: Box<dyn FillClassifier> = match path_arg(matches, "classifier") {
        Some(path) => Box::new(LogisticClassifier::load(path).map_err(|e| e.to_string())?),
        None => Box::new(config.darkness.clone()),
    };
    let scorer = load_scorer(matches, &config);
    let output_dir = path_arg(matches, "output")
        .map_or_else(|| PathBuf::from("output"), Path::to_path_buf);
    let images = matches
        .get_many::<String>("images")
        .ok_or("at least one image is required")?
        .map(PathBuf::from)
        .collect::<Vec<_>>();

    let pipeline = Pipeline::new(
        config,
        template,
        classifier,
        scorer,
        output_dir,
        matches.get_flag("debug"),
    );
    let cancel = AtomicBool::new(false);
    let results = pipeline.process_batch(&images, &cancel);

    let mut copies = vec![];
    let mut failed = 0;
    for (image, result) in images.iter().zip(results) {
        match result {
            Ok(copy) => {
                println!(
                    "{}: {:?} raw {} scaled {} -> {}",
                    image.display(),
                    copy.record.name,
                    copy.record.score.raw_score,
                    copy.record.score.scaled_total,
                    copy.dir.display()
                );
                for issue in &copy.record.issues {
                    println!("  issue: {}", issue);
                }
                copies.push(copy);
            }
            Err(e) => {
                eprintln!("{}", e);
                failed += 1;
            }
        }
    }

    let pending = pending_reviews(&copies);
    if !pending.is_empty() {
        println!(
            "{}",
            serde_json::to_string_pretty(&pending).map_err(|e| e.to_string())?
        );
    }

    if failed > 0 {
        return Err(format!("{} of {} copies failed", failed, images.len()));
    }
    Ok(())
}

fn review(matches: &ArgMatches) -> Result<(), String> {
    let config = load_config(matches)?;
    let copy_dir = path_arg(matches, "copy_dir").ok_or("copy directory is required")?;
    let corrections_path =
        path_arg(matches, "corrections").ok_or("corrections file is required")?;

    let mut copy = StudentCopy::open(copy_dir).map_err(|e| e.to_string())?;
    let corrections = load_corrections(corrections_path).map_err(|e| e.to_string())?;
    let scorer = load_scorer(matches, &config);
    let choices = config.question_layout.choices;

    let outcome = copy
        .apply_review(&corrections, &scorer, choices)
        .map_err(|e| e.to_string())?;
    copy.retrace_questions(choices).map_err(|e| e.to_string())?;

    println!(
        "modified {:?}, still ambiguous {:?}, raw {} scaled {}",
        outcome.modified,
        outcome.still_ambiguous,
        copy.record.score.raw_score,
        copy.record.score.scaled_total
    );
    Ok(())
}

fn stats(matches: &ArgMatches) -> Result<(), String> {
    let output_dir = path_arg(matches, "output_dir").ok_or("output directory is required")?;
    let records = load_records(output_dir).map_err(|e| e.to_string())?;
    let statistics = batch_statistics(&records);
    println!(
        "{}",
        serde_json::to_string_pretty(&statistics).map_err(|e| e.to_string())?
    );
    Ok(())
}

#[allow(clippy::cognitive_complexity)]
fn cli() -> Command {
    command!()
        .subcommand_required(true)
        .subcommand(
            Command::new("process")
                .about("Align, read and score scanned answer sheets")
                .arg(arg!(-t --template <PATH> "Path to the blank template sheet").required(true))
                .arg(arg!(-c --config <PATH> "Path to an OMR configuration JSON file"))
                .arg(arg!(-k --key <PATH> "Path to the answer key (question,letter per line)"))
                .arg(arg!(-s --scores <PATH> "Path to the scaled score table JSON file"))
                .arg(arg!(--classifier <PATH> "Path to a logistic fill classifier JSON file"))
                .arg(arg!(-o --output <DIR> "Directory receiving one folder per copy"))
                .arg(arg!(-d --debug "Write debug images next to each block"))
                .arg(arg!(images: <IMAGES> ... "Scanned copies").required(true)),
        )
        .subcommand(
            Command::new("review")
                .about("Apply manual corrections to a processed copy")
                .arg(arg!(-c --config <PATH> "Path to an OMR configuration JSON file"))
                .arg(arg!(-k --key <PATH> "Path to the answer key (question,letter per line)"))
                .arg(arg!(-s --scores <PATH> "Path to the scaled score table JSON file"))
                .arg(arg!(copy_dir: <COPY_DIR> "Processed copy directory").required(true))
                .arg(
                    arg!(corrections: <CORRECTIONS_JSON> "Question to corrected choices map")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("stats")
                .about("Score statistics over a processed batch")
                .arg(arg!(output_dir: <OUTPUT_DIR> "Directory holding processed copies").required(true)),
        )
}
