pub mod batch;
pub mod engine;
pub mod error;
pub mod fstools;
pub mod job;
pub mod progress;
pub mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use human_repr::HumanDuration;
use kdam::{Bar, BarExt, term, tqdm};
use rustop::opts;
use tracing_subscriber::EnvFilter;

use batch::{Batch, BatchEvent, BatchHandle, JobOutcome};
use engine::Engine;
use error::ConvertError;
use fstools::{DirEntryCategory, classify_file, find_source_files};
use job::ConversionJob;
use progress::{LineCategory, ProgressSnapshot};
use settings::CodecSettings;

fn main() -> ExitCode {
    let (args, _rest) = opts! {
        synopsis "Batch-convert mkv files to mp4 with an external ffmpeg-style engine";
        opt video_codec:String=String::from("libx264"), desc:"Video codec. [libx264, libx265, copy]";
        opt audio_codec:String=String::from("aac"), desc:"Audio codec. [aac, mp3, copy]";
        opt crf:Option<u32>, desc:"Quality (CRF); ignored when the video codec is copy.";
        opt preset:Option<String>, desc:"Encoder speed preset; ignored when the video codec is copy.";
        opt settings_file:Option<String>, desc:"JSON file with codec settings; overrides the codec options.";
        opt output_dir:Option<String>, desc:"Directory for converted files. Defaults to each input's directory.";
        opt recursive:bool=false, desc:"Recurse into subdirectories when scanning.";
        opt engine:String=String::from("ffmpeg"), desc:"Path to the transcoding engine executable.";
        param inpath:String, desc:"Input file or directory";
    }
    .parse_or_exit();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("convert_mkv=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = match build_settings(
        args.video_codec,
        args.audio_codec,
        args.crf,
        args.preset,
        args.settings_file.as_deref(),
    ) {
        Ok(settings) => settings,
        Err(err) => {
            println!("{}", err);
            return ExitCode::FAILURE;
        },
    };

    let inpath = PathBuf::from(&args.inpath);
    let output_dir = args.output_dir.map(PathBuf::from);
    let sources = match classify_file(&inpath) {
        DirEntryCategory::Unknown => {
            println!("Unable to classify {:?}.", inpath);
            return ExitCode::FAILURE;
        },
        DirEntryCategory::DoesNotExist => {
            println!("{:?} does not exist.", inpath);
            return ExitCode::FAILURE;
        },
        DirEntryCategory::SymbolicLink => {
            println!("{:?} is a symlink.", inpath);
            return ExitCode::FAILURE;
        },
        DirEntryCategory::Directory => find_source_files(&inpath, args.recursive),
        DirEntryCategory::RegularFile => vec![inpath.clone()],
    };
    if sources.is_empty() {
        println!("No .mkv files found in {:?}.", inpath);
        return ExitCode::FAILURE;
    }

    let jobs: Vec<ConversionJob> = sources
        .into_iter()
        .map(|input| ConversionJob::with_derived_output(input, output_dir.as_deref()))
        .collect();
    println!("Converting {} file(s).", jobs.len());

    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in signal_hook::consts::TERM_SIGNALS {
        let _ = signal_hook::flag::register(*signal, Arc::clone(&interrupted));
    }

    let mut batch = Batch::new(
        jobs.clone(),
        settings,
        Engine::new(PathBuf::from(&args.engine)),
    );
    let rx = batch.subscribe();
    let handle = match batch.start() {
        Ok(handle) => handle,
        Err(err) => {
            println!("{}", err);
            return ExitCode::FAILURE;
        },
    };

    let outcomes = consume_events(&rx, &handle, &jobs, &interrupted);
    handle.wait();
    summarize(&outcomes)
}

fn build_settings(
    video_codec: String,
    audio_codec: String,
    crf: Option<u32>,
    preset: Option<String>,
    settings_file: Option<&str>,
) -> Result<CodecSettings, ConvertError> {
    if let Some(path) = settings_file {
        return CodecSettings::from_file(&PathBuf::from(path));
    }
    let defaults = CodecSettings::default();
    Ok(CodecSettings {
        video_codec,
        audio_codec,
        crf: crf.or(defaults.crf),
        preset: preset.or(defaults.preset),
    })
}

fn consume_events(
    rx: &Receiver<BatchEvent>,
    handle: &BatchHandle,
    jobs: &[ConversionJob],
    interrupted: &AtomicBool,
) -> Vec<JobOutcome> {
    term::init(false);

    let mut outcomes = vec![];
    let mut pbar: Option<Bar> = None;
    let mut cancel_requested = false;
    loop {
        if interrupted.load(Ordering::SeqCst) && !cancel_requested {
            cancel_requested = true;
            println!("Interrupt received; stopping after the current engine shuts down.");
            handle.cancel();
        }

        let event = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match event {
            BatchEvent::JobStarted { index, name } => {
                let mut bar = tqdm!(
                    total = 100,
                    desc = format!("[{}/{}] {}", index + 1, jobs.len(), name),
                    position = 0,
                    force_refresh = true
                );
                let _ = bar.refresh();
                pbar = Some(bar);
            },
            BatchEvent::EngineLine { update, .. } => {
                if update.category == LineCategory::Progress {
                    if let (Some(bar), Some(snapshot)) = (pbar.as_mut(), update.snapshot) {
                        if let Some(percent) = snapshot.percent {
                            let _ = bar.update_to(percent.round() as usize);
                        }
                        bar.set_postfix(render_postfix(&snapshot));
                    }
                }
            },
            BatchEvent::JobFinished { index, outcome } => {
                if pbar.take().is_some() {
                    println!();
                }
                let name = jobs
                    .get(index)
                    .map(|job| job.display_name())
                    .unwrap_or_default();
                match &outcome {
                    JobOutcome::Succeeded => println!("✓ Converted: {}", name),
                    JobOutcome::Failed(failure) => println!("✗ Failed: {} ({})", name, failure),
                    JobOutcome::Skipped => println!("- Skipped: {}", name),
                }
                outcomes.push(outcome);
            },
            BatchEvent::BatchComplete => break,
        }
    }
    outcomes
}

fn render_postfix(snapshot: &ProgressSnapshot) -> String {
    let mut parts = vec![];
    if let Some(speed) = snapshot.speed {
        parts.push(format!("{speed:.1}x"));
    }
    if let Some(remaining) = snapshot.remaining_seconds {
        parts.push(format!("eta {}", remaining.human_duration()));
    }
    parts.join(", ")
}

fn summarize(outcomes: &[JobOutcome]) -> ExitCode {
    let converted = outcomes
        .iter()
        .filter(|o| matches!(o, JobOutcome::Succeeded))
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, JobOutcome::Failed(_)))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, JobOutcome::Skipped))
        .count();
    println!("{} converted, {} failed, {} skipped.", converted, failed, skipped);

    match any_failed(outcomes) {
        false => ExitCode::SUCCESS,
        true => ExitCode::FAILURE,
    }
}

fn any_failed(outcomes: &[JobOutcome]) -> bool {
    outcomes.iter().any(|o| matches!(o, JobOutcome::Failed(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_settings_from_flags() {
        let settings = build_settings(
            String::from("libx265"),
            String::from("copy"),
            Some(20),
            None,
            None,
        )
        .unwrap();
        assert_eq!(settings.video_codec, "libx265");
        assert_eq!(settings.crf, Some(20));
        // Unset flags keep the stock defaults.
        assert_eq!(settings.preset, Some(String::from("medium")));
    }

    #[test]
    fn test_render_postfix_without_estimates() {
        let snapshot = ProgressSnapshot {
            position_seconds: 1.0,
            percent: None,
            speed: None,
            remaining_seconds: None,
        };
        assert_eq!(render_postfix(&snapshot), "");
    }

    #[test]
    fn test_only_failures_fail_the_run() {
        assert!(!any_failed(&[JobOutcome::Succeeded, JobOutcome::Skipped]));
        assert!(any_failed(&[
            JobOutcome::Succeeded,
            JobOutcome::Failed(batch::JobFailure::ExitCode(1)),
        ]));
    }
}
