use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::ConvertError;
use crate::job::ConversionJob;
use crate::settings::CodecSettings;

/// The external transcoding executable. Holds only its path; every job gets
/// a fresh child process.
#[derive(Clone, Debug)]
pub struct Engine {
    path: PathBuf,
}

impl Engine {
    pub fn new(path: PathBuf) -> Self {
        Engine { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Version probe. A batch never starts against an engine that cannot
    /// answer this; absence is reported once, up front, not per job.
    pub fn probe(&self) -> Result<(), ConvertError> {
        let status = Command::new(&self.path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(ConvertError::EngineNotFound(self.path.clone())),
        }
    }

    /// Map the batch settings onto the engine's argument grammar for one job.
    /// Quality and preset are omitted entirely in video stream-copy mode.
    pub fn build_args(&self, settings: &CodecSettings, job: &ConversionJob) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            OsString::from("-i"),
            job.input_path.clone().into_os_string(),
        ];

        args.push(OsString::from("-c:v"));
        if settings.copies_video() {
            args.push(OsString::from("copy"));
        } else {
            args.push(OsString::from(&settings.video_codec));
            if let Some(crf) = settings.crf {
                args.push(OsString::from("-crf"));
                args.push(OsString::from(crf.to_string()));
            }
            if let Some(preset) = &settings.preset {
                args.push(OsString::from("-preset"));
                args.push(OsString::from(preset));
            }
        }

        args.push(OsString::from("-c:a"));
        args.push(OsString::from(&settings.audio_codec));

        args.push(OsString::from("-y"));
        args.push(job.output_path.clone().into_os_string());
        args
    }

    /// One-line rendition of the full invocation, surfaced before spawn for
    /// operational visibility.
    pub fn render_command(&self, args: &[OsString]) -> String {
        let mut parts = vec![self.path.to_string_lossy().into_owned()];
        parts.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}
