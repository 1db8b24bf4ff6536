use std::path::{Path, PathBuf};

/// One input-to-output conversion within a batch. Immutable once enqueued.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversionJob {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

impl ConversionJob {
    pub fn new(input_path: PathBuf, output_path: PathBuf) -> Self {
        ConversionJob {
            input_path,
            output_path,
        }
    }

    /// Derive the output path from the input: same stem with an `.mp4`
    /// extension, placed next to the input or under `output_dir` when given.
    pub fn with_derived_output(input_path: PathBuf, output_dir: Option<&Path>) -> Self {
        let mut output_path = match output_dir {
            Some(dir) => match input_path.file_name() {
                Some(name) => dir.join(name),
                None => dir.join(&input_path),
            },
            None => input_path.clone(),
        };
        output_path.set_extension("mp4");
        ConversionJob {
            input_path,
            output_path,
        }
    }

    pub fn display_name(&self) -> String {
        match self.input_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.input_path.to_string_lossy().into_owned(),
        }
    }
}
