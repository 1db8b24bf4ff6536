use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

/// Codec configuration for a whole batch. One snapshot is taken when the
/// batch starts; individual jobs never diverge from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodecSettings {
    pub video_codec: String,
    pub audio_codec: String,
    #[serde(default)]
    pub crf: Option<u32>,
    #[serde(default)]
    pub preset: Option<String>,
}

impl Default for CodecSettings {
    fn default() -> Self {
        CodecSettings {
            video_codec: String::from("libx264"),
            audio_codec: String::from("aac"),
            crf: Some(23),
            preset: Some(String::from("medium")),
        }
    }
}

impl CodecSettings {
    /// Stream-copy mode: the engine remuxes without re-encoding video, so
    /// quality and preset parameters do not apply.
    pub fn copies_video(&self) -> bool {
        self.video_codec == "copy"
    }

    pub fn from_file(path: &PathBuf) -> Result<Self, ConvertError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| ConvertError::SettingsRead(path.clone(), err))?;
        serde_json::from_str(&raw)
            .map_err(|err| ConvertError::SettingsParse(path.clone(), err))
    }
}
