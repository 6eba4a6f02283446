use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TtsError;

/// Audio container of a cached artifact.
///
/// The set is closed: it mirrors the formats the synthesis endpoint can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Pcm,
    Flac,
    Wav,
}

impl AudioFormat {
    /// All known formats, in lookup order.
    pub const ALL: [AudioFormat; 4] = [
        AudioFormat::Mp3,
        AudioFormat::Pcm,
        AudioFormat::Flac,
        AudioFormat::Wav,
    ];

    /// File extension (without the dot), also the wire name of the format.
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Pcm => "pcm",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = TtsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AudioFormat::ALL
            .into_iter()
            .find(|f| f.extension().eq_ignore_ascii_case(s.trim_start_matches('.')))
            .ok_or(TtsError::InvalidParams("unknown audio format"))
    }
}
