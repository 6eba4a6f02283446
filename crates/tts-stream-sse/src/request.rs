use serde::Serialize;
use tts_stream::{AudioFormat, TtsSettings};

/// JSON body of a streaming synthesis request.
#[derive(Debug, Serialize)]
pub struct SynthesisRequest<'a> {
    pub model: &'a str,
    pub text: &'a str,
    pub stream: bool,
    pub voice_setting: VoiceSetting<'a>,
    pub audio_setting: AudioSetting,
}

#[derive(Debug, Serialize)]
pub struct VoiceSetting<'a> {
    pub voice_id: &'a str,
    pub speed: f32,
    pub vol: f32,
    pub pitch: i32,
}

#[derive(Debug, Serialize)]
pub struct AudioSetting {
    pub sample_rate: u32,
    pub bitrate: u32,
    pub format: AudioFormat,
    pub channel: u8,
}

impl<'a> SynthesisRequest<'a> {
    pub fn new(settings: &'a TtsSettings, text: &'a str) -> Self {
        Self {
            model: &settings.model,
            text,
            stream: true,
            voice_setting: VoiceSetting {
                voice_id: &settings.voice_id,
                speed: settings.speed,
                vol: settings.vol,
                pitch: settings.pitch,
            },
            audio_setting: AudioSetting {
                sample_rate: settings.sample_rate,
                bitrate: settings.bitrate,
                format: settings.format,
                channel: settings.channel,
            },
        }
    }
}
