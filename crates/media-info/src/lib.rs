use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const MICROS_PER_SEC: i64 = 1_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MediaInfoError {
    #[error("Unsupported number of channels: {0}")]
    ChannelCount(u16),
    #[error("Frame rate must be non-zero")]
    FrameRate,
    #[error("GOP length must be non-zero")]
    Gop,
    #[error("Invalid dimensions {0}x{1}")]
    Dimensions(u32, u32),
    #[error("Sample rate must be non-zero")]
    SampleRate,
    #[error("Unknown {kind} tag '{tag}'")]
    UnknownTag { kind: &'static str, tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
    #[serde(rename = "mpegts")]
    MpegTs,
    Flv,
}

impl ContainerFormat {
    /// Short name understood by the container writers.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::MpegTs => "mpegts",
            Self::Flv => "flv",
        }
    }

    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::MpegTs => "ts",
            Self::Flv => "flv",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ContainerFormat {
    type Err = MediaInfoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mp4" => Self::Mp4,
            "mpegts" | "ts" => Self::MpegTs,
            "flv" => Self::Flv,
            _ => {
                return Err(MediaInfoError::UnknownTag {
                    kind: "container",
                    tag: s.to_string(),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// MPEG-1 Layer III payloads, declared to the container as MP2.
    Mp3,
    Mp2,
}

impl AudioCodec {
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Mp2 => "mp2",
        }
    }

    /// Codec tag handed to the container. Both variants are muxed as MP2.
    pub const fn muxer_tag(&self) -> &'static str {
        "mp2"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoParams {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub gop: u32,
    #[serde(default)]
    pub bitrate_kbps: u32,
}

impl VideoParams {
    pub fn new(codec: VideoCodec, width: u32, height: u32, frame_rate: u32, gop: u32) -> Self {
        Self {
            codec,
            width,
            height,
            frame_rate,
            gop,
            bitrate_kbps: 0,
        }
    }

    pub fn validate(&self) -> Result<(), MediaInfoError> {
        if self.frame_rate == 0 {
            return Err(MediaInfoError::FrameRate);
        }
        if self.gop == 0 {
            return Err(MediaInfoError::Gop);
        }
        if self.width == 0 || self.height == 0 {
            return Err(MediaInfoError::Dimensions(self.width, self.height));
        }
        Ok(())
    }

    /// Length of one frame in microseconds, truncated.
    pub fn frame_interval_us(&self) -> i64 {
        MICROS_PER_SEC / i64::from(self.frame_rate.max(1))
    }

    /// Length of one frame in milliseconds, truncated.
    pub fn frame_interval_ms(&self) -> u64 {
        1000 / u64::from(self.frame_rate.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioParams {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default)]
    pub bitrate_kbps: u32,
}

impl AudioParams {
    pub const MAX_AUDIO_CHANNELS: u16 = 8;

    pub fn new(codec: AudioCodec, sample_rate: u32, channels: u16) -> Result<Self, MediaInfoError> {
        let params = Self {
            codec,
            sample_rate,
            channels,
            bitrate_kbps: 0,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), MediaInfoError> {
        if self.channels == 0 || self.channels > Self::MAX_AUDIO_CHANNELS {
            return Err(MediaInfoError::ChannelCount(self.channels));
        }
        if self.sample_rate == 0 {
            return Err(MediaInfoError::SampleRate);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailKind {
    #[default]
    Jpeg,
    Nv12,
}

impl ThumbnailKind {
    /// Type byte stored after the `thm` tag in the trailer box.
    pub const fn code(&self) -> u8 {
        match self {
            Self::Jpeg => 1,
            Self::Nv12 => 2,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Jpeg),
            2 => Some(Self::Nv12),
            _ => None,
        }
    }
}

/// Geometry of the preview snapshot embedded into each finished file.
///
/// `virtual_*` are the aligned buffer dimensions the hardware scaler produced,
/// which can exceed the visible `width`/`height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailParams {
    #[serde(default)]
    pub kind: ThumbnailKind,
    pub width: u32,
    pub height: u32,
    pub virtual_width: u32,
    pub virtual_height: u32,
}

impl Default for ThumbnailParams {
    fn default() -> Self {
        Self {
            kind: ThumbnailKind::Jpeg,
            width: 320,
            height: 180,
            virtual_width: 320,
            virtual_height: 192,
        }
    }
}
