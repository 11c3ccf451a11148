use camrec_media_info::{
    AudioCodec, AudioParams, ContainerFormat, MediaInfoError, ThumbnailParams, VideoCodec,
    VideoParams,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

/// Upper bound on outputs per capture session.
pub const MAX_STREAMS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Stream count {0} outside 1..={max}", max = MAX_STREAMS)]
    StreamCount(usize),
    #[error("Stream '{stream}': {source}")]
    Media {
        stream: String,
        #[source]
        source: MediaInfoError,
    },
    #[error("Stream '{0}': split duration must be non-zero")]
    SplitDuration(String),
    #[error("Stream '{stream}': {pool} pool must have at least one cell")]
    PoolSize { stream: String, pool: &'static str },
    #[error("Channel {0} is used by more than one stream")]
    DuplicateChannel(u32),
    #[error("IO/{0}")]
    Io(#[from] std::io::Error),
    #[error("Serde/{0}")]
    Serde(#[from] serde_json::Error),
}

/// Attributes of one capture session (one camera).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAttr {
    pub camera_id: u32,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub name: String,
    /// Hardware encoder channel this stream's video comes from.
    pub channel_id: u32,
    #[serde(default = "default_format")]
    pub format: ContainerFormat,
    pub video: VideoParams,
    #[serde(default)]
    pub audio: Option<AudioParams>,
    #[serde(default)]
    pub thumbnail: ThumbnailParams,
    #[serde(default = "default_split_duration")]
    pub split_duration_secs: u32,
    #[serde(default)]
    pub pools: PoolConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub video_cells: usize,
    pub audio_cells: usize,
    pub thumbnail_cells: usize,
    /// How long a producer may wait for a free cell before the frame is refused.
    pub acquire_timeout_ms: u64,
    /// Discard a queued non-key video frame instead of waiting when the video pool is full.
    pub drop_non_key_on_overflow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            video_cells: 20,
            audio_cells: 20,
            thumbnail_cells: 2,
            acquire_timeout_ms: 5000,
            drop_non_key_on_overflow: false,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

fn default_format() -> ContainerFormat {
    ContainerFormat::Mp4
}

fn default_split_duration() -> u32 {
    60
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, channel_id: u32, video: VideoParams) -> Self {
        Self {
            name: name.into(),
            channel_id,
            format: default_format(),
            video,
            audio: None,
            thumbnail: ThumbnailParams::default(),
            split_duration_secs: default_split_duration(),
            pools: PoolConfig::default(),
        }
    }

    pub fn with_audio(mut self, audio: AudioParams) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_format(mut self, format: ContainerFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_split_duration(mut self, secs: u32) -> Self {
        self.split_duration_secs = secs;
        self
    }

    pub fn with_pools(mut self, pools: PoolConfig) -> Self {
        self.pools = pools;
        self
    }

    pub fn split_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.split_duration_secs))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let media = |source| ConfigError::Media {
            stream: self.name.clone(),
            source,
        };

        self.video.validate().map_err(media)?;
        if let Some(audio) = &self.audio {
            audio.validate().map_err(media)?;
        }

        if self.split_duration_secs == 0 {
            return Err(ConfigError::SplitDuration(self.name.clone()));
        }

        for (pool, cells) in [
            ("video", self.pools.video_cells),
            ("thumbnail", self.pools.thumbnail_cells),
        ]
        .into_iter()
        .chain(self.audio.map(|_| ("audio", self.pools.audio_cells)))
        {
            if cells == 0 {
                return Err(ConfigError::PoolSize {
                    stream: self.name.clone(),
                    pool,
                });
            }
        }

        Ok(())
    }
}

impl SessionAttr {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let attr: Self = serde_json::from_str(&content)?;
        attr.validate()?;
        Ok(attr)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() || self.streams.len() > MAX_STREAMS {
            return Err(ConfigError::StreamCount(self.streams.len()));
        }

        let mut channels = HashSet::new();
        for stream in &self.streams {
            stream.validate()?;
            if !channels.insert(stream.channel_id) {
                return Err(ConfigError::DuplicateChannel(stream.channel_id));
            }
        }

        Ok(())
    }

    /// Main, sub and live outputs of a single 1080p camera.
    pub fn sample(camera_id: u32) -> Self {
        let audio = AudioParams {
            codec: AudioCodec::Mp2,
            sample_rate: 48_000,
            channels: 1,
            bitrate_kbps: 128,
        };

        Self {
            camera_id,
            streams: vec![
                StreamConfig::new(
                    "main",
                    0,
                    VideoParams::new(VideoCodec::H265, 1920, 1080, 30, 30),
                )
                .with_audio(audio),
                StreamConfig::new("sub", 1, VideoParams::new(VideoCodec::H264, 640, 360, 30, 30))
                    .with_audio(audio),
                StreamConfig::new("live", 2, VideoParams::new(VideoCodec::H264, 1280, 720, 30, 60))
                    .with_format(ContainerFormat::MpegTs)
                    .with_split_duration(10),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn video() -> VideoParams {
        VideoParams::new(VideoCodec::H264, 1920, 1080, 30, 30)
    }

    #[test]
    fn sample_is_valid() {
        SessionAttr::sample(0).validate().unwrap();
    }

    #[test]
    fn rejects_empty_and_oversized_sessions() {
        let mut attr = SessionAttr {
            camera_id: 0,
            streams: vec![],
        };
        assert!(matches!(attr.validate(), Err(ConfigError::StreamCount(0))));

        attr.streams = (0..=MAX_STREAMS as u32)
            .map(|ch| StreamConfig::new(format!("s{ch}"), ch, video()))
            .collect();
        assert!(matches!(attr.validate(), Err(ConfigError::StreamCount(9))));
    }

    #[test]
    fn rejects_duplicate_channels() {
        let attr = SessionAttr {
            camera_id: 0,
            streams: vec![
                StreamConfig::new("a", 3, video()),
                StreamConfig::new("b", 3, video()),
            ],
        };
        assert!(matches!(
            attr.validate(),
            Err(ConfigError::DuplicateChannel(3))
        ));
    }

    #[test]
    fn rejects_zero_sized_pools() {
        let attr = SessionAttr {
            camera_id: 0,
            streams: vec![StreamConfig::new("a", 0, video()).with_pools(PoolConfig {
                thumbnail_cells: 0,
                ..Default::default()
            })],
        };
        assert!(matches!(
            attr.validate(),
            Err(ConfigError::PoolSize {
                pool: "thumbnail",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_frame_rate() {
        let mut params = video();
        params.frame_rate = 0;
        let attr = SessionAttr {
            camera_id: 0,
            streams: vec![StreamConfig::new("a", 0, params)],
        };
        assert!(matches!(
            attr.validate(),
            Err(ConfigError::Media {
                source: MediaInfoError::FrameRate,
                ..
            })
        ));
    }

    #[test]
    fn loads_json_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{
                "cameraId": 7,
                "streams": [{
                    "name": "main",
                    "channelId": 0,
                    "video": { "codec": "h265", "width": 2560, "height": 1440, "frameRate": 25, "gop": 50 }
                }]
            }"#,
        )
        .unwrap();

        let attr = SessionAttr::load(&path).unwrap();
        let stream = &attr.streams[0];
        assert_eq!(attr.camera_id, 7);
        assert_eq!(stream.format, ContainerFormat::Mp4);
        assert_eq!(stream.split_duration_secs, 60);
        assert_eq!(stream.pools, PoolConfig::default());
        assert!(stream.audio.is_none());
    }
}
