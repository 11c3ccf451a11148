//! Container writers the workers hand ordered frames to.

mod es;
#[cfg(feature = "ffmpeg")]
mod ffmpeg_writer;

pub use es::EsFileWriter;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_writer::FfmpegWriter;

use camrec_media_info::{AudioParams, ContainerFormat, VideoParams};
use std::path::Path;

use crate::config::StreamConfig;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("IO/{0}")]
    Io(#[from] std::io::Error),
    #[error("No file is open")]
    NotOpen,
    #[error("A file is already open")]
    AlreadyOpen,
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg/{0}")]
    Ffmpeg(#[from] ::ffmpeg::Error),
}

/// Serializes one output file at a time.
///
/// Calls always arrive in the order `init`, frames, optional `append_trailer`, `deinit`.
pub trait ContainerWriter: Send + 'static {
    fn init(
        &mut self,
        format: ContainerFormat,
        path: &Path,
        video: &VideoParams,
        audio: Option<&AudioParams>,
    ) -> Result<(), WriterError>;

    fn write_video_frame(&mut self, data: &[u8], pts: i64, key_frame: bool)
    -> Result<(), WriterError>;

    fn write_audio_frame(&mut self, data: &[u8], pts: i64) -> Result<(), WriterError>;

    /// Writes raw bytes at the current end of the file, ahead of the container's own trailer.
    fn append_trailer(&mut self, data: &[u8]) -> Result<(), WriterError>;

    fn deinit(&mut self) -> Result<(), WriterError>;
}

/// Builds the writer owned by each worker.
pub trait WriterFactory: Send + Sync + 'static {
    fn make_writer(&self, stream: &StreamConfig) -> Result<Box<dyn ContainerWriter>, WriterError>;
}

impl<F> WriterFactory for F
where
    F: Fn(&StreamConfig) -> Result<Box<dyn ContainerWriter>, WriterError> + Send + Sync + 'static,
{
    fn make_writer(&self, stream: &StreamConfig) -> Result<Box<dyn ContainerWriter>, WriterError> {
        (self)(stream)
    }
}
