//! Capabilities the session calls out to: file naming, lifecycle events and
//! requests back into the capture pipeline.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use tracing::*;

/// Identifies one worker of one session in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHandle {
    pub camera_id: u32,
    /// Position of the stream in the session's configuration.
    pub index: usize,
    pub channel_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MuxerEvent {
    StreamStart,
    StreamStop,
    FileBegin { path: PathBuf },
    FileEnd { path: PathBuf, duration_ms: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("No file names returned")]
    NoPaths,
    #[error("Expected {expected} file names, got {got}")]
    Short { expected: usize, got: usize },
    #[error("{0}")]
    Other(String),
}

/// Naming and event sink supplied by the application.
///
/// Both methods are called synchronously from worker threads.
pub trait SessionCallbacks: Send + Sync + 'static {
    /// Returns one output path per configured stream, in configuration order.
    fn request_file_names(
        &self,
        camera_id: u32,
        stream_count: usize,
    ) -> Result<Vec<PathBuf>, CallbackError>;

    fn on_event(&self, stream: StreamHandle, event: MuxerEvent);
}

/// Fire-and-forget requests into the hardware capture pipeline.
pub trait MediaPipeline: Send + Sync + 'static {
    fn request_key_frame(&self, channel_id: u32);

    /// The snapshot arrives later through [`crate::SessionSink::send_thumbnail`].
    fn request_thumbnail(&self, channel_id: u32);
}

/// Pipeline that ignores every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPipeline;

impl MediaPipeline for NoopPipeline {
    fn request_key_frame(&self, _: u32) {}

    fn request_thumbnail(&self, _: u32) {}
}

/// Caches one batch of names per recording cycle so each worker consumes its own slot
/// and the callback runs once per cycle rather than once per worker.
pub(crate) struct NameCache {
    camera_id: u32,
    slots: Mutex<Vec<Option<PathBuf>>>,
}

impl NameCache {
    pub fn new(camera_id: u32, stream_count: usize) -> Self {
        Self {
            camera_id,
            slots: Mutex::new(vec![None; stream_count]),
        }
    }

    pub fn next_path(
        &self,
        callbacks: &dyn SessionCallbacks,
        index: usize,
    ) -> Result<PathBuf, CallbackError> {
        let mut slots = self.slots.lock();

        if let Some(path) = slots.get_mut(index).and_then(Option::take) {
            return Ok(path);
        }

        let expected = slots.len();
        let paths = callbacks.request_file_names(self.camera_id, expected)?;
        if paths.is_empty() {
            return Err(CallbackError::NoPaths);
        }
        if paths.len() < expected {
            return Err(CallbackError::Short {
                expected,
                got: paths.len(),
            });
        }

        debug!(camera = self.camera_id, count = paths.len(), "Fetched file names");

        for (slot, path) in slots.iter_mut().zip(paths) {
            *slot = Some(path);
        }

        slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(CallbackError::NoPaths)
    }
}
