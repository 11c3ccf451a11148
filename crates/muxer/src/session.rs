use std::{sync::Arc, thread::JoinHandle, time::Duration};
use tracing::*;

use crate::{
    bridge::{MediaPipeline, MuxerEvent, NameCache, SessionCallbacks, StreamHandle},
    cell::{Frame, PoolKind},
    config::{ConfigError, SessionAttr},
    worker::{MuxerWorker, StreamStats, WorkerShared},
    writer::{WriterError, WriterFactory},
};

/// Application-provided capabilities a session is wired to.
#[derive(Clone)]
pub struct SessionContext {
    pub callbacks: Arc<dyn SessionCallbacks>,
    pub pipeline: Arc<dyn MediaPipeline>,
    pub writers: Arc<dyn WriterFactory>,
}

impl SessionContext {
    pub fn new(
        callbacks: Arc<dyn SessionCallbacks>,
        pipeline: Arc<dyn MediaPipeline>,
        writers: Arc<dyn WriterFactory>,
    ) -> Self {
        Self {
            callbacks,
            pipeline,
            writers,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Config/{0}")]
    Config(#[from] ConfigError),
    #[error("Stream '{stream}': failed to create writer: {source}")]
    Writer {
        stream: String,
        #[source]
        source: WriterError,
    },
    #[error("Failed to spawn muxer thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("{0} muxer thread(s) panicked")]
    WorkerPanicked(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("No stream reads from channel {0}")]
    UnknownStream(u32),
    #[error("Stream is not recording")]
    StreamDisabled,
    #[error("Stream has no audio track")]
    NoAudioTrack,
    #[error("No free {pool:?} cell after {waited:?}")]
    PoolExhausted { pool: PoolKind, waited: Duration },
    #[error("Thumbnail pool is full")]
    ThumbnailPoolFull,
}

struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

/// Producer-side handle that can be cloned into capture threads.
#[derive(Clone)]
pub struct SessionSink {
    camera_id: u32,
    workers: Arc<[Arc<WorkerShared>]>,
}

impl SessionSink {
    pub fn camera_id(&self) -> u32 {
        self.camera_id
    }

    fn stream_for(&self, channel_id: u32) -> Result<&Arc<WorkerShared>, SubmitError> {
        self.workers
            .iter()
            .find(|w| w.handle.channel_id == channel_id)
            .ok_or(SubmitError::UnknownStream(channel_id))
    }

    /// Queues one encoded video frame for the stream fed by `channel_id`.
    ///
    /// Blocks while the stream's video pool is exhausted, up to the configured
    /// acquire timeout. Frames for a stream that is not recording are refused.
    pub fn write_video_frame(
        &self,
        channel_id: u32,
        data: &[u8],
        pts: i64,
        key_frame: bool,
    ) -> Result<(), SubmitError> {
        let worker = self.stream_for(channel_id)?;
        if !worker.is_enabled() {
            return Err(SubmitError::StreamDisabled);
        }

        worker.push_video(Frame::video(data, pts, key_frame))
    }

    /// Copies one audio frame into every recording stream that carries audio.
    ///
    /// Returns how many streams accepted it.
    pub fn write_audio_frame(&self, data: &[u8], pts: i64) -> usize {
        let mut accepted = 0;

        for worker in self.workers.iter() {
            if !worker.has_audio() || !worker.is_enabled() {
                continue;
            }

            match worker.push_audio(Frame::audio(data, pts)) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    debug!(stream = %worker.config.name, pts, "Audio frame refused: {e}");
                }
            }
        }

        accepted
    }

    /// Offers a preview snapshot to every recording stream. Never blocks.
    ///
    /// Returns how many streams accepted it.
    pub fn send_thumbnail(&self, data: &[u8], pts: i64) -> usize {
        self.workers
            .iter()
            .filter(|worker| worker.is_enabled())
            .filter(|worker| worker.push_thumbnail(Frame::video(data, pts, false)).is_ok())
            .count()
    }

    pub fn stats(&self) -> Vec<StreamStats> {
        self.workers.iter().map(|w| w.stats()).collect()
    }
}

/// One camera's recording session: a muxer thread per configured stream.
pub struct Session {
    camera_id: u32,
    callbacks: Arc<dyn SessionCallbacks>,
    workers: Vec<WorkerHandle>,
    sink: SessionSink,
}

impl Session {
    /// Spawns one worker per stream. Either every worker starts or none is left running.
    ///
    /// Streams start disabled; call [`Session::start`] to begin recording.
    pub fn create(attr: SessionAttr, ctx: SessionContext) -> Result<Self, SessionError> {
        attr.validate()?;

        let camera_id = attr.camera_id;
        let names = Arc::new(NameCache::new(camera_id, attr.streams.len()));
        let mut workers: Vec<WorkerHandle> = Vec::with_capacity(attr.streams.len());

        for (index, config) in attr.streams.into_iter().enumerate() {
            let handle = StreamHandle {
                camera_id,
                index,
                channel_id: config.channel_id,
            };

            let spawned = ctx
                .writers
                .make_writer(&config)
                .map_err(|source| SessionError::Writer {
                    stream: config.name.clone(),
                    source,
                })
                .and_then(|writer| {
                    let thread_name = format!("muxer-{camera_id}-{}", config.name);
                    let (shared, wake_rx) = WorkerShared::new(handle, config);
                    let worker = MuxerWorker::new(
                        shared.clone(),
                        ctx.callbacks.clone(),
                        ctx.pipeline.clone(),
                        names.clone(),
                        writer,
                    );

                    std::thread::Builder::new()
                        .name(thread_name)
                        .spawn(move || worker.run(wake_rx))
                        .map(|thread| WorkerHandle {
                            shared,
                            thread: Some(thread),
                        })
                        .map_err(SessionError::Spawn)
                });

            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    error!(camera = camera_id, index, "Failed to create stream: {e}");
                    shutdown_workers(&mut workers);
                    return Err(e);
                }
            }
        }

        info!(camera = camera_id, streams = workers.len(), "Created session");

        let sink = SessionSink {
            camera_id,
            workers: workers.iter().map(|w| w.shared.clone()).collect(),
        };

        Ok(Self {
            camera_id,
            callbacks: ctx.callbacks,
            workers,
            sink,
        })
    }

    pub fn camera_id(&self) -> u32 {
        self.camera_id
    }

    pub fn sink(&self) -> SessionSink {
        self.sink.clone()
    }

    /// Enables every stream. Files open at the next key frame of each stream.
    pub fn start(&self) {
        info!(camera = self.camera_id, "Starting recording");
        for worker in &self.workers {
            worker.shared.set_enabled(true);
            self.callbacks
                .on_event(worker.shared.handle, MuxerEvent::StreamStart);
        }
    }

    /// Disables every stream. Open files are finalized asynchronously by their workers.
    pub fn stop(&self) {
        info!(camera = self.camera_id, "Stopping recording");
        for worker in &self.workers {
            worker.shared.set_enabled(false);
            self.callbacks
                .on_event(worker.shared.handle, MuxerEvent::StreamStop);
        }
    }

    pub fn write_video_frame(
        &self,
        channel_id: u32,
        data: &[u8],
        pts: i64,
        key_frame: bool,
    ) -> Result<(), SubmitError> {
        self.sink.write_video_frame(channel_id, data, pts, key_frame)
    }

    pub fn write_audio_frame(&self, data: &[u8], pts: i64) -> usize {
        self.sink.write_audio_frame(data, pts)
    }

    pub fn send_thumbnail(&self, data: &[u8], pts: i64) -> usize {
        self.sink.send_thumbnail(data, pts)
    }

    pub fn stats(&self) -> Vec<StreamStats> {
        self.sink.stats()
    }

    /// Stops every worker, waiting for open files to be finalized.
    pub fn destroy(mut self) -> Result<(), SessionError> {
        let panicked = shutdown_workers(&mut self.workers);
        info!(camera = self.camera_id, "Destroyed session");

        if panicked > 0 {
            return Err(SessionError::WorkerPanicked(panicked));
        }

        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.workers.iter().any(|w| w.thread.is_some()) {
            let panicked = shutdown_workers(&mut self.workers);
            if panicked > 0 {
                error!(camera = self.camera_id, panicked, "Muxer threads panicked");
            }
        }
    }
}

/// Signals every worker, then joins them. Returns how many panicked.
fn shutdown_workers(workers: &mut [WorkerHandle]) -> usize {
    for worker in workers.iter() {
        worker.shared.request_shutdown();
    }

    let mut panicked = 0;
    for worker in workers.iter_mut() {
        let Some(thread) = worker.thread.take() else {
            continue;
        };

        if thread.join().is_err() {
            error!(stream = %worker.shared.config.name, "Muxer thread panicked");
            panicked += 1;
        }
    }

    panicked
}
