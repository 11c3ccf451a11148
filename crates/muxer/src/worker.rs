use flume::RecvTimeoutError;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::*;

use crate::{
    bridge::{MediaPipeline, MuxerEvent, NameCache, SessionCallbacks, StreamHandle},
    cell::{Frame, PoolKind, PoolStats},
    config::StreamConfig,
    queue::Lane,
    session::SubmitError,
    split::SplitPolicy,
    thumbnail::ThumbnailBox,
    writer::ContainerWriter,
};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const ACQUIRE_LOG_EVERY: u32 = 100;
/// Minimum pts distance between two key frame requests while waiting to open a file.
const KEY_FRAME_RETRY_US: i64 = 1_000_000;
const WRITE_ERROR_LOG_EVERY: u64 = 100;

/// State shared between a worker thread and the producers feeding it.
pub(crate) struct WorkerShared {
    pub handle: StreamHandle,
    pub config: StreamConfig,
    video: Mutex<Lane>,
    audio: Option<Mutex<Lane>>,
    thumbnails: Mutex<Lane>,
    enabled: AtomicBool,
    shutdown: AtomicBool,
    /// Bumped by every stop, so a stop/start pair between two wakes is still seen.
    stop_generation: AtomicU64,
    wake_tx: flume::Sender<()>,
    files_completed: AtomicU64,
    frames_written: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub name: String,
    pub channel_id: u32,
    pub enabled: bool,
    pub video: PoolStats,
    pub audio: Option<PoolStats>,
    pub thumbnail: PoolStats,
    pub files_completed: u64,
    pub frames_written: u64,
}

impl WorkerShared {
    pub fn new(handle: StreamHandle, config: StreamConfig) -> (Arc<Self>, flume::Receiver<()>) {
        // capacity 1 makes the channel a binary wake signal
        let (wake_tx, wake_rx) = flume::bounded(1);
        let pools = &config.pools;

        let shared = Self {
            handle,
            video: Mutex::new(Lane::new(PoolKind::Video, pools.video_cells)),
            audio: config
                .audio
                .map(|_| Mutex::new(Lane::new(PoolKind::Audio, pools.audio_cells))),
            thumbnails: Mutex::new(Lane::new(PoolKind::Thumbnail, pools.thumbnail_cells)),
            enabled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            stop_generation: AtomicU64::new(0),
            wake_tx,
            files_completed: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            config,
        };

        (Arc::new(shared), wake_rx)
    }

    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.is_shutdown()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn stop_generation(&self) -> u64 {
        self.stop_generation.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if !enabled {
            self.stop_generation.fetch_add(1, Ordering::AcqRel);
        }
        self.enabled.store(enabled, Ordering::Release);
        self.wake();
    }

    pub fn request_shutdown(&self) {
        self.stop_generation.fetch_add(1, Ordering::AcqRel);
        self.enabled.store(false, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn push_video(&self, frame: Frame) -> Result<(), SubmitError> {
        self.push_blocking(&self.video, frame)
    }

    pub fn push_audio(&self, frame: Frame) -> Result<(), SubmitError> {
        let lane = self.audio.as_ref().ok_or(SubmitError::NoAudioTrack)?;
        self.push_blocking(lane, frame)
    }

    /// Thumbnails never wait for a cell. A full pool drops the candidate.
    pub fn push_thumbnail(&self, frame: Frame) -> Result<(), SubmitError> {
        let pts = frame.pts;
        let mut lane = self.thumbnails.lock();
        // checked under the lane lock so nothing lands after the worker's final drain
        if !self.is_enabled() {
            return Err(SubmitError::StreamDisabled);
        }
        let pushed = lane.push(frame).is_ok();
        drop(lane);

        if !pushed {
            warn!(
                stream = %self.config.name,
                pts,
                "Thumbnail pool full, dropping snapshot"
            );
            return Err(SubmitError::ThumbnailPoolFull);
        }

        self.wake();
        Ok(())
    }

    fn push_blocking(&self, lane: &Mutex<Lane>, mut frame: Frame) -> Result<(), SubmitError> {
        let started = Instant::now();
        let timeout = self.config.pools.acquire_timeout();
        let mut attempts = 0u32;

        loop {
            let kind = {
                let mut guard = lane.lock();
                if !self.is_enabled() {
                    return Err(SubmitError::StreamDisabled);
                }

                match guard.push(frame) {
                    Ok(()) => {
                        drop(guard);
                        self.wake();
                        return Ok(());
                    }
                    Err(rejected) => frame = rejected,
                }

                if attempts == 0 && self.config.pools.drop_non_key_on_overflow {
                    if guard.drop_one_non_key_frame() {
                        warn!(
                            stream = %self.config.name,
                            pts = frame.pts,
                            "Video pool full, dropped a queued non-key frame"
                        );
                        continue;
                    }

                    if guard.kind() == PoolKind::Video {
                        error!(
                            stream = %self.config.name,
                            pts = frame.pts,
                            "Video pool full and no non-key frame to drop"
                        );
                    }
                }

                guard.kind()
            };

            attempts += 1;

            let waited = started.elapsed();
            if waited >= timeout {
                error!(
                    stream = %self.config.name,
                    pool = ?kind,
                    attempts,
                    "Gave up waiting for a free cell after {waited:?}"
                );
                return Err(SubmitError::PoolExhausted { pool: kind, waited });
            }

            if attempts % ACQUIRE_LOG_EVERY == 0 {
                warn!(
                    stream = %self.config.name,
                    pool = ?kind,
                    attempts,
                    "Waiting for a free cell"
                );
            }

            self.wake();
            std::thread::sleep(ACQUIRE_POLL_INTERVAL);
        }
    }

    fn discard_pending(&self) -> usize {
        let mut discarded = self.video.lock().drain_to_free_pool();
        if let Some(audio) = &self.audio {
            discarded += audio.lock().drain_to_free_pool();
        }
        discarded + self.thumbnails.lock().drain_to_free_pool()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            name: self.config.name.clone(),
            channel_id: self.handle.channel_id,
            enabled: self.is_enabled(),
            video: self.video.lock().stats(),
            audio: self.audio.as_ref().map(|lane| lane.lock().stats()),
            thumbnail: self.thumbnails.lock().stats(),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
        }
    }
}

struct OpenFile {
    path: PathBuf,
    write_path: PathBuf,
    /// Stop generation the file was opened under.
    generation: u64,
    started_at: i64,
    last_video_pts: i64,
    frame_count: u64,
    thumbnail_requested: bool,
    thumbnail: Option<Vec<u8>>,
    write_errors: u64,
}

/// Closing is not a resting state: [`MuxerWorker::finalize`] consumes the
/// [`OpenFile`] and the worker is Idle once it returns.
enum WorkerState {
    Idle,
    Open(OpenFile),
    Stopped,
}

enum Pending {
    Video(Frame),
    Audio(Frame),
}

/// Suffix carried by the first stream's file until it is finalized.
pub const IN_PROGRESS_SUFFIX: &str = "part";

pub fn in_progress_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(IN_PROGRESS_SUFFIX);
    PathBuf::from(name)
}

pub(crate) struct MuxerWorker {
    shared: Arc<WorkerShared>,
    callbacks: Arc<dyn SessionCallbacks>,
    pipeline: Arc<dyn MediaPipeline>,
    names: Arc<NameCache>,
    writer: Box<dyn ContainerWriter>,
    policy: SplitPolicy,
    state: WorkerState,
    key_frame_requested_at: Option<i64>,
}

impl MuxerWorker {
    pub fn new(
        shared: Arc<WorkerShared>,
        callbacks: Arc<dyn SessionCallbacks>,
        pipeline: Arc<dyn MediaPipeline>,
        names: Arc<NameCache>,
        writer: Box<dyn ContainerWriter>,
    ) -> Self {
        let policy = SplitPolicy::new(shared.config.split_duration_secs, &shared.config.video);

        Self {
            shared,
            callbacks,
            pipeline,
            names,
            writer,
            policy,
            state: WorkerState::Idle,
            key_frame_requested_at: None,
        }
    }

    pub fn run(mut self, wake_rx: flume::Receiver<()>) {
        let span = info_span!(
            "muxer",
            camera = self.shared.handle.camera_id,
            stream = %self.shared.config.name,
            channel = self.shared.handle.channel_id,
        );
        let _enter = span.enter();

        info!(
            split_secs = self.shared.config.split_duration_secs,
            thumbnail_at_frame = self.policy.thumbnail_at_frame(),
            "Muxer worker started"
        );

        let wait = self.shared.config.split_duration();

        while !matches!(self.state, WorkerState::Stopped) {
            match wake_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.shared.request_shutdown(),
            }

            self.step();
        }

        info!("Muxer worker stopped");
    }

    fn step(&mut self) {
        let enabled = self.shared.is_enabled();

        if enabled {
            self.close_if_stopped();
        }

        self.process_pending(enabled);

        if enabled {
            return;
        }

        self.close_current();

        let discarded = self.shared.discard_pending();
        if discarded > 0 {
            debug!(discarded, "Discarded frames queued while disabled");
        }

        if self.shared.is_shutdown() {
            self.state = WorkerState::Stopped;
        }
    }

    fn process_pending(&mut self, enabled: bool) {
        while let Some(pending) = self.next_frame() {
            // a disabled step writes what was queued before the stop, then closes
            if enabled {
                self.close_if_stopped();
            }

            match pending {
                Pending::Video(frame) => self.on_video(frame, enabled),
                Pending::Audio(frame) => self.on_audio(frame),
            }

            self.collect_thumbnail();
        }

        self.collect_thumbnail();
    }

    /// Picks whichever of the video and audio heads is earlier. Video wins ties.
    ///
    /// Both lanes are held together, always video first, so an audio frame is never
    /// seen ahead of a video frame queued before it.
    fn next_frame(&self) -> Option<Pending> {
        let mut video = self.shared.video.lock();
        let mut audio = self.shared.audio.as_ref().map(|lane| lane.lock());

        let video_pts = video.peek_pts();
        let audio_pts = audio.as_ref().and_then(|lane| lane.peek_pts());

        match (video_pts, audio_pts) {
            (Some(v), Some(a)) if a < v => audio
                .as_mut()
                .and_then(|lane| lane.pop_lowest())
                .map(Pending::Audio),
            (Some(_), _) => video.pop_lowest().map(Pending::Video),
            (None, Some(_)) => audio
                .as_mut()
                .and_then(|lane| lane.pop_lowest())
                .map(Pending::Audio),
            (None, None) => None,
        }
    }

    fn on_video(&mut self, frame: Frame, enabled: bool) {
        self.state = match std::mem::replace(&mut self.state, WorkerState::Idle) {
            WorkerState::Open(file)
                if frame.key_frame
                    && self
                        .policy
                        .split_due(frame.pts.saturating_sub(file.started_at)) =>
            {
                self.finalize(file);
                self.try_open(frame, enabled)
            }
            WorkerState::Open(file) => self.write_video(file, frame),
            WorkerState::Idle => self.try_open(frame, enabled),
            WorkerState::Stopped => WorkerState::Stopped,
        };
    }

    fn on_audio(&mut self, frame: Frame) {
        let WorkerState::Open(file) = &mut self.state else {
            return;
        };

        if let Err(e) = self.writer.write_audio_frame(&frame.data, frame.pts) {
            file.write_errors += 1;
            if file.write_errors % WRITE_ERROR_LOG_EVERY == 1 {
                warn!(
                    pts = frame.pts,
                    errors = file.write_errors,
                    "Failed to write audio frame: {e}"
                );
            }
        }
    }

    fn try_open(&mut self, frame: Frame, enabled: bool) -> WorkerState {
        // read before the live flag so a stop racing the open is caught by close_if_stopped
        let generation = self.shared.stop_generation();
        if !enabled || !self.shared.is_enabled() {
            return WorkerState::Idle;
        }

        if !frame.key_frame {
            self.request_key_frame(frame.pts);
            return WorkerState::Idle;
        }

        match self.open_file(&frame, generation) {
            Some(file) => self.write_video(file, frame),
            None => WorkerState::Idle,
        }
    }

    fn request_key_frame(&mut self, pts: i64) {
        let due = self
            .key_frame_requested_at
            .is_none_or(|at| pts < at || pts.saturating_sub(at) >= KEY_FRAME_RETRY_US);
        if !due {
            return;
        }

        self.key_frame_requested_at = Some(pts);
        debug!(pts, "No open file, requesting key frame");
        self.pipeline.request_key_frame(self.shared.handle.channel_id);
    }

    fn open_file(&mut self, frame: &Frame, generation: u64) -> Option<OpenFile> {
        let handle = self.shared.handle;

        let path = match self.names.next_path(self.callbacks.as_ref(), handle.index) {
            Ok(path) => path,
            Err(e) => {
                error!(pts = frame.pts, "Failed to get output file name: {e}");
                return None;
            }
        };

        let write_path = if handle.index == 0 {
            in_progress_path(&path)
        } else {
            path.clone()
        };

        let config = &self.shared.config;
        if let Err(e) = self.writer.init(
            config.format,
            &write_path,
            &config.video,
            config.audio.as_ref(),
        ) {
            error!(path = %write_path.display(), "Failed to open output file: {e}");
            return None;
        }

        info!(path = %path.display(), pts = frame.pts, "Opened output file");

        self.key_frame_requested_at = None;
        self.callbacks.on_event(
            handle,
            MuxerEvent::FileBegin { path: path.clone() },
        );

        Some(OpenFile {
            path,
            write_path,
            generation,
            started_at: frame.pts,
            last_video_pts: frame.pts,
            frame_count: 0,
            thumbnail_requested: false,
            thumbnail: None,
            write_errors: 0,
        })
    }

    fn write_video(&mut self, mut file: OpenFile, frame: Frame) -> WorkerState {
        match self
            .writer
            .write_video_frame(&frame.data, frame.pts, frame.key_frame)
        {
            Ok(()) => {
                self.shared.frames_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                file.write_errors += 1;
                if file.write_errors % WRITE_ERROR_LOG_EVERY == 1 {
                    warn!(
                        pts = frame.pts,
                        errors = file.write_errors,
                        "Failed to write video frame: {e}"
                    );
                }
            }
        }

        file.frame_count += 1;
        file.last_video_pts = frame.pts;

        if !file.thumbnail_requested && self.policy.thumbnail_due(file.frame_count) {
            file.thumbnail_requested = true;
            debug!(frame = file.frame_count, "Requesting thumbnail snapshot");
            self.pipeline.request_thumbnail(self.shared.handle.channel_id);
        }

        WorkerState::Open(file)
    }

    /// Latches the first snapshot that arrives while a file is open. Anything else is discarded.
    fn collect_thumbnail(&mut self) {
        let mut lane = self.shared.thumbnails.lock();
        if lane.is_empty() {
            return;
        }

        if let WorkerState::Open(file) = &mut self.state
            && file.thumbnail.is_none()
            && let Some(frame) = lane.pop_lowest()
        {
            trace!(pts = frame.pts, bytes = frame.data.len(), "Captured thumbnail");
            file.thumbnail = Some(frame.data);
        }

        let dropped = lane.drain_to_free_pool();
        if dropped > 0 {
            trace!(dropped, "Discarded surplus thumbnails");
        }
    }

    /// Finalizes a file opened before a stop this worker has not acted on yet.
    fn close_if_stopped(&mut self) {
        let generation = self.shared.stop_generation();
        if let WorkerState::Open(file) = &self.state
            && file.generation != generation
        {
            debug!(
                opened_under = file.generation,
                generation, "Stream was stopped since the file opened"
            );
            self.close_current();
        }
    }

    fn close_current(&mut self) {
        if let WorkerState::Open(file) = std::mem::replace(&mut self.state, WorkerState::Idle) {
            self.finalize(file);
        }
    }

    fn finalize(&mut self, mut file: OpenFile) {
        if file.thumbnail.is_none() {
            file.thumbnail = self.shared.thumbnails.lock().pop_lowest().map(|f| f.data);
        }

        if let Some(payload) = file.thumbnail.take() {
            let thumbnail = ThumbnailBox::new(self.shared.config.thumbnail, payload);
            match thumbnail.encode() {
                Ok(bytes) => match self.writer.append_trailer(&bytes) {
                    Ok(()) => debug!(bytes = bytes.len(), "Embedded thumbnail"),
                    Err(e) => warn!("Failed to embed thumbnail: {e}"),
                },
                Err(e) => warn!("Failed to encode thumbnail: {e}"),
            }
        }

        if let Err(e) = self.writer.deinit() {
            error!(path = %file.write_path.display(), "Failed to finalize output file: {e}");
        }

        if file.write_path != file.path
            && file.write_path.exists()
            && let Err(e) = std::fs::rename(&file.write_path, &file.path)
        {
            error!("Failed to mark {} complete: {e}", file.path.display());
        }

        let duration_ms = self.policy.file_duration_ms(
            file.started_at,
            file.last_video_pts,
            file.frame_count,
        );

        self.shared.files_completed.fetch_add(1, Ordering::Relaxed);

        info!(
            path = %file.path.display(),
            duration_ms,
            frames = file.frame_count,
            "Closed output file"
        );

        self.callbacks.on_event(
            self.shared.handle,
            MuxerEvent::FileEnd {
                path: file.path,
                duration_ms,
            },
        );
    }
}
