#![allow(dead_code)]

use camrec_muxer::{
    CallbackError, ContainerWriter, MediaPipeline, MuxerEvent, SessionAttr, SessionCallbacks,
    SessionContext, SessionSink, StreamConfig, StreamHandle, WriterError, WriterFactory,
    media_info::{AudioParams, ContainerFormat, VideoCodec, VideoParams},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Once, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

pub const FRAME_INTERVAL_US: i64 = 33_333;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::DEBUG.into()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriterCall {
    Init {
        format: ContainerFormat,
        path: PathBuf,
        audio: bool,
    },
    Video {
        pts: i64,
        key_frame: bool,
    },
    Audio {
        pts: i64,
    },
    Trailer(Vec<u8>),
    Deinit,
}

pub type CallLog = Arc<Mutex<Vec<WriterCall>>>;

/// Writer that only records what it was asked to do.
pub struct RecordingWriter {
    log: CallLog,
    failing_inits: Arc<AtomicUsize>,
    gate: Option<flume::Receiver<()>>,
}

impl ContainerWriter for RecordingWriter {
    fn init(
        &mut self,
        format: ContainerFormat,
        path: &Path,
        _: &VideoParams,
        audio: Option<&AudioParams>,
    ) -> Result<(), WriterError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }

        let failing = self
            .failing_inits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WriterError::Io(std::io::Error::other("disk unplugged")));
        }

        self.log.lock().push(WriterCall::Init {
            format,
            path: path.to_path_buf(),
            audio: audio.is_some(),
        });
        Ok(())
    }

    fn write_video_frame(
        &mut self,
        _: &[u8],
        pts: i64,
        key_frame: bool,
    ) -> Result<(), WriterError> {
        self.log.lock().push(WriterCall::Video { pts, key_frame });
        Ok(())
    }

    fn write_audio_frame(&mut self, _: &[u8], pts: i64) -> Result<(), WriterError> {
        self.log.lock().push(WriterCall::Audio { pts });
        Ok(())
    }

    fn append_trailer(&mut self, data: &[u8]) -> Result<(), WriterError> {
        self.log.lock().push(WriterCall::Trailer(data.to_vec()));
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), WriterError> {
        self.log.lock().push(WriterCall::Deinit);
        Ok(())
    }
}

/// Hands out [`RecordingWriter`]s and keeps their logs by stream name.
#[derive(Default)]
pub struct RecordingWriters {
    logs: Mutex<HashMap<String, CallLog>>,
    pub failing_inits: Arc<AtomicUsize>,
    gate: Mutex<Option<flume::Receiver<()>>>,
}

impl RecordingWriters {
    pub fn log(&self, stream: &str) -> Vec<WriterCall> {
        self.logs
            .lock()
            .get(stream)
            .map(|log| log.lock().clone())
            .unwrap_or_default()
    }

    /// Makes the next writer's first `init` block until the returned sender is used or dropped.
    pub fn gate_next_init(&self) -> flume::Sender<()> {
        let (tx, rx) = flume::bounded(1);
        *self.gate.lock() = Some(rx);
        tx
    }
}

impl WriterFactory for RecordingWriters {
    fn make_writer(&self, stream: &StreamConfig) -> Result<Box<dyn ContainerWriter>, WriterError> {
        let log = CallLog::default();
        self.logs.lock().insert(stream.name.clone(), log.clone());

        Ok(Box::new(RecordingWriter {
            log,
            failing_inits: self.failing_inits.clone(),
            gate: self.gate.lock().take(),
        }))
    }
}

pub struct TestCallbacks {
    dir: PathBuf,
    cycles: AtomicUsize,
    events: Mutex<Vec<(StreamHandle, MuxerEvent)>>,
}

impl TestCallbacks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cycles: AtomicUsize::new(0),
            events: Mutex::default(),
        }
    }

    pub fn events(&self) -> Vec<(StreamHandle, MuxerEvent)> {
        self.events.lock().clone()
    }

    pub fn file_ends(&self, index: usize) -> Vec<(PathBuf, u64)> {
        self.events()
            .into_iter()
            .filter(|(handle, _)| handle.index == index)
            .filter_map(|(_, event)| match event {
                MuxerEvent::FileEnd { path, duration_ms } => Some((path, duration_ms)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, kind: fn(&MuxerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|(_, e)| kind(e)).count()
    }

    pub fn name_requests(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }
}

impl SessionCallbacks for TestCallbacks {
    fn request_file_names(
        &self,
        camera_id: u32,
        stream_count: usize,
    ) -> Result<Vec<PathBuf>, CallbackError> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok((0..stream_count)
            .map(|i| self.dir.join(format!("cam{camera_id}_{i}_{cycle:04}.mp4")))
            .collect())
    }

    fn on_event(&self, stream: StreamHandle, event: MuxerEvent) {
        self.events.lock().push((stream, event));
    }
}

/// Pipeline that counts requests and can answer thumbnail requests through a sink.
#[derive(Default)]
pub struct TestPipeline {
    pub key_frame_requests: AtomicUsize,
    pub thumbnail_requests: AtomicUsize,
    sink: OnceLock<SessionSink>,
    snapshots_per_request: usize,
}

impl TestPipeline {
    pub fn answering(snapshots_per_request: usize) -> Self {
        Self {
            snapshots_per_request,
            ..Default::default()
        }
    }

    pub fn attach(&self, sink: SessionSink) {
        let _ = self.sink.set(sink);
    }

    pub fn key_frame_requests(&self) -> usize {
        self.key_frame_requests.load(Ordering::SeqCst)
    }

    pub fn thumbnail_requests(&self) -> usize {
        self.thumbnail_requests.load(Ordering::SeqCst)
    }
}

impl MediaPipeline for TestPipeline {
    fn request_key_frame(&self, _: u32) {
        self.key_frame_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn request_thumbnail(&self, _: u32) {
        let n = self.thumbnail_requests.fetch_add(1, Ordering::SeqCst);

        if let Some(sink) = self.sink.get() {
            for i in 0..self.snapshots_per_request {
                sink.send_thumbnail(format!("snapshot-{n}-{i}").as_bytes(), 0);
            }
        }
    }
}

pub struct Harness {
    pub callbacks: Arc<TestCallbacks>,
    pub pipeline: Arc<TestPipeline>,
    pub writers: Arc<RecordingWriters>,
}

impl Harness {
    pub fn new(dir: impl Into<PathBuf>, pipeline: TestPipeline) -> Self {
        init_tracing();

        Self {
            callbacks: Arc::new(TestCallbacks::new(dir)),
            pipeline: Arc::new(pipeline),
            writers: Arc::new(RecordingWriters::default()),
        }
    }

    pub fn context(&self) -> SessionContext {
        SessionContext::new(
            self.callbacks.clone(),
            self.pipeline.clone(),
            self.writers.clone(),
        )
    }
}

pub fn video_pts(log: &[WriterCall]) -> Vec<i64> {
    log.iter()
        .filter_map(|call| match call {
            WriterCall::Video { pts, .. } => Some(*pts),
            _ => None,
        })
        .collect()
}

/// Splits a writer log into per-file slices, from each `Init` through its `Deinit`.
pub fn files(log: &[WriterCall]) -> Vec<&[WriterCall]> {
    let mut files = vec![];
    let mut start = None;

    for (i, call) in log.iter().enumerate() {
        match call {
            WriterCall::Init { .. } => start = Some(i),
            WriterCall::Deinit => {
                if let Some(s) = start.take() {
                    files.push(&log[s..=i]);
                }
            }
            _ => {}
        }
    }

    files
}

pub fn stream(name: &str, channel_id: u32) -> StreamConfig {
    StreamConfig::new(
        name,
        channel_id,
        VideoParams::new(VideoCodec::H264, 1920, 1080, 30, 30),
    )
}

pub fn session_of(streams: Vec<StreamConfig>) -> SessionAttr {
    SessionAttr {
        camera_id: 0,
        streams,
    }
}

/// Submits frames `range` at 30fps with a key frame every 30 frames.
pub fn push_frames(sink: &SessionSink, channel_id: u32, range: std::ops::Range<i64>) {
    for i in range {
        sink.write_video_frame(channel_id, &[0, 0, 0, 1], i * FRAME_INTERVAL_US, i % 30 == 0)
            .unwrap();
    }
}

pub fn frames_written(sink: &SessionSink, index: usize) -> u64 {
    sink.stats()[index].frames_written
}

pub fn files_completed(sink: &SessionSink, index: usize) -> u64 {
    sink.stats()[index].files_completed
}
