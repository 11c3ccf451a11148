use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{Context, anyhow};
use camrec_muxer::{
    CallbackError, ContainerWriter, EsFileWriter, MediaPipeline, MuxerEvent, Session, SessionAttr,
    SessionCallbacks, SessionContext, SessionSink, StreamConfig, StreamHandle, WriterError,
    WriterFactory,
    media_info::{AudioParams, MICROS_PER_SEC, ThumbnailKind, ThumbnailParams},
};
use clap::Args;
use tracing::*;

/// Samples per MPEG-1 layer II audio frame.
const SAMPLES_PER_AUDIO_FRAME: i64 = 1152;

#[derive(Args)]
pub struct RecordArgs {
    /// Session config as JSON. Uses the sample config when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory to write recordings to
    #[arg(long)]
    output: PathBuf,
    /// How long to record for
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Mux into real containers with FFmpeg instead of raw elementary streams
    #[cfg(feature = "ffmpeg")]
    #[arg(long)]
    ffmpeg: bool,
}

impl RecordArgs {
    pub fn run(self) -> anyhow::Result<()> {
        let attr = match &self.config {
            Some(path) => SessionAttr::load(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?,
            None => SessionAttr::sample(0),
        };

        std::fs::create_dir_all(&self.output)
            .with_context(|| format!("Failed to create '{}'", self.output.display()))?;

        let streams = attr.streams.clone();
        let pipeline = Arc::new(SyntheticPipeline::new(&streams));
        let ctx = SessionContext::new(
            Arc::new(DirectoryNamer::new(&self.output, &attr)),
            pipeline.clone(),
            self.writer_factory(),
        );

        let session = Session::create(attr, ctx)?;
        let sink = session.sink();
        pipeline.attach(sink.clone());

        session.start();

        let started = Instant::now();
        let until = started + Duration::from_secs(self.seconds);

        let mut producers = streams
            .iter()
            .map(|stream| {
                let sink = sink.clone();
                let pipeline = pipeline.clone();
                let stream = stream.clone();
                std::thread::Builder::new()
                    .name(format!("producer-{}", stream.name))
                    .spawn(move || produce_video(&sink, &pipeline, &stream, started, until))
            })
            .collect::<Result<Vec<JoinHandle<u64>>, _>>()?;

        if let Some(audio) = streams.iter().find_map(|s| s.audio) {
            let sink = sink.clone();
            producers.push(
                std::thread::Builder::new()
                    .name("producer-audio".to_string())
                    .spawn(move || produce_audio(&sink, &audio, started, until))?,
            );
        }

        info!(seconds = self.seconds, "Recording synthetic streams");

        for producer in producers {
            let frames = producer
                .join()
                .map_err(|_| anyhow!("Producer thread panicked"))?;
            debug!(frames, "Producer finished");
        }

        session.stop();
        session.destroy()?;

        let stats = sink.stats();
        println!("{}", serde_json::to_string_pretty(&stats)?);

        Ok(())
    }

    fn writer_factory(&self) -> Arc<dyn WriterFactory> {
        #[cfg(feature = "ffmpeg")]
        {
            if self.ffmpeg {
                return Arc::new(
                    |_: &StreamConfig| -> Result<Box<dyn ContainerWriter>, WriterError> {
                        Ok(Box::new(camrec_muxer::writer::FfmpegWriter::new()?))
                    },
                );
            }
        }

        Arc::new(
            |_: &StreamConfig| -> Result<Box<dyn ContainerWriter>, WriterError> {
                Ok(Box::new(EsFileWriter::new()))
            },
        )
    }
}

/// Names files `<dir>/<camera>_<stream>_<sequence>.<ext>` and prints events as JSON lines.
struct DirectoryNamer {
    dir: PathBuf,
    streams: Vec<(String, &'static str)>,
    sequence: AtomicU32,
}

impl DirectoryNamer {
    fn new(dir: &Path, attr: &SessionAttr) -> Self {
        Self {
            dir: dir.to_path_buf(),
            streams: attr
                .streams
                .iter()
                .map(|s| (s.name.clone(), s.format.extension()))
                .collect(),
            sequence: AtomicU32::new(0),
        }
    }
}

impl SessionCallbacks for DirectoryNamer {
    fn request_file_names(
        &self,
        camera_id: u32,
        stream_count: usize,
    ) -> Result<Vec<PathBuf>, CallbackError> {
        if stream_count != self.streams.len() {
            return Err(CallbackError::Other(format!(
                "Asked for {stream_count} names, configured {}",
                self.streams.len()
            )));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .streams
            .iter()
            .map(|(name, ext)| {
                self.dir
                    .join(format!("{camera_id}_{name}_{sequence:04}.{ext}"))
            })
            .collect())
    }

    fn on_event(&self, stream: StreamHandle, event: MuxerEvent) {
        let line = serde_json::json!({ "stream": stream, "event": event });
        match serde_json::to_string(&line) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Failed to serialize event: {e}"),
        }
    }
}

/// Stands in for the hardware encoder: honours key frame requests and answers
/// thumbnail requests with a generated snapshot.
struct SyntheticPipeline {
    key_frame_requests: HashMap<u32, AtomicBool>,
    thumbnails: HashMap<u32, ThumbnailParams>,
    sink: OnceLock<SessionSink>,
    started: Instant,
}

impl SyntheticPipeline {
    fn new(streams: &[StreamConfig]) -> Self {
        Self {
            key_frame_requests: streams
                .iter()
                .map(|s| (s.channel_id, AtomicBool::new(false)))
                .collect(),
            thumbnails: streams.iter().map(|s| (s.channel_id, s.thumbnail)).collect(),
            sink: OnceLock::new(),
            started: Instant::now(),
        }
    }

    fn attach(&self, sink: SessionSink) {
        let _ = self.sink.set(sink);
    }

    fn take_key_frame_request(&self, channel_id: u32) -> bool {
        self.key_frame_requests
            .get(&channel_id)
            .is_some_and(|requested| requested.swap(false, Ordering::Relaxed))
    }
}

impl MediaPipeline for SyntheticPipeline {
    fn request_key_frame(&self, channel_id: u32) {
        if let Some(requested) = self.key_frame_requests.get(&channel_id) {
            requested.store(true, Ordering::Relaxed);
        }
    }

    fn request_thumbnail(&self, channel_id: u32) {
        let (Some(sink), Some(params)) = (self.sink.get(), self.thumbnails.get(&channel_id))
        else {
            return;
        };

        let pts = self.started.elapsed().as_micros() as i64;
        let accepted = sink.send_thumbnail(&synthetic_snapshot(params), pts);
        debug!(channel = channel_id, accepted, "Answered thumbnail request");
    }
}

fn synthetic_snapshot(params: &ThumbnailParams) -> Vec<u8> {
    match params.kind {
        // SOI, a comment segment with the geometry, EOI
        ThumbnailKind::Jpeg => {
            let comment = format!("{}x{}", params.width, params.height);
            let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xFE, 0x00, comment.len() as u8 + 2];
            jpeg.extend_from_slice(comment.as_bytes());
            jpeg.extend_from_slice(&[0xFF, 0xD9]);
            jpeg
        }
        ThumbnailKind::Nv12 => {
            let luma = (params.width * params.height) as usize;
            let mut nv12 = vec![0x10; luma];
            nv12.resize(luma + luma / 2, 0x80);
            nv12
        }
    }
}

fn sleep_until(deadline: Instant) {
    let wait = deadline.saturating_duration_since(Instant::now());
    if !wait.is_zero() {
        std::thread::sleep(wait);
    }
}

fn produce_video(
    sink: &SessionSink,
    pipeline: &SyntheticPipeline,
    stream: &StreamConfig,
    started: Instant,
    until: Instant,
) -> u64 {
    let interval_us = stream.video.frame_interval_us();
    let gop = u64::from(stream.video.gop.max(1));
    let mut frame = 0u64;

    loop {
        let pts = frame as i64 * interval_us;
        let due = started + Duration::from_micros(pts as u64);
        if due >= until {
            break;
        }
        sleep_until(due);

        let key_frame =
            frame % gop == 0 || pipeline.take_key_frame_request(stream.channel_id);

        // Annex B start code followed by an IDR or non-IDR slice header byte
        let mut access_unit = vec![0, 0, 0, 1, if key_frame { 0x65 } else { 0x41 }];
        access_unit.extend_from_slice(&frame.to_be_bytes());

        if let Err(e) = sink.write_video_frame(stream.channel_id, &access_unit, pts, key_frame) {
            warn!(stream = %stream.name, pts, "Video frame refused: {e}");
        }

        frame += 1;
    }

    frame
}

fn produce_audio(sink: &SessionSink, audio: &AudioParams, started: Instant, until: Instant) -> u64 {
    let interval_us = SAMPLES_PER_AUDIO_FRAME * MICROS_PER_SEC / i64::from(audio.sample_rate);
    let frame_len =
        (i64::from(audio.bitrate_kbps) * 1000 / 8 * SAMPLES_PER_AUDIO_FRAME
            / i64::from(audio.sample_rate))
        .max(4) as usize;
    let mut frame = 0u64;

    loop {
        let pts = frame as i64 * interval_us;
        let due = started + Duration::from_micros(pts as u64);
        if due >= until {
            break;
        }
        sleep_until(due);

        // frame sync word, the rest is silence
        let mut payload = vec![0u8; frame_len];
        payload[..2].copy_from_slice(&[0xFF, 0xFD]);
        sink.write_audio_frame(&payload, pts);

        frame += 1;
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_camera_stream_sequence() {
        let attr = SessionAttr::sample(3);
        let namer = DirectoryNamer::new(Path::new("/out"), &attr);

        let first = namer.request_file_names(3, 3).unwrap();
        assert_eq!(
            first,
            vec![
                PathBuf::from("/out/3_main_0000.mp4"),
                PathBuf::from("/out/3_sub_0000.mp4"),
                PathBuf::from("/out/3_live_0000.ts"),
            ]
        );

        let second = namer.request_file_names(3, 3).unwrap();
        assert_eq!(second[2], PathBuf::from("/out/3_live_0001.ts"));

        assert!(namer.request_file_names(3, 2).is_err());
    }

    #[test]
    fn snapshots_match_their_kind() {
        let jpeg = synthetic_snapshot(&ThumbnailParams::default());
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

        let nv12 = synthetic_snapshot(&ThumbnailParams {
            kind: ThumbnailKind::Nv12,
            width: 16,
            height: 8,
            ..Default::default()
        });
        assert_eq!(nv12.len(), 16 * 8 * 3 / 2);
    }
}
