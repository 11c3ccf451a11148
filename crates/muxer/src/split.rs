use camrec_media_info::{MICROS_PER_SEC, VideoParams};

/// File-boundary arithmetic for one stream.
///
/// A file closes on the first key frame at or past `duration - one frame`, so the
/// closing key frame opens the next file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPolicy {
    split_after_us: i64,
    thumbnail_at_frame: u64,
    frame_interval_ms: u64,
}

impl SplitPolicy {
    pub fn new(duration_secs: u32, video: &VideoParams) -> Self {
        let duration = i64::from(duration_secs);
        let frame_rate = u64::from(video.frame_rate.max(1));

        // integer seconds of lead time before the boundary, e.g. gop 30 @ 30fps -> 1s
        let lead_secs = u64::from(video.gop) / frame_rate;
        let thumbnail_at_frame = u64::from(duration_secs).saturating_sub(lead_secs) * frame_rate;

        Self {
            split_after_us: duration * MICROS_PER_SEC - video.frame_interval_us(),
            thumbnail_at_frame,
            frame_interval_ms: video.frame_interval_ms(),
        }
    }

    /// Whether a key frame `elapsed_us` into the current file closes it.
    pub fn split_due(&self, elapsed_us: i64) -> bool {
        elapsed_us >= self.split_after_us
    }

    /// Whether the preview snapshot for the current file should be requested now.
    pub fn thumbnail_due(&self, frame_count: u64) -> bool {
        frame_count >= self.thumbnail_at_frame
    }

    pub fn thumbnail_at_frame(&self) -> u64 {
        self.thumbnail_at_frame
    }

    /// Duration reported for a finished file.
    ///
    /// Falls back to `frames * frame interval` when the timestamps give nothing positive.
    pub fn file_duration_ms(&self, first_pts: i64, last_pts: i64, frame_count: u64) -> u64 {
        let elapsed_ms = last_pts.saturating_sub(first_pts) / 1000;
        if elapsed_ms > 0 {
            elapsed_ms as u64
        } else {
            frame_count * self.frame_interval_ms
        }
    }
}
