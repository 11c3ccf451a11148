use camrec_media_info::{AudioParams, ContainerFormat, VideoParams};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::*;

use super::{ContainerWriter, WriterError};

/// Writes the elementary streams straight to disk.
///
/// Video access units are concatenated into the output path. Audio goes to a sibling
/// file named after the audio codec (`clip.mp4` -> `clip.mp2`). The thumbnail trailer
/// lands at the end of the video file.
#[derive(Default)]
pub struct EsFileWriter {
    open: Option<OpenFiles>,
}

struct OpenFiles {
    video_path: PathBuf,
    video: BufWriter<File>,
    audio: Option<(PathBuf, BufWriter<File>)>,
    video_bytes: u64,
    audio_bytes: u64,
}

impl EsFileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audio_path(video_path: &Path, audio: &AudioParams) -> PathBuf {
        let mut path = video_path.to_path_buf();
        // drop the in-progress suffix along with the container extension
        if path.extension().is_some_and(|ext| ext == "part") {
            path.set_extension("");
        }
        path.set_extension(audio.codec.tag());
        path
    }

    fn open_mut(&mut self) -> Result<&mut OpenFiles, WriterError> {
        self.open.as_mut().ok_or(WriterError::NotOpen)
    }
}

impl ContainerWriter for EsFileWriter {
    fn init(
        &mut self,
        format: ContainerFormat,
        path: &Path,
        video: &VideoParams,
        audio: Option<&AudioParams>,
    ) -> Result<(), WriterError> {
        if self.open.is_some() {
            return Err(WriterError::AlreadyOpen);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let video_file = BufWriter::new(File::create(path)?);
        let audio_file = match audio {
            Some(audio) => {
                let audio_path = Self::audio_path(path, audio);
                let file = BufWriter::new(File::create(&audio_path)?);
                Some((audio_path, file))
            }
            None => None,
        };

        debug!(
            path = %path.display(),
            format = %format,
            video = video.codec.tag(),
            audio = audio.map(|a| a.codec.muxer_tag()),
            "Opened elementary stream output"
        );

        self.open = Some(OpenFiles {
            video_path: path.to_path_buf(),
            video: video_file,
            audio: audio_file,
            video_bytes: 0,
            audio_bytes: 0,
        });

        Ok(())
    }

    fn write_video_frame(&mut self, data: &[u8], _: i64, _: bool) -> Result<(), WriterError> {
        let open = self.open_mut()?;
        open.video.write_all(data)?;
        open.video_bytes += data.len() as u64;
        Ok(())
    }

    fn write_audio_frame(&mut self, data: &[u8], _: i64) -> Result<(), WriterError> {
        let open = self.open_mut()?;
        let Some((_, audio)) = open.audio.as_mut() else {
            return Err(WriterError::Unsupported("stream has no audio track"));
        };
        audio.write_all(data)?;
        open.audio_bytes += data.len() as u64;
        Ok(())
    }

    fn append_trailer(&mut self, data: &[u8]) -> Result<(), WriterError> {
        let open = self.open_mut()?;
        open.video.write_all(data)?;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), WriterError> {
        let Some(open) = self.open.take() else {
            return Err(WriterError::NotOpen);
        };

        let video = open.video.into_inner().map_err(|e| e.into_error())?;
        video.sync_all()?;

        if let Some((audio_path, audio)) = open.audio {
            let audio = audio.into_inner().map_err(|e| e.into_error())?;
            if let Err(e) = audio.sync_all() {
                warn!("File fsync failed for {}: {e}", audio_path.display());
            }
        }

        trace!(
            path = %open.video_path.display(),
            video_bytes = open.video_bytes,
            audio_bytes = open.audio_bytes,
            "Closed elementary stream output"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camrec_media_info::{AudioCodec, VideoCodec};
    use tempfile::TempDir;

    fn video() -> VideoParams {
        VideoParams::new(VideoCodec::H264, 640, 360, 30, 30)
    }

    #[test]
    fn writes_video_audio_and_trailer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/clip.mp4");
        let audio = AudioParams::new(AudioCodec::Mp2, 48_000, 1).unwrap();

        let mut writer = EsFileWriter::new();
        writer
            .init(ContainerFormat::Mp4, &path, &video(), Some(&audio))
            .unwrap();
        writer.write_video_frame(&[0, 0, 0, 1, 0x65], 0, true).unwrap();
        writer.write_audio_frame(&[0xFF, 0xFD], 0).unwrap();
        writer.write_video_frame(&[0, 0, 0, 1, 0x41], 33_333, false).unwrap();
        writer.append_trailer(b"TRAILER").unwrap();
        writer.deinit().unwrap();

        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"\x00\x00\x00\x01\x65\x00\x00\x00\x01\x41TRAILER"
        );
        assert_eq!(
            std::fs::read(dir.path().join("nested/clip.mp2")).unwrap(),
            vec![0xFF, 0xFD]
        );
    }

    #[test]
    fn audio_path_strips_part_suffix() {
        let audio = AudioParams::new(AudioCodec::Mp3, 44_100, 2).unwrap();
        assert_eq!(
            EsFileWriter::audio_path(Path::new("/rec/a.mp4.part"), &audio),
            PathBuf::from("/rec/a.mp3")
        );
    }

    #[test]
    fn rejects_calls_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.ts");
        let mut writer = EsFileWriter::new();

        assert!(matches!(
            writer.write_video_frame(&[1], 0, true),
            Err(WriterError::NotOpen)
        ));

        writer
            .init(ContainerFormat::MpegTs, &path, &video(), None)
            .unwrap();
        assert!(matches!(
            writer.init(ContainerFormat::MpegTs, &path, &video(), None),
            Err(WriterError::AlreadyOpen)
        ));
        assert!(matches!(
            writer.write_audio_frame(&[1], 0),
            Err(WriterError::Unsupported(_))
        ));

        writer.deinit().unwrap();
        assert!(matches!(writer.deinit(), Err(WriterError::NotOpen)));
    }
}
