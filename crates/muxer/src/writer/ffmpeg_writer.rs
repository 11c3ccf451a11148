use camrec_media_info::{AudioParams, ContainerFormat, VideoCodec, VideoParams};
use ffmpeg::{Rational, format, packet};
use std::{path::Path, ptr};
use tracing::*;

use super::{ContainerWriter, WriterError};

const MICROS: Rational = Rational(1, 1_000_000);

/// Stream-copies already encoded packets into a real mp4/mpegts/flv container.
pub struct FfmpegWriter {
    open: Option<OpenOutput>,
}

struct OpenOutput {
    output: format::context::Output,
    video_index: usize,
    audio_index: Option<usize>,
}

impl FfmpegWriter {
    pub fn new() -> Result<Self, WriterError> {
        ffmpeg::init()?;
        Ok(Self { open: None })
    }

    fn open_mut(&mut self) -> Result<&mut OpenOutput, WriterError> {
        self.open.as_mut().ok_or(WriterError::NotOpen)
    }
}

fn add_video_stream(
    output: &mut format::context::Output,
    video: &VideoParams,
) -> Result<usize, ffmpeg::Error> {
    let (id, codec_id) = match video.codec {
        VideoCodec::H264 => (
            ffmpeg::codec::Id::H264,
            ffmpeg::ffi::AVCodecID::AV_CODEC_ID_H264,
        ),
        VideoCodec::H265 => (
            ffmpeg::codec::Id::HEVC,
            ffmpeg::ffi::AVCodecID::AV_CODEC_ID_HEVC,
        ),
    };

    let codec = ffmpeg::codec::decoder::find(id).ok_or(ffmpeg::Error::DecoderNotFound)?;
    let mut stream = output.add_stream(codec)?;
    stream.set_time_base(MICROS);

    unsafe {
        let codecpar = (*stream.as_mut_ptr()).codecpar;
        (*codecpar).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
        (*codecpar).codec_id = codec_id;
        (*codecpar).width = video.width as i32;
        (*codecpar).height = video.height as i32;
        (*codecpar).bit_rate = i64::from(video.bitrate_kbps) * 1000;

        let rate = ffmpeg::ffi::AVRational {
            num: video.frame_rate as i32,
            den: 1,
        };
        (*stream.as_mut_ptr()).avg_frame_rate = rate;
        (*stream.as_mut_ptr()).r_frame_rate = rate;
    }

    Ok(stream.index())
}

fn add_audio_stream(
    output: &mut format::context::Output,
    audio: &AudioParams,
) -> Result<usize, ffmpeg::Error> {
    // MP3 payloads are declared as MP2, the container only needs the framing
    let codec = ffmpeg::codec::decoder::find(ffmpeg::codec::Id::MP2)
        .ok_or(ffmpeg::Error::DecoderNotFound)?;
    let mut stream = output.add_stream(codec)?;
    stream.set_time_base(MICROS);

    unsafe {
        let codecpar = (*stream.as_mut_ptr()).codecpar;
        (*codecpar).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
        (*codecpar).codec_id = ffmpeg::ffi::AVCodecID::AV_CODEC_ID_MP2;
        (*codecpar).sample_rate = audio.sample_rate as i32;
        (*codecpar).bit_rate = i64::from(audio.bitrate_kbps) * 1000;
        ffmpeg::ffi::av_channel_layout_default(
            &mut (*codecpar).ch_layout,
            i32::from(audio.channels),
        );
    }

    Ok(stream.index())
}

impl OpenOutput {
    fn write_packet(
        &mut self,
        index: usize,
        data: &[u8],
        pts: i64,
        key_frame: bool,
    ) -> Result<(), WriterError> {
        let time_base = self
            .output
            .stream(index)
            .map(|s| s.time_base())
            .ok_or(WriterError::NotOpen)?;

        let mut packet = ffmpeg::Packet::copy(data);
        packet.set_stream(index);
        packet.set_pts(Some(pts));
        packet.set_dts(Some(pts));
        if key_frame {
            packet.set_flags(packet::Flags::KEY);
        }
        packet.rescale_ts(MICROS, time_base);

        packet.write_interleaved(&mut self.output)?;
        Ok(())
    }
}

impl ContainerWriter for FfmpegWriter {
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

        let mut output = format::output_as(&path, format.tag())?;

        let video_index = add_video_stream(&mut output, video)?;
        let audio_index = audio
            .map(|audio| add_audio_stream(&mut output, audio))
            .transpose()?;

        // make sure this happens after adding all streams!
        output.write_header()?;

        info!(
            path = %path.display(),
            format = %format,
            "Opened {} container",
            format.tag()
        );

        self.open = Some(OpenOutput {
            output,
            video_index,
            audio_index,
        });

        Ok(())
    }

    fn write_video_frame(
        &mut self,
        data: &[u8],
        pts: i64,
        key_frame: bool,
    ) -> Result<(), WriterError> {
        let open = self.open_mut()?;
        let index = open.video_index;
        open.write_packet(index, data, pts, key_frame)
    }

    fn write_audio_frame(&mut self, data: &[u8], pts: i64) -> Result<(), WriterError> {
        let open = self.open_mut()?;
        let index = open
            .audio_index
            .ok_or(WriterError::Unsupported("stream has no audio track"))?;
        open.write_packet(index, data, pts, false)
    }

    fn append_trailer(&mut self, data: &[u8]) -> Result<(), WriterError> {
        let open = self.open_mut()?;
        let len = i32::try_from(data.len())
            .map_err(|_| WriterError::Unsupported("trailer too large"))?;

        unsafe {
            let ctx = open.output.as_mut_ptr();
            let pb = (*ctx).pb;
            if pb.is_null() {
                return Err(WriterError::NotOpen);
            }

            // packets still held for interleaving, then whatever the muxer itself buffers
            // (mpegts keeps partial PES payloads), must reach the file ahead of the box
            let ret = ffmpeg::ffi::av_interleaved_write_frame(ctx, ptr::null_mut());
            if ret < 0 {
                return Err(ffmpeg::Error::from(ret).into());
            }
            let ret = ffmpeg::ffi::av_write_frame(ctx, ptr::null_mut());
            if ret < 0 {
                return Err(ffmpeg::Error::from(ret).into());
            }

            ffmpeg::ffi::avio_write(pb, data.as_ptr(), len);
            ffmpeg::ffi::avio_flush(pb);
            if (*pb).error < 0 {
                return Err(ffmpeg::Error::from((*pb).error).into());
            }
        }

        Ok(())
    }

    fn deinit(&mut self) -> Result<(), WriterError> {
        let Some(mut open) = self.open.take() else {
            return Err(WriterError::NotOpen);
        };

        open.output.write_trailer()?;

        Ok(())
    }
}
