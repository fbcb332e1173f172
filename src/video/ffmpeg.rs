//! FFmpeg software decoder producing RGBA frames.

use std::path::Path;

use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;

use super::decoder::{DecodedFrame, FrameDecoder, StreamInfo};
use super::VideoError;

impl From<ffmpeg_next::Error> for VideoError {
    fn from(err: ffmpeg_next::Error) -> Self {
        VideoError::Decode(err.to_string())
    }
}

pub struct FfmpegDecoder {
    input: ffmpeg_next::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg_next::decoder::Video,
    scaler: scaling::Context,
    info: StreamInfo,
    time_base: f64,
}

impl FfmpegDecoder {
    pub fn open(path: &Path) -> Result<Self, VideoError> {
        ffmpeg_next::init()?;

        let input = ffmpeg_next::format::input(&path).map_err(|err| VideoError::Open {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| VideoError::Open {
                path: path.to_path_buf(),
                message: "no video stream".to_string(),
            })?;
        let stream_index = stream.index();

        let time_base = stream.time_base();
        let time_base = time_base.numerator() as f64 / time_base.denominator() as f64;
        let rate = stream.avg_frame_rate();
        let frame_rate = if rate.denominator() > 0 && rate.numerator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            30.0
        };
        let duration = if stream.duration() > 0 {
            stream.duration() as f64 * time_base
        } else if input.duration() > 0 {
            input.duration() as f64 / ffmpeg_next::ffi::AV_TIME_BASE as f64
        } else {
            0.0
        };

        let context = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().video()?;
        let (width, height) = (decoder.width(), decoder.height());
        let scaler = scaling::Context::get(
            decoder.format(),
            width,
            height,
            Pixel::RGBA,
            width,
            height,
            scaling::Flags::BILINEAR,
        )?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            info: StreamInfo {
                width,
                height,
                frame_rate,
                duration,
            },
            time_base,
        })
    }

    fn convert(&mut self, frame: &ffmpeg_next::frame::Video) -> Result<DecodedFrame, VideoError> {
        let mut rgba = ffmpeg_next::frame::Video::empty();
        self.scaler.run(frame, &mut rgba)?;

        let (width, height) = (self.info.width, self.info.height);
        let data = rgba.data(0);
        let stride = rgba.stride(0);
        let row = width as usize * 4;
        let pixels = if stride == row {
            data[..DecodedFrame::expected_size(width, height)].to_vec()
        } else {
            let mut packed = Vec::with_capacity(DecodedFrame::expected_size(width, height));
            for y in 0..height as usize {
                packed.extend_from_slice(&data[y * stride..y * stride + row]);
            }
            packed
        };

        let pts = frame.pts().unwrap_or(0) as f64 * self.time_base;
        let index = (pts * self.info.frame_rate).round() as u64;
        Ok(DecodedFrame::new(pixels, width, height, pts, index))
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn decode_next_frame(&mut self) -> Result<Option<DecodedFrame>, VideoError> {
        let mut decoded = ffmpeg_next::frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => return self.convert(&decoded).map(Some),
                Err(ffmpeg_next::Error::Other {
                    errno: ffmpeg_next::error::EAGAIN,
                }) => {}
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(err) => return Err(err.into()),
            }

            // Feed packets until the decoder has something for us.
            loop {
                match self.input.packets().next() {
                    Some((stream, packet)) => {
                        if stream.index() == self.stream_index {
                            self.decoder.send_packet(&packet)?;
                            break;
                        }
                    }
                    None => {
                        self.decoder.send_eof()?;
                        break;
                    }
                }
            }
        }
    }

    fn reset(&mut self) -> Result<(), VideoError> {
        self.input.seek(0, ..)?;
        self.decoder.flush();
        Ok(())
    }
}
