//! Frame decoder abstraction.
//!
//! The player thread only needs "give me the next RGBA frame" and "rewind",
//! so decoder backends hide behind [`FrameDecoder`].

use std::path::Path;

use super::VideoError;

/// A decoded RGBA8 video frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in seconds
    pub pts: f64,
    pub frame_index: u64,
}

impl DecodedFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, pts: f64, frame_index: u64) -> Self {
        Self {
            data,
            width,
            height,
            pts,
            frame_index,
        }
    }

    pub fn expected_size(width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * 4
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == Self::expected_size(self.width, self.height)
    }
}

/// Stream metadata known once the file is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub duration: f64,
}

pub trait FrameDecoder {
    fn info(&self) -> &StreamInfo;

    /// Next frame, or `None` at end of stream.
    fn decode_next_frame(&mut self) -> Result<Option<DecodedFrame>, VideoError>;

    /// Rewind to the first frame.
    fn reset(&mut self) -> Result<(), VideoError>;
}

/// Opens a video file; swapped out for synthetic streams in tests.
pub type OpenDecoder = fn(&Path) -> Result<Box<dyn FrameDecoder>, VideoError>;

/// Opens `path` with the backend compiled into this build.
pub fn open_decoder(path: &Path) -> Result<Box<dyn FrameDecoder>, VideoError> {
    if !path.is_file() {
        return Err(VideoError::NotFound(path.to_path_buf()));
    }
    open_backend(path)
}

#[cfg(feature = "ffmpeg")]
fn open_backend(path: &Path) -> Result<Box<dyn FrameDecoder>, VideoError> {
    let decoder = super::ffmpeg::FfmpegDecoder::open(path)?;
    Ok(Box::new(decoder))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_backend(_path: &Path) -> Result<Box<dyn FrameDecoder>, VideoError> {
    Err(VideoError::BackendUnavailable)
}


#[cfg(test)]
mod tests {
    use super::testing::SolidColorDecoder;
    use super::*;

    #[test]
    fn missing_file_is_not_found() {
        let path = std::env::temp_dir().join("loopview_missing_clip_7f3a.mp4");
        match open_decoder(&path) {
            Err(VideoError::NotFound(reported)) => assert_eq!(reported, path),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("missing file opened"),
        }
    }

    #[test]
    fn solid_decoder_ends_and_rewinds() {
        let mut decoder = SolidColorDecoder::new(2, 30.0);
        let first = decoder.decode_next_frame().unwrap().unwrap();
        assert!(first.is_complete());
        assert!(decoder.decode_next_frame().unwrap().is_some());
        assert!(decoder.decode_next_frame().unwrap().is_none());
        decoder.reset().unwrap();
        assert_eq!(decoder.decode_next_frame().unwrap().unwrap().frame_index, 0);
    }
}
