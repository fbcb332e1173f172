//! Background-threaded video player
//!
//! Decodes frames on a worker thread at the stream's frame rate while the
//! render thread picks up the newest frame without blocking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::decoder::{DecodedFrame, FrameDecoder, StreamInfo};
use super::VideoError;

struct SharedState {
    current_frame: Mutex<Option<DecodedFrame>>,
    new_frame_available: AtomicBool,
    running: AtomicBool,
    paused: AtomicBool,
    restart_requested: AtomicBool,
    frame_index: AtomicU64,
}

impl SharedState {
    fn new() -> Self {
        Self {
            current_frame: Mutex::new(None),
            new_frame_available: AtomicBool::new(false),
            running: AtomicBool::new(true),
            // Players start paused; the owning handle decides when to play.
            paused: AtomicBool::new(true),
            restart_requested: AtomicBool::new(false),
            frame_index: AtomicU64::new(0),
        }
    }
}

pub struct VideoPlayer {
    state: Arc<SharedState>,
    thread_handle: Option<JoinHandle<()>>,
    info: StreamInfo,
    label: String,
}

impl VideoPlayer {
    /// Opens the stream once here to read its metadata, then again on the
    /// worker thread, which owns its decoder for its whole life.
    pub fn spawn<F>(label: impl Into<String>, open: F) -> Result<Self, VideoError>
    where
        F: Fn() -> Result<Box<dyn FrameDecoder>, VideoError> + Send + 'static,
    {
        let label = label.into();
        let info = open()?.info().clone();
        log::info!(
            "VideoPlayer {}: {}x{} @ {:.2}fps, duration {:.2}s",
            label,
            info.width,
            info.height,
            info.frame_rate,
            info.duration
        );

        let state = Arc::new(SharedState::new());
        let thread_state = Arc::clone(&state);
        let thread_label = label.clone();
        let thread_handle = thread::Builder::new()
            .name(format!("video-{label}"))
            .spawn(move || match open() {
                Ok(decoder) => decode_loop(thread_state, decoder, &thread_label),
                Err(err) => log::error!("Failed to open {} in decode thread: {}", thread_label, err),
            })
            .map_err(|err| VideoError::Decode(format!("failed to spawn decode thread: {err}")))?;

        Ok(Self {
            state,
            thread_handle: Some(thread_handle),
            info,
            label,
        })
    }

    /// Newest decoded frame, if one arrived since the last call.
    pub fn take_frame(&self) -> Option<DecodedFrame> {
        if self.state.new_frame_available.swap(false, Ordering::AcqRel) {
            if let Ok(mut current) = self.state.current_frame.lock() {
                return current.take();
            }
        }
        None
    }

    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::Release);
        log::debug!("VideoPlayer {}: paused", self.label);
    }

    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::Release);
        log::debug!("VideoPlayer {}: resumed", self.label);
    }

    pub fn restart(&self) {
        self.state.restart_requested.store(true, Ordering::Release);
    }

    pub fn frame_index(&self) -> u64 {
        self.state.frame_index.load(Ordering::Acquire)
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }
}

fn decode_loop(state: Arc<SharedState>, mut decoder: Box<dyn FrameDecoder>, label: &str) {
    let frame_rate = decoder.info().frame_rate;
    let frame_rate = if frame_rate.is_finite() && frame_rate > 0.0 {
        frame_rate
    } else {
        30.0
    };
    let frame_duration = Duration::from_secs_f64(1.0 / frame_rate);
    let mut next_frame_time = Instant::now();

    // First frame right away so a paused texture still shows something.
    if let Ok(Some(frame)) = decoder.decode_next_frame() {
        publish(&state, frame);
    }

    while state.running.load(Ordering::Acquire) {
        if state.restart_requested.swap(false, Ordering::AcqRel) {
            if let Err(err) = decoder.reset() {
                log::warn!("Failed to reset decoder for {}: {}", label, err);
            }
            next_frame_time = Instant::now();
            state.frame_index.store(0, Ordering::Release);
        }

        if state.paused.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(10));
            next_frame_time = Instant::now();
            continue;
        }

        let now = Instant::now();
        if now < next_frame_time {
            thread::sleep(next_frame_time - now);
        }

        match decoder.decode_next_frame() {
            Ok(Some(frame)) => publish(&state, frame),
            Ok(None) => {
                if let Err(err) = decoder.reset() {
                    log::warn!("Failed to loop {}: {}", label, err);
                }
                state.frame_index.store(0, Ordering::Release);
                log::debug!("VideoPlayer {}: looping", label);
            }
            Err(err) => {
                log::error!("Decode error in {}: {}", label, err);
                thread::sleep(frame_duration);
            }
        }

        next_frame_time += frame_duration;
        // Behind schedule: drop the backlog instead of racing to catch up.
        let now = Instant::now();
        if next_frame_time < now {
            next_frame_time = now;
        }
    }

    log::debug!("VideoPlayer {}: decode thread stopped", label);
}

fn publish(state: &SharedState, frame: DecodedFrame) {
    let index = frame.frame_index;
    if let Ok(mut current) = state.current_frame.lock() {
        *current = Some(frame);
        state.new_frame_available.store(true, Ordering::Release);
        state.frame_index.store(index, Ordering::Release);
    }
}

impl Drop for VideoPlayer {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        self.state.paused.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::warn!("Decode thread for {} panicked", self.label);
            }
        }
    }
}
