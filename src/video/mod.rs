//! Looping video textures.
//!
//! Every video-bound mesh gets a [`VideoHandle`] owned by the [`VideoRegistry`].
//! Handles track logical playback state and, when a decoder backend is
//! available, own a [`VideoPlayer`] decoding on a background thread.

pub mod decoder;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
pub mod player;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::scene::NodeId;
pub use decoder::DecodedFrame;
use decoder::OpenDecoder;
use player::VideoPlayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VideoId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoRole {
    Foreground,
    Background,
    Plane,
}

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("no video decoder backend in this build (enable the `ffmpeg` feature)")]
    BackendUnavailable,
    #[error("video file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to open {}: {message}", path.display())]
    Open { path: PathBuf, message: String },
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Logical playback state, independent of whether frames are being decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub playing: bool,
    /// Seconds from the start of the clip.
    pub position: f64,
    pub duration: Option<f64>,
    pub looping: bool,
    pub muted: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            playing: false,
            position: 0.0,
            duration: None,
            looping: true,
            muted: true,
        }
    }
}

impl PlaybackState {
    /// Rewind and play.
    pub fn start(&mut self) {
        self.position = 0.0;
        self.playing = true;
    }

    /// Pause and rewind.
    pub fn stop(&mut self) {
        self.position = 0.0;
        self.playing = false;
    }

    pub fn advance(&mut self, dt: f64) {
        if !self.playing || dt <= 0.0 {
            return;
        }
        self.position += dt;
        if let Some(duration) = self.duration.filter(|duration| *duration > 0.0) {
            if self.looping {
                self.position %= duration;
            } else if self.position >= duration {
                self.position = duration;
                self.playing = false;
            }
        }
    }
}

pub struct VideoHandle {
    id: VideoId,
    source: String,
    path: PathBuf,
    role: VideoRole,
    nodes: Vec<NodeId>,
    state: PlaybackState,
    player: Option<VideoPlayer>,
    open: OpenDecoder,
    last_error: Option<String>,
}

impl VideoHandle {
    fn new(id: VideoId, source: &str, base_dir: &Path, role: VideoRole, open: OpenDecoder) -> Self {
        Self {
            id,
            source: source.to_string(),
            path: base_dir.join(source),
            role,
            nodes: Vec::new(),
            state: PlaybackState::default(),
            player: None,
            open,
            last_error: None,
        }
    }

    pub fn id(&self) -> VideoId {
        self.id
    }

    /// Path as referenced by the scene.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Path resolved against the scene file's directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> VideoRole {
        self.role
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state.playing
    }

    pub fn has_decoder(&self) -> bool {
        self.player.is_some()
    }

    /// Index of the last frame the decoder published, counted from the loop start.
    pub fn frame_index(&self) -> Option<u64> {
        self.player.as_ref().map(VideoPlayer::frame_index)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn ensure_player(&mut self) -> Result<&VideoPlayer, VideoError> {
        if self.player.is_none() {
            let path = self.path.clone();
            let open = self.open;
            let player = VideoPlayer::spawn(self.source.clone(), move || open(&path))?;
            self.state.duration = Some(player.info().duration).filter(|duration| *duration > 0.0);
            self.player = Some(player);
        }
        self.player
            .as_ref()
            .ok_or_else(|| VideoError::Decode("decoder missing after open".to_string()))
    }

    /// Muted looping playback from the current position. Failure leaves the handle paused.
    pub fn autoplay(&mut self) -> Result<(), VideoError> {
        self.state.muted = true;
        self.state.looping = true;
        match self.ensure_player().map(VideoPlayer::resume) {
            Ok(()) => {
                self.state.playing = true;
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                self.state.playing = false;
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Rewind and play. Retries opening the decoder when an earlier attempt
    /// failed; if it fails again the handle stays paused at zero.
    pub fn start(&mut self) {
        let opened = self.ensure_player().map(|player| {
            player.restart();
            player.resume();
        });
        match opened {
            Ok(()) => {
                self.state.start();
                self.last_error = None;
            }
            Err(err) => {
                log::error!("Error playing the video {}: {}", self.source, err);
                self.state.stop();
                self.last_error = Some(err.to_string());
            }
        }
    }

    /// Pause and rewind.
    pub fn stop(&mut self) {
        self.state.stop();
        if let Some(player) = &self.player {
            player.pause();
            player.restart();
        }
    }

    fn update(&mut self, dt: f64) -> Option<DecodedFrame> {
        self.state.advance(dt);
        self.player.as_ref().and_then(VideoPlayer::take_frame)
    }
}

/// Which handles a playback command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoTarget {
    /// Most recently bound handle.
    Active,
    Background,
    Node(NodeId),
    Video(VideoId),
    All,
}

pub struct VideoRegistry {
    base_dir: PathBuf,
    open: OpenDecoder,
    handles: Vec<VideoHandle>,
    by_node: HashMap<NodeId, VideoId>,
    active: Option<VideoId>,
    background: Option<VideoId>,
}

impl VideoRegistry {
    /// `base_dir` is the directory video references are resolved against.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            open: decoder::open_decoder,
            handles: Vec::new(),
            by_node: HashMap::new(),
            active: None,
            background: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_decoder(base_dir: impl Into<PathBuf>, open: OpenDecoder) -> Self {
        Self {
            open,
            ..Self::new(base_dir)
        }
    }

    /// Registers a fresh handle for `source` and attaches it to `node`.
    pub fn bind(&mut self, node: NodeId, source: &str, role: VideoRole) -> VideoId {
        let id = VideoId(self.handles.len());
        self.handles
            .push(VideoHandle::new(id, source, &self.base_dir, role, self.open));
        self.attach(node, id);
        self.active = Some(id);
        if role == VideoRole::Background {
            self.background = Some(id);
        }
        log::debug!("Bound video {} to node {:?} as {:?}", source, node, role);
        id
    }

    /// Shares an existing handle with another node.
    pub fn attach(&mut self, node: NodeId, id: VideoId) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            if !handle.nodes.contains(&node) {
                handle.nodes.push(node);
            }
            self.by_node.insert(node, id);
        }
    }

    pub fn get(&self, id: VideoId) -> Option<&VideoHandle> {
        self.handles.get(id.0)
    }

    pub fn active(&self) -> Option<&VideoHandle> {
        self.active.and_then(|id| self.get(id))
    }

    pub fn background(&self) -> Option<&VideoHandle> {
        self.background.and_then(|id| self.get(id))
    }

    pub fn handles(&self) -> &[VideoHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn resolve(&self, target: VideoTarget) -> Vec<VideoId> {
        match target {
            VideoTarget::Active => self.active.into_iter().collect(),
            VideoTarget::Background => self.background.into_iter().collect(),
            VideoTarget::Node(node) => self.by_node.get(&node).copied().into_iter().collect(),
            VideoTarget::Video(id) => self.get(id).map(VideoHandle::id).into_iter().collect(),
            VideoTarget::All => self.handles.iter().map(VideoHandle::id).collect(),
        }
    }

    /// Rewinds and plays every handle in `target`. Returns how many were affected.
    pub fn start(&mut self, target: VideoTarget) -> usize {
        let ids = self.resolve(target);
        for id in &ids {
            self.handles[id.0].start();
        }
        ids.len()
    }

    /// Pauses and rewinds every handle in `target`. Returns how many were affected.
    pub fn stop(&mut self, target: VideoTarget) -> usize {
        let ids = self.resolve(target);
        for id in &ids {
            self.handles[id.0].stop();
        }
        ids.len()
    }

    /// Starts the active handle if it is paused, otherwise stops it.
    pub fn toggle_active(&mut self) {
        match self.active().map(VideoHandle::is_playing) {
            Some(true) => {
                self.stop(VideoTarget::Active);
            }
            Some(false) => {
                self.start(VideoTarget::Active);
            }
            None => log::debug!("No video bound, nothing to toggle"),
        }
    }

    /// Attempts muted, looping playback of every handle. Failures are logged per handle.
    pub fn autoplay_all(&mut self) -> usize {
        let mut playing = 0;
        for handle in &mut self.handles {
            match handle.autoplay() {
                Ok(()) => playing += 1,
                Err(err) => log::error!("Error playing the video {}: {}", handle.source, err),
            }
        }
        playing
    }

    /// Advances playback clocks and collects frames ready for upload.
    pub fn update(&mut self, dt: f64) -> Vec<(VideoId, DecodedFrame)> {
        self.handles
            .iter_mut()
            .filter_map(|handle| handle.update(dt).map(|frame| (handle.id, frame)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> VideoRegistry {
        VideoRegistry::new(std::env::temp_dir().join("loopview_registry_test"))
    }

    fn decoding_registry() -> VideoRegistry {
        VideoRegistry::with_decoder(
            std::env::temp_dir().join("loopview_registry_test"),
            decoder::testing::open_solid,
        )
    }

    #[test]
    fn start_then_stop_leaves_handle_paused_at_zero() {
        let mut videos = decoding_registry();
        let id = videos.bind(NodeId(3), "loop.mp4", VideoRole::Foreground);

        assert_eq!(videos.start(VideoTarget::Active), 1);
        assert!(videos.get(id).unwrap().is_playing());
        assert!(videos.get(id).unwrap().has_decoder());
        videos.handles[id.0].state.duration = Some(10.0);
        videos.update(1.5);
        assert!((videos.get(id).unwrap().state().position - 1.5).abs() < 1e-9);

        assert_eq!(videos.stop(VideoTarget::Active), 1);
        let state = videos.get(id).unwrap().state();
        assert!(!state.playing);
        assert_eq!(state.position, 0.0);
    }

    #[test]
    fn commands_without_bound_video_are_noops() {
        let mut videos = registry();
        assert_eq!(videos.start(VideoTarget::Active), 0);
        assert_eq!(videos.stop(VideoTarget::Background), 0);
        assert_eq!(videos.start(VideoTarget::Node(NodeId(1))), 0);
        videos.toggle_active();
        assert!(videos.is_empty());
    }

    #[test]
    fn later_bindings_do_not_clobber_earlier_handles() {
        let mut videos = decoding_registry();
        let background = videos.bind(NodeId(0), "bg.mp4", VideoRole::Background);
        let first = videos.bind(NodeId(1), "a.mp4", VideoRole::Foreground);
        let second = videos.bind(NodeId(2), "b.mp4", VideoRole::Foreground);

        assert_eq!(videos.len(), 3);
        assert_eq!(videos.active().map(VideoHandle::id), Some(second));
        assert_eq!(videos.background().map(VideoHandle::source), Some("bg.mp4"));
        assert_eq!(videos.resolve(VideoTarget::Node(NodeId(1))), vec![first]);

        videos.start(VideoTarget::Node(NodeId(1)));
        assert!(videos.get(first).unwrap().is_playing());
        assert!(!videos.get(second).unwrap().is_playing());
        assert!(!videos.get(background).unwrap().is_playing());
        assert_eq!(videos.resolve(VideoTarget::All).len(), 3);
    }

    #[test]
    fn attach_shares_a_handle_between_nodes() {
        let mut videos = registry();
        let plane = videos.bind(NodeId(4), "plane.mp4", VideoRole::Plane);
        videos.attach(NodeId(5), plane);
        assert_eq!(videos.get(plane).unwrap().nodes(), &[NodeId(4), NodeId(5)]);
        assert_eq!(videos.resolve(VideoTarget::Node(NodeId(5))), vec![plane]);
    }

    #[test]
    fn failed_autoplay_stays_paused_and_records_error() {
        let mut videos = registry();
        let id = videos.bind(NodeId(0), "does_not_exist.mp4", VideoRole::Foreground);
        assert_eq!(videos.autoplay_all(), 0);
        let handle = videos.get(id).unwrap();
        assert!(!handle.is_playing());
        assert!(!handle.has_decoder());
        assert!(handle.last_error().is_some());
        assert!(handle.state().muted && handle.state().looping);
    }

    #[test]
    fn failed_start_stays_paused_and_records_error() {
        let mut videos = registry();
        let id = videos.bind(NodeId(0), "does_not_exist.mp4", VideoRole::Foreground);
        assert_eq!(videos.start(VideoTarget::Video(id)), 1);
        let handle = videos.get(id).unwrap();
        assert!(!handle.is_playing());
        assert_eq!(handle.state().position, 0.0);
        assert!(handle.last_error().is_some());
    }

    #[test]
    fn starting_the_active_handle_leaves_earlier_ones_paused() {
        let mut videos = decoding_registry();
        let first = videos.bind(NodeId(1), "a.mp4", VideoRole::Foreground);
        let second = videos.bind(NodeId(2), "b.mp4", VideoRole::Foreground);

        assert_eq!(videos.start(VideoTarget::Active), 1);
        assert!(videos.get(second).unwrap().is_playing());
        assert!(!videos.get(first).unwrap().is_playing());
    }

    #[test]
    fn playback_position_wraps_when_looping() {
        let mut state = PlaybackState {
            duration: Some(2.0),
            ..PlaybackState::default()
        };
        state.start();
        state.advance(3.5);
        assert!((state.position - 1.5).abs() < 1e-9);

        state.looping = false;
        state.advance(5.0);
        assert_eq!(state.position, 2.0);
        assert!(!state.playing);
    }
}
