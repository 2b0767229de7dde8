//! Received tracks and how they reach the renderer.

use peerlink_common::config::TrackAssembly;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<str0m::media::MediaKind> for TrackKind {
    fn from(kind: str0m::media::MediaKind) -> Self {
        match kind {
            str0m::media::MediaKind::Audio => TrackKind::Audio,
            str0m::media::MediaKind::Video => TrackKind::Video,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A remote track announced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEvent {
    pub mid: String,
    pub kind: TrackKind,
}

/// A group of tracks rendered together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: Uuid,
    pub tracks: Vec<TrackEvent>,
}

impl MediaStream {
    pub fn new(tracks: Vec<TrackEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracks,
        }
    }
}

/// Where received media ends up (a video element, a file sink, a log).
pub trait RenderTarget: Send {
    /// Replace whatever is currently shown with `stream`.
    fn attach(&mut self, stream: &MediaStream);

    /// A track was added to the attached stream.
    fn add_track(&mut self, track: &TrackEvent);

    fn release(&mut self);
}

/// Assembles received tracks for a [`RenderTarget`].
#[derive(Debug)]
pub struct TrackRouter {
    assembly: TrackAssembly,
    stream: Option<MediaStream>,
}

impl TrackRouter {
    pub fn new(assembly: TrackAssembly) -> Self {
        Self {
            assembly,
            stream: None,
        }
    }

    pub fn assembly(&self) -> TrackAssembly {
        self.assembly
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    /// Called when the session starts. The shared variant attaches its empty
    /// stream right away; the rebuilding variant waits for the first track.
    pub fn start<R: RenderTarget>(&mut self, target: &mut R) {
        if self.assembly == TrackAssembly::SharedStream {
            let stream = MediaStream::new(Vec::new());
            target.attach(&stream);
            self.stream = Some(stream);
        }
    }

    pub fn route<R: RenderTarget>(&mut self, track: TrackEvent, target: &mut R) {
        tracing::debug!(mid = %track.mid, kind = %track.kind, "Routing remote track");

        match self.assembly {
            TrackAssembly::SharedStream => {
                let stream = self.stream.get_or_insert_with(|| {
                    let stream = MediaStream::new(Vec::new());
                    target.attach(&stream);
                    stream
                });
                target.add_track(&track);
                stream.tracks.push(track);
            }
            TrackAssembly::RebuildPerTrack => {
                let mut tracks = self.stream.take().map(|s| s.tracks).unwrap_or_default();
                tracks.push(track);
                let stream = MediaStream::new(tracks);
                target.attach(&stream);
                self.stream = Some(stream);
            }
        }
    }

    pub fn stop<R: RenderTarget>(&mut self, target: &mut R) {
        self.stream = None;
        target.release();
    }
}
