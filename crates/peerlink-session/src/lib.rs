//! # peerlink-session
//!
//! Peer-to-peer WebRTC session negotiation.
//!
//! Two endpoints exchange an offer, an answer and trickled candidates over a
//! signaling relay, then talk directly:
//! - One session at a time, driven by [`NegotiationController`]
//! - Offers are stripped of unwanted video codecs before they leave
//! - Candidates that arrive early are held and applied once, in order
//! - A secondary data channel carries device status frames
//!
//! The media engine and the signaling transport are traits; `str0m` and
//! WebSocket implementations ship in [`str0m_engine`] and [`signaling`].

pub mod controller;
pub mod data_channel;
pub mod engine;
pub mod ice;
pub mod media;
pub mod sdp;
pub mod session;
pub mod signaling;
pub mod str0m_engine;

#[cfg(test)]
mod testing;

pub use controller::{ControlCommand, ControllerSettings, NegotiationController, SessionNotice};
pub use data_channel::{DataChannelBridge, LampStatus, StatusUpdate};
pub use engine::{EngineFactory, MediaEngineAdapter};
pub use ice::IceCandidate;
pub use media::{MediaStream, RenderTarget, TrackEvent, TrackKind};
pub use sdp::{CodecExclusionPolicy, SdpDocument};
pub use session::{NegotiationState, Role, Session};
pub use signaling::{Envelope, SignalingChannel, WebSocketSignaling};
pub use str0m_engine::Str0mEngine;
