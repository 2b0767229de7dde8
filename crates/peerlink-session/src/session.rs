//! The single active negotiation context.

use crate::engine::{ConnectivityState, MediaEngineAdapter};
use crate::ice::IceCandidateBuffer;
use crate::media::TrackRouter;
use crate::sdp::SessionDescription;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Negotiation progress of a session.
///
/// ```text
///   initiator: Idle → Offering → AwaitingAnswer → Connected → Closed
///   responder: Idle → Negotiating ─────────────→ Connected → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    Offering,
    AwaitingAnswer,
    Negotiating,
    Connected,
    Closed,
}

impl NegotiationState {
    /// States in which an inbound answer is accepted.
    pub fn accepts_answer(self) -> bool {
        matches!(self, NegotiationState::Offering | NegotiationState::AwaitingAnswer)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub struct Session<A> {
    pub(crate) id: Uuid,
    pub(crate) role: Role,
    pub(crate) state: NegotiationState,
    pub(crate) local_description: Option<SessionDescription>,
    pub(crate) remote_description: Option<SessionDescription>,
    pub(crate) candidates: IceCandidateBuffer,
    pub(crate) connectivity: ConnectivityState,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) engine: A,
    /// Inbound offer held until the engine asks for negotiation (responder only).
    pub(crate) pending_offer: Option<SessionDescription>,
    pub(crate) tracks: TrackRouter,
}

impl<A: MediaEngineAdapter> Session<A> {
    pub(crate) fn new(
        id: Uuid,
        role: Role,
        engine: A,
        candidates: IceCandidateBuffer,
        tracks: TrackRouter,
    ) -> Self {
        Self {
            id,
            role,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            candidates,
            connectivity: engine.connectivity_state(),
            created_at: Utc::now(),
            engine,
            pending_offer: None,
            tracks,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn has_remote_description(&self) -> bool {
        self.candidates.is_ready()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn engine(&self) -> &A {
        &self.engine
    }

    pub(crate) fn transition(&mut self, next: NegotiationState) {
        if self.state == next {
            return;
        }
        tracing::info!(
            session = %self.id,
            role = %self.role,
            from = %self.state,
            to = %next,
            "Negotiation state changed"
        );
        self.state = next;
    }
}

impl<A> fmt::Debug for Session<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("connectivity", &self.connectivity)
            .field("buffered_candidates", &self.candidates.len())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
