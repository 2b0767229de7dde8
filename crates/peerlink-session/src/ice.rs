//! Connectivity candidates and the ordering gate in front of the engine.
//!
//! A candidate can only be applied once the engine knows the remote description.
//! Until then [`IceCandidateBuffer`] holds them in arrival order; `mark_ready`
//! flips the gate and drains the backlog exactly once.

use crate::engine::MediaEngineAdapter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One connectivity candidate as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, m_line_index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_m_line_index = Some(m_line_index);
        self
    }

    /// Browsers signal the end of gathering with an empty candidate string.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Outcome of draining the buffer into the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: VecDeque<IceCandidate>,
    ready: bool,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold a candidate until the remote description is applied.
    ///
    /// Once the buffer has been drained the candidate is handed back and the
    /// caller applies it directly.
    #[must_use]
    pub fn enqueue(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.ready {
            return Some(candidate);
        }
        self.pending.push_back(candidate);
        None
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything still buffered. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Open the gate and apply the backlog in FIFO order.
    ///
    /// A candidate the engine rejects is logged and skipped. Calling this again
    /// drains nothing.
    pub async fn mark_ready<A: MediaEngineAdapter>(&mut self, engine: &mut A) -> DrainReport {
        let mut report = DrainReport::default();
        if self.ready {
            return report;
        }
        self.ready = true;

        while let Some(candidate) = self.pending.pop_front() {
            match engine.add_ice_candidate(&candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        candidate = %candidate.candidate,
                        error = %e,
                        "Engine rejected buffered candidate"
                    );
                }
            }
        }

        report
    }
}
