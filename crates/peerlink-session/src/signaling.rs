//! Signaling transport: JSON envelopes between the two peers.
//!
//! ```text
//!   {"type":"offer","sdp":"v=0\r\n..."}
//!   {"type":"answer","sdp":"v=0\r\n..."}
//!   {"type":"candidate","ice":{"candidate":"...","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}}
//!   {"type":"close"}
//! ```
//!
//! Outbound envelopes go through [`SignalingChannel::send`]; inbound ones arrive
//! on an [`Inbound`] receiver fed by a reader task, already decoded. Frames that
//! fail to decode are delivered as errors so the controller can report them.

use crate::ice::IceCandidate;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use peerlink_common::{PeerlinkError, PeerlinkResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Wire unit of the signaling protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { ice: IceCandidate },
    Close,
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::Candidate { .. } => "candidate",
            Envelope::Close => "close",
        }
    }

    pub fn from_json(text: &str) -> PeerlinkResult<Self> {
        serde_json::from_str(text).map_err(|e| PeerlinkError::malformed("signaling envelope", e))
    }

    pub fn to_json(&self) -> PeerlinkResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decoded inbound envelopes, in arrival order.
pub type Inbound = mpsc::Receiver<PeerlinkResult<Envelope>>;

const INBOUND_CAPACITY: usize = 64;

/// Outbound half of a signaling transport.
pub trait SignalingChannel: Send {
    fn send(&mut self, envelope: Envelope) -> impl Future<Output = PeerlinkResult<()>> + Send;

    fn is_open(&self) -> bool;
}

// ─── WebSocket ─────────────────────────────────────────────────────────────

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Signaling over a WebSocket relay that forwards every text frame to the
/// other peer.
pub struct WebSocketSignaling {
    sink: WsSink,
    open: Arc<AtomicBool>,
}

impl WebSocketSignaling {
    /// Connect to the relay and spawn the reader task.
    pub async fn connect(url: &str) -> PeerlinkResult<(Self, Inbound)> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| PeerlinkError::Transport(format!("connect to {url}: {e}")))?;
        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));

        tracing::info!(url, "Signaling connected");

        let reader_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => Envelope::from_json(text.as_str()),
                    Ok(Message::Binary(bytes)) => std::str::from_utf8(&bytes)
                        .map_err(|e| PeerlinkError::malformed("signaling frame", e))
                        .and_then(Envelope::from_json),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx.send(Err(PeerlinkError::Transport(e.to_string()))).await;
                        break;
                    }
                };
                if let Ok(envelope) = &decoded {
                    tracing::debug!(kind = envelope.kind(), "Signaling envelope received");
                }
                if tx.send(decoded).await.is_err() {
                    break;
                }
            }
            reader_open.store(false, Ordering::Release);
            tracing::info!("Signaling connection closed");
        });

        Ok((Self { sink, open }, rx))
    }
}

impl SignalingChannel for WebSocketSignaling {
    async fn send(&mut self, envelope: Envelope) -> PeerlinkResult<()> {
        if !self.is_open() {
            return Err(PeerlinkError::Transport("signaling connection is closed".into()));
        }
        let json = envelope.to_json()?;
        tracing::debug!(kind = envelope.kind(), "Sending signaling envelope");

        if let Err(e) = self.sink.send(Message::Text(json.into())).await {
            self.open.store(false, Ordering::Release);
            return Err(PeerlinkError::Transport(e.to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ─── In-memory ─────────────────────────────────────────────────────────────

/// One end of an in-process signaling link. Envelopes are serialized and
/// parsed on the way through so both ends see exactly what a relay would carry.
#[derive(Debug, Clone)]
pub struct MemorySignaling {
    peer: mpsc::Sender<PeerlinkResult<Envelope>>,
}

/// Two connected in-memory endpoints with their inbound receivers.
pub fn memory_pair() -> ((MemorySignaling, Inbound), (MemorySignaling, Inbound)) {
    let (to_a, a_inbound) = mpsc::channel(INBOUND_CAPACITY);
    let (to_b, b_inbound) = mpsc::channel(INBOUND_CAPACITY);
    (
        (MemorySignaling { peer: to_b }, a_inbound),
        (MemorySignaling { peer: to_a }, b_inbound),
    )
}

impl SignalingChannel for MemorySignaling {
    async fn send(&mut self, envelope: Envelope) -> PeerlinkResult<()> {
        let json = envelope.to_json()?;
        self.peer
            .send(Envelope::from_json(&json))
            .await
            .map_err(|_| PeerlinkError::Transport("peer endpoint dropped".into()))
    }

    fn is_open(&self) -> bool {
        !self.peer.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_use_lowercase_type_tags() {
        let offer = Envelope::Offer { sdp: "v=0\r\n".into() };
        assert_eq!(offer.to_json().unwrap(), r#"{"type":"offer","sdp":"v=0\r\n"}"#);
        assert_eq!(Envelope::Close.to_json().unwrap(), r#"{"type":"close"}"#);
    }

    #[test]
    fn parses_browser_candidate_envelope() {
        let env = Envelope::from_json(
            r#"{"type":"candidate","ice":{"candidate":"candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx raddr 0.0.0.0 rport 0","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"fo0B"}}"#,
        )
        .unwrap();

        let Envelope::Candidate { ice } = env else {
            panic!("expected a candidate envelope");
        };
        assert_eq!(ice.sdp_mid.as_deref(), Some("0"));
        assert_eq!(ice.username_fragment.as_deref(), Some("fo0B"));
    }

    #[test]
    fn unknown_or_broken_frames_are_malformed() {
        for text in [r#"{"type":"renegotiate"}"#, r#"{"type":"offer"}"#, "not json"] {
            let err = Envelope::from_json(text).unwrap_err();
            assert_eq!(err.error_code(), "MALFORMED_PAYLOAD", "{text}");
        }
    }

    #[tokio::test]
    async fn memory_pair_delivers_in_order() {
        let ((mut a, _a_in), (_b, mut b_in)) = memory_pair();
        a.send(Envelope::Offer { sdp: "v=0\r\n".into() }).await.unwrap();
        a.send(Envelope::Close).await.unwrap();

        assert_eq!(b_in.recv().await.unwrap().unwrap().kind(), "offer");
        assert_eq!(b_in.recv().await.unwrap().unwrap(), Envelope::Close);
    }

    #[tokio::test]
    async fn memory_endpoint_closes_when_peer_inbound_drops() {
        let ((mut a, _a_in), (_b, b_in)) = memory_pair();
        assert!(a.is_open());
        drop(b_in);
        assert!(!a.is_open());
        assert!(matches!(
            a.send(Envelope::Close).await,
            Err(PeerlinkError::Transport(_))
        ));
    }
}
