//! Text payloads over the secondary data channel.
//!
//! The remote device reports the state of its UV lamp as JSON frames:
//! `{"status":"detect","hours":12,"minutes":5}`.

use crate::engine::{DataChannelHandle, ReadyState};
use peerlink_common::{PeerlinkError, PeerlinkResult};
use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LampStatus {
    /// Lamp switched off because a person was detected.
    PersonDetected,
    /// Lamp switched off with the physical button.
    SwitchedOff,
    /// Lamp is on. Carries the raw status string the device sent.
    Irradiating(String),
}

impl LampStatus {
    fn from_wire(status: String) -> Self {
        match status.as_str() {
            "detect" => LampStatus::PersonDetected,
            "OFF" => LampStatus::SwitchedOff,
            _ => LampStatus::Irradiating(status),
        }
    }
}

impl fmt::Display for LampStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LampStatus::PersonDetected => f.write_str("lamp off: person detected"),
            LampStatus::SwitchedOff => f.write_str("lamp off: button pressed"),
            LampStatus::Irradiating(_) => f.write_str("irradiating"),
        }
    }
}

/// One decoded status frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: LampStatus,
    /// Cumulative irradiation time.
    pub hours: u32,
    pub minutes: u32,
}

// Devices have been seen sending the counters both as numbers and as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Count {
    Number(u32),
    Text(String),
}

impl Count {
    fn value(self, field: &str) -> PeerlinkResult<u32> {
        match self {
            Count::Number(n) => Ok(n),
            Count::Text(s) => s
                .trim()
                .parse()
                .map_err(|e| PeerlinkError::malformed("status frame", format!("{field}: {e}"))),
        }
    }
}

#[derive(Deserialize)]
struct WireStatus {
    status: String,
    hours: Count,
    minutes: Count,
}

impl StatusUpdate {
    pub fn decode(bytes: &[u8]) -> PeerlinkResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| PeerlinkError::malformed("status frame", e))?;
        let wire: WireStatus = serde_json::from_str(text)
            .map_err(|e| PeerlinkError::malformed("status frame", e))?;

        Ok(Self {
            status: LampStatus::from_wire(wire.status),
            hours: wire.hours.value("hours")?,
            minutes: wire.minutes.value("minutes")?,
        })
    }

    /// Human-readable line for display.
    pub fn summary(&self) -> String {
        format!(
            "{} | total irradiation {}h {}m",
            self.status, self.hours, self.minutes
        )
    }
}

type StatusHandler = Box<dyn FnMut(&StatusUpdate) + Send>;

/// Bridges text payloads to the data channel of the current session.
#[derive(Default)]
pub struct DataChannelBridge {
    channel: Option<DataChannelHandle>,
    handler: Option<StatusHandler>,
}

impl fmt::Debug for DataChannelBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelBridge")
            .field("channel", &self.channel.as_ref().map(|c| c.label()))
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl DataChannelBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, channel: DataChannelHandle) {
        tracing::debug!(label = channel.label(), "Data channel attached");
        self.channel = Some(channel);
    }

    pub fn detach(&mut self) -> Option<DataChannelHandle> {
        self.channel.take()
    }

    pub fn is_open(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|c| c.ready_state() == ReadyState::Open)
    }

    /// Write `text` if the channel is attached and open. Otherwise does nothing.
    /// Returns whether the frame was queued.
    pub fn send(&self, text: &str) -> bool {
        let Some(channel) = self.channel.as_ref().filter(|_| self.is_open()) else {
            tracing::debug!("Data channel not open, dropping outbound text");
            return false;
        };
        match channel.send(text.as_bytes().to_vec()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Data channel write failed");
                false
            }
        }
    }

    /// Register the handler called with every decoded status frame.
    pub fn on_message(&mut self, handler: impl FnMut(&StatusUpdate) + Send + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Decode one inbound frame and hand it to the handler.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> PeerlinkResult<StatusUpdate> {
        let update = StatusUpdate::decode(bytes)?;
        if let Some(handler) = self.handler.as_mut() {
            handler(&update);
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::{mpsc, watch};

    #[test]
    fn decodes_the_three_lamp_states() {
        let detect = StatusUpdate::decode(br#"{"status":"detect","hours":3,"minutes":12}"#).unwrap();
        assert_eq!(detect.status, LampStatus::PersonDetected);
        assert_eq!((detect.hours, detect.minutes), (3, 12));

        let off = StatusUpdate::decode(br#"{"status":"OFF","hours":0,"minutes":0}"#).unwrap();
        assert_eq!(off.status, LampStatus::SwitchedOff);

        let on = StatusUpdate::decode(br#"{"status":"ON","hours":"10","minutes":"59"}"#).unwrap();
        assert_eq!(on.status, LampStatus::Irradiating("ON".into()));
        assert_eq!(on.summary(), "irradiating | total irradiation 10h 59m");
    }

    #[test]
    fn status_match_is_case_sensitive() {
        let update = StatusUpdate::decode(br#"{"status":"off","hours":1,"minutes":2}"#).unwrap();
        assert_eq!(update.status, LampStatus::Irradiating("off".into()));
    }

    #[test]
    fn malformed_frames_are_reported() {
        let frames: [&[u8]; 4] = [
            b"\xff\xfe",
            b"not json",
            br#"{"status":"detect"}"#,
            br#"{"status":"detect","hours":"ten","minutes":0}"#,
        ];
        for frame in frames {
            let err = StatusUpdate::decode(frame).unwrap_err();
            assert!(matches!(err, PeerlinkError::MalformedPayload { .. }), "{err}");
        }
    }

    #[test]
    fn send_is_a_no_op_until_open() {
        let mut bridge = DataChannelBridge::new();
        assert!(!bridge.send("forward"));

        let (state_tx, state_rx) = watch::channel(ReadyState::Connecting);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        bridge.attach(DataChannelHandle::new("serial", state_rx, out_tx));
        assert!(!bridge.send("forward"));

        state_tx.send(ReadyState::Open).unwrap();
        assert!(bridge.send("forward"));
        assert_eq!(out_rx.try_recv().unwrap(), b"forward");
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn handler_sees_every_decoded_frame() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut bridge = DataChannelBridge::new();
        bridge.on_message(move |update| sink.lock().unwrap().push(update.summary()));

        bridge
            .handle_frame(br#"{"status":"detect","hours":1,"minutes":30}"#)
            .unwrap();
        assert!(bridge.handle_frame(b"{}").is_err());

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["lamp off: person detected | total irradiation 1h 30m".to_string()]
        );
    }
}
