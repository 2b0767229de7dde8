//! Structured session descriptions and codec exclusion.
//!
//! An [`SdpDocument`] is a line-oriented parse of an SDP blob: the session-level
//! lines followed by one [`MediaSection`] per `m=` line. Only the attributes the
//! codec filter needs are typed (`rtpmap`, `rtcp-fb`, `fmtp`); every other line is
//! kept verbatim so a document serializes back to exactly what was parsed.
//!
//! Codec removal works on payload-type sets rather than text substitution:
//!
//! ```text
//!   a=rtpmap:96 VP8/90000      ─┐ codec match → {96}
//!   a=fmtp:97 apt=96           ─┤ dependents  → {96, 97}
//!   a=rtcp-fb:96 nack          ─┤ dropped
//!   m=video 9 ... 96 97 102    ─┘ format list → 102
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Errors produced while parsing an SDP blob.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdpParseError {
    #[error("empty session description")]
    Empty,

    #[error("session description must start with a v= line, found {0:?}")]
    MissingVersion(String),

    #[error("line {line}: expected <type>=<value>, found {text:?}")]
    InvalidLine { line: usize, text: String },

    #[error("line {line}: invalid media description {text:?}")]
    InvalidMedia { line: usize, text: String },
}

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// A typed description handed to and from the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub document: SdpDocument,
}

impl SessionDescription {
    pub fn offer(document: SdpDocument) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            document,
        }
    }

    pub fn answer(document: SdpDocument) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            document,
        }
    }
}

/// A parsed session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpDocument {
    session: Vec<SdpLine>,
    media: Vec<MediaSection>,
}

/// One `m=` block and the lines that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    descriptor: MediaDescriptor,
    lines: Vec<SdpLine>,
}

/// The `m=<kind> <port> <proto> <fmt> ...` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub kind: String,
    pub port: String,
    pub proto: String,
    /// Codec preference list, most preferred first.
    pub formats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SdpLine {
    raw: String,
    attribute: Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Attribute {
    Rtpmap { payload: u8, encoding: String },
    RtcpFb { payload: u8 },
    Fmtp { payload: u8, apt: Option<u8> },
    Other,
}

impl Attribute {
    fn parse(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let Some((pt, codec)) = rest.split_once(' ') else {
                return Attribute::Other;
            };
            match pt.parse() {
                Ok(payload) => Attribute::Rtpmap {
                    payload,
                    encoding: codec.split('/').next().unwrap_or_default().trim().to_string(),
                },
                Err(_) => Attribute::Other,
            }
        } else if let Some(rest) = line.strip_prefix("a=rtcp-fb:") {
            // `a=rtcp-fb:* ...` applies to every payload type and never parses here.
            let pt = rest.split_whitespace().next().unwrap_or_default();
            match pt.parse() {
                Ok(payload) => Attribute::RtcpFb { payload },
                Err(_) => Attribute::Other,
            }
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            let (pt, params) = rest.split_once(' ').unwrap_or((rest, ""));
            let Ok(payload) = pt.parse() else {
                return Attribute::Other;
            };
            let apt = params
                .split(';')
                .filter_map(|param| param.trim().split_once('='))
                .find(|(key, _)| key.eq_ignore_ascii_case("apt"))
                .and_then(|(_, value)| value.trim().parse().ok());
            Attribute::Fmtp { payload, apt }
        } else {
            Attribute::Other
        }
    }

    fn payload(&self) -> Option<u8> {
        match self {
            Attribute::Rtpmap { payload, .. }
            | Attribute::RtcpFb { payload }
            | Attribute::Fmtp { payload, .. } => Some(*payload),
            Attribute::Other => None,
        }
    }
}

impl SdpLine {
    fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            attribute: Attribute::parse(raw),
        }
    }
}

fn is_well_formed(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b'='
}

impl MediaDescriptor {
    fn parse(line_no: usize, line: &str) -> Result<Self, SdpParseError> {
        let invalid = || SdpParseError::InvalidMedia {
            line: line_no,
            text: line.to_string(),
        };
        let mut parts = line.strip_prefix("m=").ok_or_else(invalid)?.split_whitespace();
        let kind = parts.next().ok_or_else(invalid)?.to_string();
        let port = parts.next().ok_or_else(invalid)?.to_string();
        let proto = parts.next().ok_or_else(invalid)?.to_string();
        let formats = parts.map(str::to_string).collect();

        Ok(Self {
            kind,
            port,
            proto,
            formats,
        })
    }
}

impl fmt::Display for MediaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.kind, self.port, self.proto)?;
        for format in &self.formats {
            write!(f, " {format}")?;
        }
        Ok(())
    }
}

impl SdpDocument {
    /// Parse an SDP blob. Accepts `\r\n` or `\n` line endings and skips blank lines.
    pub fn parse(text: &str) -> Result<Self, SdpParseError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
            .filter(|(_, line)| !line.trim().is_empty())
            .peekable();

        match lines.peek() {
            None => return Err(SdpParseError::Empty),
            Some((_, first)) if !first.starts_with("v=") => {
                return Err(SdpParseError::MissingVersion(first.to_string()));
            }
            Some(_) => {}
        }

        let mut session = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for (line_no, line) in lines {
            if !is_well_formed(line) {
                return Err(SdpParseError::InvalidLine {
                    line: line_no,
                    text: line.to_string(),
                });
            }

            if line.starts_with("m=") {
                media.push(MediaSection {
                    descriptor: MediaDescriptor::parse(line_no, line)?,
                    lines: Vec::new(),
                });
            } else if let Some(section) = media.last_mut() {
                section.lines.push(SdpLine::new(line));
            } else {
                session.push(SdpLine::new(line));
            }
        }

        Ok(Self { session, media })
    }

    /// Session-level lines, in order.
    pub fn session_lines(&self) -> impl Iterator<Item = &str> {
        self.session.iter().map(|l| l.raw.as_str())
    }

    pub fn media(&self) -> &[MediaSection] {
        &self.media
    }

    /// First media section of the given kind (`audio`, `video`, `application`).
    pub fn first_media(&self, kind: &str) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.descriptor.kind == kind)
    }

    /// Media kinds that appear in more than one section.
    pub fn duplicate_kinds(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for section in &self.media {
            let kind = section.descriptor.kind.as_str();
            if !seen.insert(kind) && !duplicates.contains(&kind) {
                duplicates.push(kind);
            }
        }
        duplicates
    }

    /// Remove every capability reference to `codec` (matched against the rtpmap
    /// encoding name, ignoring ASCII case) and return the rewritten document.
    ///
    /// Only the first section of each media kind is rewritten; later sections of
    /// a kind already seen keep their codecs. Returns an equal document when the
    /// codec is not advertised.
    pub fn remove_codec(&self, codec: &str) -> SdpDocument {
        let mut doc = self.clone();

        let duplicates = doc.duplicate_kinds();
        if !duplicates.is_empty() {
            tracing::warn!(
                codec,
                kinds = ?duplicates,
                "Multiple media sections of the same kind; only the first of each is filtered"
            );
        }

        // Each round drops at least the matched rtpmap line, so this terminates.
        while let Some((index, payload)) = doc.find_codec(codec) {
            let removed = doc.media[index].remove_payload_family(payload);
            tracing::debug!(
                codec,
                section = index,
                payload_types = ?removed,
                "Removed codec from session description"
            );
        }

        doc
    }

    fn find_codec(&self, codec: &str) -> Option<(usize, u8)> {
        let mut seen = HashSet::new();
        for (index, section) in self.media.iter().enumerate() {
            if !seen.insert(section.descriptor.kind.as_str()) {
                continue;
            }
            if let Some(payload) = section.payload_for(codec) {
                return Some((index, payload));
            }
        }
        None
    }
}

impl fmt::Display for SdpDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.session {
            write!(f, "{}\r\n", line.raw)?;
        }
        for section in &self.media {
            write!(f, "{}\r\n", section.descriptor)?;
            for line in &section.lines {
                write!(f, "{}\r\n", line.raw)?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for SdpDocument {
    type Err = SdpParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl MediaSection {
    pub fn kind(&self) -> &str {
        &self.descriptor.kind
    }

    pub fn descriptor(&self) -> &MediaDescriptor {
        &self.descriptor
    }

    /// Attribute lines of this section, verbatim.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|l| l.raw.as_str())
    }

    /// Encoding names from the rtpmap lines, in order of appearance.
    pub fn codec_names(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match &l.attribute {
                Attribute::Rtpmap { encoding, .. } => Some(encoding.as_str()),
                _ => None,
            })
            .collect()
    }

    fn payload_for(&self, codec: &str) -> Option<u8> {
        self.lines.iter().find_map(|l| match &l.attribute {
            Attribute::Rtpmap { payload, encoding } if encoding.eq_ignore_ascii_case(codec) => {
                Some(*payload)
            }
            _ => None,
        })
    }

    /// Drop `payload` and every payload type that declares it (transitively) as
    /// its associated type. Returns the removed identifiers.
    fn remove_payload_family(&mut self, payload: u8) -> Vec<u8> {
        let mut removed = vec![payload];
        let mut frontier = vec![payload];

        while let Some(parent) = frontier.pop() {
            for line in &self.lines {
                if let Attribute::Fmtp {
                    payload: dependent,
                    apt: Some(apt),
                } = line.attribute
                {
                    if apt == parent && !removed.contains(&dependent) {
                        removed.push(dependent);
                        frontier.push(dependent);
                    }
                }
            }
        }

        self.lines
            .retain(|l| l.attribute.payload().is_none_or(|p| !removed.contains(&p)));
        self.descriptor
            .formats
            .retain(|f| f.parse::<u8>().map_or(true, |p| !removed.contains(&p)));

        removed
    }
}

/// Codecs stripped from every locally generated offer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecExclusionPolicy {
    video_codec_exclusions: Vec<String>,
}

impl CodecExclusionPolicy {
    pub fn new<I, S>(codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            video_codec_exclusions: codecs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn codecs(&self) -> &[String] {
        &self.video_codec_exclusions
    }

    /// Apply every exclusion in configuration order.
    pub fn apply(&self, document: &SdpDocument) -> SdpDocument {
        self.video_codec_exclusions
            .iter()
            .fold(document.clone(), |doc, codec| doc.remove_codec(codec))
    }
}
