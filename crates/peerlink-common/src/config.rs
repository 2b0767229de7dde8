//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > peerlink.toml > defaults

use serde::Deserialize;

/// Load the application configuration from `.env`, `peerlink.toml` and the environment.
///
/// Called once at startup; the result is passed down to whatever needs it.
pub fn init() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(None)?;
    tracing::debug!(
        signaling = %app_config.signaling.url,
        exclusions = ?app_config.negotiation.video_codec_exclusions,
        "Configuration loaded"
    );
    Ok(app_config)
}

/// Build a configuration without reading `.env`.
///
/// `inline_toml`, when given, is layered between the config file and the
/// environment; tests use it instead of writing files.
pub fn load(inline_toml: Option<&str>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder()
        // Defaults
        .set_default("signaling.url", "ws://127.0.0.1:8080/ws")?
        .set_default("negotiation.video_codec_exclusions", vec!["VP8", "VP9"])?
        .set_default("negotiation.receive_audio", true)?
        .set_default("negotiation.receive_video", true)?
        .set_default("ice.servers", vec!["stun:stun.l.google.com:19302"])?
        .set_default("media.bind_ip", "127.0.0.1")?
        .set_default("media.track_assembly", "shared_stream")?
        .set_default("data_channel.label", "serial")?
        // Optional config file
        .add_source(config::File::with_name("peerlink").required(false));

    if let Some(toml) = inline_toml {
        builder = builder.add_source(config::File::from_str(toml, config::FileFormat::Toml));
    }

    let cfg = builder
        // Environment variables (PEERLINK__SIGNALING__URL, PEERLINK__MEDIA__BIND_IP, etc.)
        .add_source(
            config::Environment::with_prefix("PEERLINK")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("negotiation.video_codec_exclusions")
                .with_list_parse_key("ice.servers")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub negotiation: NegotiationConfig,
    pub ice: IceConfig,
    pub media: MediaConfig,
    pub data_channel: DataChannelConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling relay (e.g. `ws://robot.local:8080/ws`).
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NegotiationConfig {
    /// RTP map encoding names stripped from every offer before it is sent.
    pub video_codec_exclusions: Vec<String>,
    pub receive_audio: bool,
    pub receive_video: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    /// STUN server URLs. The bundled engine only gathers host candidates, so
    /// these are advisory for engines that support server reflexive gathering.
    pub servers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// Local address the engine binds its UDP socket to; becomes the host candidate.
    pub bind_ip: String,
    pub track_assembly: TrackAssembly,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataChannelConfig {
    pub label: String,
}

/// How received tracks are handed to the render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackAssembly {
    /// One stream is attached up front and every track is added to it.
    #[default]
    SharedStream,
    /// A new stream holding all tracks so far is attached on every track.
    /// Needed by renderers that do not observe tracks added after attach.
    RebuildPerTrack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_exclude_vp8_and_vp9() {
        let cfg = load(None).expect("defaults should deserialize");
        assert_eq!(cfg.negotiation.video_codec_exclusions, vec!["VP8", "VP9"]);
        assert!(cfg.negotiation.receive_audio);
        assert!(cfg.negotiation.receive_video);
        assert_eq!(cfg.data_channel.label, "serial");
        assert_eq!(cfg.media.track_assembly, TrackAssembly::SharedStream);
    }

    #[test]
    fn inline_toml_overrides_defaults() {
        let cfg = load(Some(
            r#"
            [negotiation]
            video_codec_exclusions = ["H264"]
            receive_audio = false

            [media]
            track_assembly = "rebuild_per_track"
            "#,
        ))
        .expect("inline config should deserialize");

        assert_eq!(cfg.negotiation.video_codec_exclusions, vec!["H264"]);
        assert!(!cfg.negotiation.receive_audio);
        assert!(cfg.negotiation.receive_video);
        assert_eq!(cfg.media.track_assembly, TrackAssembly::RebuildPerTrack);
    }
}
