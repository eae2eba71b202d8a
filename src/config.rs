#![forbid(unsafe_code)]

// Environment-driven configuration: HTTP server knobs, media defaults
// (worker count, port range, codec set), and optional TURN credential
// generation for coturn's time-limited REST scheme.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::types::{
    MediaKind, RtpCodecCapability, TransportOptions, WorkerSettings,
};

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_connections: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub num_workers: usize,
    pub rtc_port_range: RangeInclusive<u16>,
    pub listen_ip: IpAddr,
    /// Public address advertised in ICE candidates when running behind NAT.
    pub announced_address: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            rtc_port_range: 10000..=59999,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            initial_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: Some(1_500_000),
            media_codecs: default_media_codecs(),
        }
    }
}

impl MediaConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = std::env::var("NUM_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.num_workers = n.max(1);
        }
        if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
            if !ip.is_empty() {
                config.announced_address = Some(ip);
            }
        }
        config
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_port_range: self.rtc_port_range.clone(),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
            max_incoming_bitrate: self.max_incoming_bitrate,
        }
    }
}

/// Codec set every router negotiates: Opus for audio, VP8/VP9/H264 for
/// video and screen shares.
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = vec![
        "nack".to_string(),
        "nack pli".to_string(),
        "ccm fir".to_string(),
        "goog-remb".to_string(),
        "transport-cc".to_string(),
    ];
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: Some(111),
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::from([
                ("minptime".to_string(), json!(10)),
                ("useinbandfec".to_string(), json!(1)),
            ]),
            rtcp_feedback: vec!["transport-cc".to_string()],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: Some(96),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            preferred_payload_type: Some(98),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: Some(102),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::from([
                ("packetization-mode".to_string(), json!(1)),
                ("profile-level-id".to_string(), json!("42e01f")),
                ("level-asymmetry-allowed".to_string(), json!(1)),
            ]),
            rtcp_feedback: video_feedback,
        },
    ]
}

/// ICE server entry handed to clients alongside transport parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Time-limited TURN credentials per the coturn REST scheme
/// (`--use-auth-secret`): username is `expiry:peerId`, credential is
/// base64(HMAC-SHA1(secret, username)).
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub secret: String,
    pub ttl_secs: u64,
}

impl TurnConfig {
    /// None unless both TURN_URLS and TURN_SECRET are set.
    pub fn from_env() -> Option<Self> {
        let urls_str = std::env::var("TURN_URLS").ok()?;
        let secret = std::env::var("TURN_SECRET").ok()?;
        let ttl_secs = std::env::var("TURN_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(86400);
        let urls: Vec<String> = urls_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if urls.is_empty() {
            return None;
        }
        Some(Self {
            urls,
            secret,
            ttl_secs,
        })
    }

    pub fn ice_servers(&self, peer_id: &str) -> Vec<IceServer> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;
        let username = format!("{expiry}:{peer_id}");
        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes())
            .expect("hmac-sha1 accepts any key length");
        mac.update(username.as_bytes());
        let credential =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        vec![IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codecs_cover_audio_and_video() {
        let codecs = default_media_codecs();
        assert!(
            codecs
                .iter()
                .any(|c| c.mime_type == "audio/opus" && c.clock_rate == 48000)
        );
        assert!(
            codecs
                .iter()
                .filter(|c| c.kind == MediaKind::Video)
                .count()
                >= 3
        );
    }

    #[test]
    fn transport_options_carry_announced_address() {
        let config = MediaConfig {
            announced_address: Some("198.51.100.2".to_string()),
            ..MediaConfig::default()
        };
        let options = config.transport_options();
        assert_eq!(options.announced_address.as_deref(), Some("198.51.100.2"));
        assert_eq!(options.initial_available_outgoing_bitrate, 600_000);
    }

    #[test]
    fn turn_credentials_follow_rest_scheme() {
        let turn = TurnConfig {
            urls: vec!["turn:relay.example.net:3478".to_string()],
            secret: "north-remembers".to_string(),
            ttl_secs: 600,
        };
        let servers = turn.ice_servers("peer-7");
        assert_eq!(servers.len(), 1);
        let username = servers[0].username.as_deref().expect("username");
        let (expiry, peer) = username.split_once(':').expect("expiry:peer format");
        assert_eq!(peer, "peer-7");
        assert!(expiry.parse::<u64>().expect("numeric expiry") > 600);
        assert!(!servers[0].credential.as_deref().expect("credential").is_empty());
    }
}
