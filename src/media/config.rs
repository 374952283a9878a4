#![forbid(unsafe_code)]

// Configuration for media workers, routers, and WebRTC transports.

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Main media engine configuration.
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub transport: WebRtcTransportConfig,
}

/// Worker pool configuration. The pool never leaves `[min_workers, max_workers]`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let max_workers = num_cpus::get().max(1);
        Self {
            min_workers: max_workers.min(2),
            max_workers,
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 59999,
        }
    }
}

impl WorkerConfig {
    /// Overrides the pool floor, clamped to `[1, max_workers]`.
    pub fn with_min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = min_workers.clamp(1, self.max_workers);
        self
    }

    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }
}

/// Router configuration with codec capabilities.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus audio plus VP8/H264 video. The server forwards without
    /// transcoding, so host and viewers must share at least one of these.
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(111),
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("minptime", 10_u32.into()),
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: Some(96),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: Some(102),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("level-asymmetry-allowed", 1_u32.into()),
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "42e01f".into()),
                ]),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
        ]
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport configuration.
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<ListenInfo>,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenInfo {
                protocol: Protocol::Udp,
                ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
                announced_address: None,
                port: None,
                port_range: None,
                flags: None,
                send_buffer_size: None,
                recv_buffer_size: None,
                expose_internal_ip: false,
            }],
            initial_available_outgoing_bitrate: 600_000,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the publicly announced address used in ICE candidates. Unset
    /// means local-only (development mode).
    pub fn with_announced_ip(mut self, announced: IpAddr) -> Self {
        if let Some(listen_ip) = self.listen_ips.first_mut() {
            listen_ip.announced_address = Some(announced.to_string());
        }
        self
    }

    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let listen_info = self.listen_ips.first().cloned().unwrap_or_else(|| ListenInfo {
            protocol: Protocol::Udp,
            ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_address: None,
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        });
        WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(listen_info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_bounds_hold() {
        let config = WorkerConfig::default();
        assert!(config.min_workers >= 1);
        assert!(config.min_workers <= config.max_workers);
        assert!(config.min_workers <= 2);
    }

    #[test]
    fn min_workers_override_is_clamped() {
        let config = WorkerConfig::default();
        let max = config.max_workers;
        assert_eq!(config.clone().with_min_workers(0).min_workers, 1);
        assert_eq!(config.with_min_workers(usize::MAX).min_workers, max);
    }

    #[test]
    fn announced_ip_lands_in_listen_info() {
        let config =
            WebRtcTransportConfig::default().with_announced_ip("203.0.113.7".parse().unwrap());
        assert_eq!(
            config.listen_ips[0].announced_address.as_deref(),
            Some("203.0.113.7")
        );
    }
}
