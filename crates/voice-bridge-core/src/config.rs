//! Operational configuration surface: SIP account, media features, jitter
//! buffer, RTP port range, and session parameters.
//!
//! Defaults mirror the original telephony endpoint's tuning exactly (jitter
//! buffer depth, RTP port range, session timers) since they were chosen to
//! keep ghost-dialog and latency behavior stable in production.

use std::time::Duration;

/// SIP account configuration: identity, registrar, transport.
#[derive(Debug, Clone)]
pub struct SipAccountConfig {
    /// Account SIP URI.
    pub uri: String,
    /// Registrar URI.
    pub registrar: String,
    /// Authentication credentials, if required by the registrar.
    pub credentials: Option<SipCredentials>,
    /// Local transport port.
    pub transport_port: u16,
}

/// SIP digest authentication credentials.
#[derive(Debug, Clone)]
pub struct SipCredentials {
    /// Auth realm.
    pub realm: String,
    /// Auth username.
    pub username: String,
    /// Auth password.
    pub password: String,
}

/// Aggressive SIP session timers, to avoid ghost calls outliving their media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimerConfig {
    /// Whether session timer refresh happens only on the SIP signaling thread.
    pub main_thread_only: bool,
    /// NAT type hint encoded into the SDP.
    pub nat_type_in_sdp: i32,
    /// Session timer "refresher" role (UAC/UAS/either).
    pub timer_use: i32,
    /// Minimum acceptable `Session-Expires` value, seconds.
    pub timer_min_se: u32,
    /// Requested `Session-Expires` value, seconds.
    pub timer_sess_expires: u32,
}

impl Default for SessionTimerConfig {
    fn default() -> Self {
        Self {
            main_thread_only: false,
            nat_type_in_sdp: 0,
            timer_use: 3,
            timer_min_se: 90,
            timer_sess_expires: 180,
        }
    }
}

/// Jitter buffer tuning to keep latency predictable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBufferConfig {
    /// Initial prefetch, frames.
    pub jb_init: u32,
    /// Minimum prefetch, frames.
    pub jb_min_pre: u32,
    /// Maximum prefetch, frames.
    pub jb_max_pre: u32,
    /// Hard maximum depth, frames.
    pub jb_max: u32,
    /// Sound-device auto-close delay, milliseconds (0 disables auto-close).
    pub snd_auto_close_time: u32,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            jb_init: 1,
            jb_min_pre: 1,
            jb_max_pre: 4,
            jb_max: 10,
            snd_auto_close_time: 0,
        }
    }
}

/// Explicit RTP port allocation range, for predictable firewall rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPortConfig {
    /// First port in the allocatable range.
    pub start_port: u16,
    /// Number of ports in the range.
    pub port_range: u16,
}

impl Default for RtpPortConfig {
    fn default() -> Self {
        Self {
            start_port: 10_000,
            port_range: 10_000,
        }
    }
}

/// Extra media capability toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFeatureConfig {
    /// Enable ICE candidate gathering (only needed for nomadic/NAT-traversal deployments).
    pub enable_ice: bool,
    /// Multiplex RTP and RTCP on a single port.
    pub enable_rtcp_mux: bool,
    /// Disable the native VAD (the realtime model does its own semantic VAD).
    pub no_vad: bool,
    /// Suppress host ICE candidates (keep only reflexive/relay candidates).
    pub ice_no_host_cands: bool,
    /// Echo-canceller tail length, milliseconds (0 disables AEC).
    pub ec_tail_len: u32,
    /// SRTP negotiation policy (0=disabled, 1=optional, 2=mandatory).
    pub srtp_opt: u8,
}

impl Default for MediaFeatureConfig {
    fn default() -> Self {
        Self {
            enable_ice: false,
            enable_rtcp_mux: true,
            no_vad: true,
            ice_no_host_cands: true,
            ec_tail_len: 0,
            srtp_opt: 1,
        }
    }
}

impl MediaFeatureConfig {
    /// Build the media feature set for a deployment, toggling ICE for nomadic (NAT-heavy) networks.
    pub fn for_deployment(nomadic_mode: bool) -> Self {
        Self {
            enable_ice: nomadic_mode,
            ..Self::default()
        }
    }
}

/// Realtime model session parameters.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Model identifier to request.
    pub model: String,
    /// Voice identifier for synthesized speech, if the model supports selection.
    pub voice: Option<String>,
    /// System instructions sent at session open.
    pub instructions: String,
    /// When true, the assistant opens the conversation instead of waiting for caller speech.
    pub speak_first: bool,
}

/// Bound parameters for the Event Router, including the watchdog duration
/// left open by the original design (see SPEC_FULL.md Design Notes).
#[derive(Debug, Clone, Copy)]
pub struct EventRouterConfig {
    /// How long to wait for the first audio delta after `response.created` before re-forcing.
    pub response_watchdog: Duration,
    /// Maximum number of concurrently in-flight inbound-audio hook tasks.
    pub max_pending_hooks: usize,
}

impl Default for EventRouterConfig {
    fn default() -> Self {
        Self {
            response_watchdog: Duration::from_millis(100),
            max_pending_hooks: 8,
        }
    }
}

/// First-frame-requested barrier timeout before proceeding without `speak_first`.
pub const FIRST_FRAME_BARRIER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default session-open connector timeout.
pub const SESSION_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_buffer_defaults_match_production_tuning() {
        let jb = JitterBufferConfig::default();
        assert_eq!(jb.jb_max, 10);
        assert_eq!(jb.jb_max_pre, 4);
    }

    #[test]
    fn media_features_toggle_ice_for_nomadic_mode() {
        assert!(MediaFeatureConfig::for_deployment(true).enable_ice);
        assert!(!MediaFeatureConfig::for_deployment(false).enable_ice);
    }

    #[test]
    fn rtp_port_range_matches_production_defaults() {
        let rtp = RtpPortConfig::default();
        assert_eq!(rtp.start_port, 10_000);
        assert_eq!(rtp.port_range, 10_000);
    }
}
