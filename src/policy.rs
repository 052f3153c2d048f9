//! Per-call behavior policy
//!
//! An immutable snapshot of user-configured behavior, taken when an operation
//! starts. The host application owns the settings store; the core only reads
//! the snapshot it is handed and never writes it back.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PhoneError;

/// Auto-answer behavior for incoming calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AutoAnswer {
    /// Never answer automatically
    #[default]
    Off,
    /// Answer as soon as the call arrives
    Immediate,
    /// Answer after the given number of seconds if not handled manually
    AfterSeconds(u32),
}

impl AutoAnswer {
    /// Delay before the auto-answer timer fires, `None` when disabled
    pub fn delay(&self) -> Option<Duration> {
        match self {
            AutoAnswer::Off => None,
            AutoAnswer::Immediate => Some(Duration::ZERO),
            AutoAnswer::AfterSeconds(secs) => Some(Duration::from_secs(u64::from(*secs))),
        }
    }
}

impl FromStr for AutoAnswer {
    type Err = PhoneError;

    // Settings strings as the host stores them: "off", "immediate", "3sec"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "off" | "" => Ok(AutoAnswer::Off),
            "immediate" => Ok(AutoAnswer::Immediate),
            other => other
                .strip_suffix("sec")
                .and_then(|n| n.parse::<u32>().ok())
                .map(AutoAnswer::AfterSeconds)
                .ok_or_else(|| {
                    PhoneError::Configuration(format!("Invalid auto-answer setting: {other}"))
                }),
        }
    }
}

impl std::fmt::Display for AutoAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutoAnswer::Off => write!(f, "off"),
            AutoAnswer::Immediate => write!(f, "immediate"),
            AutoAnswer::AfterSeconds(secs) => write!(f, "{secs}sec"),
        }
    }
}

impl TryFrom<String> for AutoAnswer {
    type Error = PhoneError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AutoAnswer> for String {
    fn from(value: AutoAnswer) -> Self {
        value.to_string()
    }
}

/// How DTMF tones are carried to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DtmfMethod {
    /// Let the transport pick
    #[default]
    Auto,
    /// Force tones into the audio stream
    Inband,
    /// Force the signaling channel
    Signaling,
}

impl FromStr for DtmfMethod {
    type Err = PhoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" | "" => Ok(DtmfMethod::Auto),
            // rfc2833 travels in the RTP stream, info over SIP signaling
            "inband" | "rfc2833" => Ok(DtmfMethod::Inband),
            "signaling" | "info" => Ok(DtmfMethod::Signaling),
            other => Err(PhoneError::Configuration(format!(
                "Invalid DTMF method: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for DtmfMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DtmfMethod::Auto => write!(f, "auto"),
            DtmfMethod::Inband => write!(f, "inband"),
            DtmfMethod::Signaling => write!(f, "signaling"),
        }
    }
}

impl TryFrom<String> for DtmfMethod {
    type Error = PhoneError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DtmfMethod> for String {
    fn from(value: DtmfMethod) -> Self {
        value.to_string()
    }
}

/// One ICE server entry for NAT traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Constraints for local audio capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Specific capture device, or the platform default
    pub device_id: Option<String>,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_id: None,
        }
    }
}

/// Immutable per-call snapshot of user-configured behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallPolicy {
    /// ICE servers for the media path
    pub ice_servers: Vec<IceServer>,

    /// Local capture constraints
    pub audio_constraints: AudioConstraints,

    /// Preferred audio codec ids, in preference order
    pub enabled_codecs: Vec<String>,

    /// DTMF transport selection
    pub dtmf_method: DtmfMethod,

    /// Auto-answer behavior for incoming calls
    pub auto_answer: AutoAnswer,

    /// Record every call from the moment it connects
    pub call_recording: bool,

    /// Force-reject all incoming calls
    pub do_not_disturb: bool,

    /// Ringtone and key-click feedback
    pub sound_events: bool,

    /// System notifications for incoming calls
    pub notifications: bool,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            audio_constraints: AudioConstraints::default(),
            enabled_codecs: vec![
                "opus".to_string(),
                "g722".to_string(),
                "pcmu".to_string(),
                "pcma".to_string(),
            ],
            dtmf_method: DtmfMethod::Auto,
            auto_answer: AutoAnswer::Off,
            call_recording: false,
            do_not_disturb: false,
            sound_events: true,
            notifications: true,
        }
    }
}
