//! SIP account configuration
//!
//! The account record supplied by the caller for each registration attempt.
//! The core validates it before any transport is created and does not retain
//! it beyond the active registration.

use serde::{Deserialize, Serialize};

use crate::{PhoneError, PhoneResult};

/// Credentials and addressing for one SIP account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    /// Registrar address, e.g. "wss://sip.example.com:7443" or "sip.example.com"
    pub server: String,

    /// SIP domain; derived from `server` when empty
    pub domain: String,

    /// Authentication username
    pub username: String,

    /// Authentication password
    pub password: String,

    /// Display name for outgoing requests; falls back to `username`
    pub display_name: String,
}

impl Account {
    /// Validate the fields required before opening a transport
    pub fn validate(&self) -> PhoneResult<()> {
        if self.server.trim().is_empty() {
            return Err(PhoneError::Configuration("SIP server is required".into()));
        }
        if self.username.trim().is_empty() {
            return Err(PhoneError::Configuration("SIP username is required".into()));
        }
        if self.password.is_empty() {
            return Err(PhoneError::Configuration("SIP password is required".into()));
        }
        Ok(())
    }

    /// SIP domain for URIs: the explicit domain, or the server address with
    /// protocol, path and port stripped
    pub fn sip_domain(&self) -> String {
        if !self.domain.trim().is_empty() {
            return self.domain.trim().to_string();
        }
        let server = self.server.trim();
        let server = server
            .strip_prefix("wss://")
            .or_else(|| server.strip_prefix("ws://"))
            .unwrap_or(server);
        let server = server.split('/').next().unwrap_or(server);
        server.split(':').next().unwrap_or(server).to_string()
    }

    /// The address-of-record for this account
    pub fn uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.sip_domain())
    }

    /// Display name, defaulting to the username
    pub fn display_name(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.username
        } else {
            &self.display_name
        }
    }
}
