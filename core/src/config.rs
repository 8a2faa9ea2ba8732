/*
 * config.rs
 * Copyright (C) 2026 The Mailboat Contributors
 *
 * This file is part of Mailboat, a self-hosted mail server.
 *
 * Mailboat is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Mailboat is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Mailboat.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Entry-object configuration. How these values are loaded (files,
//! flags, environment) is the embedder's business; this is only the
//! validated shape.

use std::sync::Arc;

use tokio_rustls::rustls::ServerConfig;

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    MissingHostname,
    MissingDomains,
    MissingDatabasePath,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingHostname => write!(f, "hostname must not be empty"),
            ConfigError::MissingDomains => write!(f, "mydomains must name at least one domain"),
            ConfigError::MissingDatabasePath => write!(f, "database_path must not be empty"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone)]
pub struct MailboatConfig {
    /// This server's name: SMTP greeting, message-id generation, and
    /// the listener bind address.
    pub hostname: String,
    /// Domains considered local.
    pub mydomains: Vec<String>,
    /// Filesystem path of the embedded database, or `:mem:`.
    pub database_path: String,
    /// SMTP listener port; 0 picks a free one.
    pub smtpd_port: u16,
    /// IMAP listener port; 0 picks a free one.
    pub imapd_port: u16,
    /// Suppress AUTH on plaintext SMTP sessions. Disable only for test
    /// configurations.
    pub auth_require_tls: bool,
    /// `(address, port)` pairs for the HTTP API gateway; `None` binds
    /// all interfaces.
    pub http_api_gate_binds: Vec<(Option<String>, u16)>,
    /// Server-side TLS for STARTTLS, when configured.
    pub tls: Option<Arc<ServerConfig>>,
}

impl MailboatConfig {
    pub fn new(
        hostname: impl Into<String>,
        mydomains: Vec<String>,
        database_path: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            mydomains,
            database_path: database_path.into(),
            smtpd_port: 8025,
            imapd_port: 8143,
            auth_require_tls: true,
            http_api_gate_binds: Vec::new(),
            tls: None,
        }
    }

    /// Missing required configuration is fatal: the process must refuse
    /// to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::MissingHostname);
        }
        if self.mydomains.iter().all(|d| d.trim().is_empty()) {
            return Err(ConfigError::MissingDomains);
        }
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::MissingDatabasePath);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ports_and_tls_policy() {
        let config = MailboatConfig::new("foo.bar", vec!["foo.bar".to_string()], ":mem:");
        assert_eq!(config.smtpd_port, 8025);
        assert!(config.auth_require_tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_required_values_refuse_startup() {
        let config = MailboatConfig::new("", vec!["foo.bar".to_string()], ":mem:");
        assert_eq!(config.validate(), Err(ConfigError::MissingHostname));
        let config = MailboatConfig::new("foo.bar", Vec::new(), ":mem:");
        assert_eq!(config.validate(), Err(ConfigError::MissingDomains));
        let config = MailboatConfig::new("foo.bar", vec!["foo.bar".to_string()], "");
        assert_eq!(config.validate(), Err(ConfigError::MissingDatabasePath));
    }
}
