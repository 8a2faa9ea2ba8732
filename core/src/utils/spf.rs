/*
 * spf.rs
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

//! SPF checking helper. Exposed for submission-time policy hooks; the
//! core delivery pipeline does not enforce it.

use std::net::IpAddr;

use mail_auth::{spf::verify::SpfParameters, MessageAuthenticator, SpfResult};

#[derive(Debug)]
pub struct SpfError {
    pub message: String,
}

impl SpfError {
    fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl std::fmt::Display for SpfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SpfError {}

/// Outcome of an SPF evaluation: the result keyword plus the policy
/// explanation published by the sending domain (empty when none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfCheck {
    pub result: String,
    pub explanation: String,
}

fn result_keyword(result: SpfResult) -> &'static str {
    match result {
        SpfResult::Pass => "pass",
        SpfResult::Fail => "fail",
        SpfResult::SoftFail => "softfail",
        SpfResult::Neutral => "neutral",
        SpfResult::TempError => "temperror",
        SpfResult::PermError => "permerror",
        SpfResult::None => "none",
    }
}

/// Evaluate the SPF policy for `sender` as submitted from `client_ip`
/// with EHLO name `helo_domain`; `hostname` is this server's name used
/// in the evaluation context.
pub async fn check(
    client_ip: IpAddr,
    helo_domain: &str,
    hostname: &str,
    sender: &str,
) -> Result<SpfCheck, SpfError> {
    let resolver = MessageAuthenticator::new_system_conf().map_err(|e| SpfError::new(e.to_string()))?;
    let output = resolver
        .verify_spf(SpfParameters::verify(client_ip, helo_domain, hostname, sender))
        .await;
    Ok(SpfCheck {
        result: result_keyword(output.result()).to_string(),
        explanation: output.explanation().unwrap_or_default().to_string(),
    })
}
