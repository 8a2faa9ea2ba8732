/*
 * mod.rs
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

//! RFC 5322 message handling: the header-preserving message type that
//! the SMTP server, the queue and the mail store pass around.
//!
//! The parser is deliberately lenient (headers until the first blank
//! line, unfolding per RFC 5322 section 2.2.3); the body is kept
//! verbatim so a stored message replays byte-compatibly.

pub mod address;

pub use address::{parse_address_list, EmailAddress};

use uuid::Uuid;

/// A parsed RFC 5322 message: ordered headers plus the raw body.
///
/// Header lookups are case-insensitive; insertion order is preserved so
/// serialisation round-trips. `Clone` gives the deep per-recipient copy
/// the transfer agent needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    headers: Vec<(String, String)>,
    body: String,
}

impl MailMessage {
    /// Create an empty message (no headers, empty body).
    pub fn new() -> Self {
        Self { headers: Vec::new(), body: String::new() }
    }

    /// Parse raw RFC 5322 text. Accepts both CRLF and bare LF line
    /// endings; folded header lines are unfolded with a single space.
    pub fn parse(raw: &str) -> Self {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut lines = raw.split_inclusive('\n');
        let mut body = String::new();
        while let Some(line) = lines.next() {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                // blank separator line: everything after is the body
                body = lines.collect();
                break;
            }
            if (line.starts_with(' ') || line.starts_with('\t')) && !headers.is_empty() {
                if let Some(last) = headers.last_mut() {
                    last.1.push(' ');
                    last.1.push_str(trimmed.trim_start());
                }
                continue;
            }
            match trimmed.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
                None => {
                    // not a header line; the header block ended early
                    body = std::iter::once(line).chain(lines).collect();
                    break;
                }
            }
        }
        Self { headers, body }
    }

    /// First value of `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Remove every occurrence of `name`. Returns how many were removed.
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    /// Replace `name` with a single occurrence carrying `value`,
    /// appended at the end of the header block.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Insert `name: value` at the top of the header block (trace
    /// headers come first, like Received lines).
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        self.headers.insert(0, (name.to_string(), value.to_string()));
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Serialise to wire form: CRLF-terminated header lines, a blank
    /// line, then the body verbatim.
    pub fn to_wire_string(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

impl Default for MailMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MailMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire_string())
    }
}

/// Generate an RFC 5322 Message-Id for mail submitted through this
/// instance: `<uuid@hostname>`.
pub fn generate_message_id(hostname: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4(), hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "From: alyx@foo.bar\r\nTo: freeman@foo.bar\r\nSubject: Hello,\r\n Freeman\r\n\r\nbody line one\r\nbody line two\r\n";

    #[test]
    fn parse_headers_and_body() {
        let msg = MailMessage::parse(SAMPLE);
        assert_eq!(msg.header("from"), Some("alyx@foo.bar"));
        assert_eq!(msg.header("TO"), Some("freeman@foo.bar"));
        assert_eq!(msg.header("Subject"), Some("Hello, Freeman"));
        assert_eq!(msg.body(), "body line one\r\nbody line two\r\n");
    }

    #[test]
    fn wire_round_trip() {
        let msg = MailMessage::parse(SAMPLE);
        let again = MailMessage::parse(&msg.to_wire_string());
        assert_eq!(msg, again);
    }

    #[test]
    fn set_header_replaces_all_occurrences() {
        let mut msg = MailMessage::parse("Bcc: a@x\r\nBcc: b@x\r\n\r\n");
        msg.set_header("Bcc", "c@x");
        assert_eq!(msg.headers().filter(|(n, _)| *n == "Bcc").count(), 1);
        assert_eq!(msg.header("bcc"), Some("c@x"));
    }

    #[test]
    fn prepend_puts_trace_header_first() {
        let mut msg = MailMessage::parse(SAMPLE);
        msg.prepend_header("X-Peer", "127.0.0.1");
        assert_eq!(msg.headers().next(), Some(("X-Peer", "127.0.0.1")));
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let msg = MailMessage::parse(SAMPLE);
        let mut copy = msg.clone();
        copy.set_header("Delivered-To", "freeman@foo.bar");
        assert!(!msg.has_header("Delivered-To"));
    }

    #[test]
    fn generated_message_id_carries_hostname() {
        let id = generate_message_id("foo.bar");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@foo.bar>"));
    }

    #[test]
    fn lf_only_input_parses_the_same_headers() {
        let msg = MailMessage::parse("From: a@b\nTo: c@d\n\nbody\n");
        assert_eq!(msg.header("From"), Some("a@b"));
        assert_eq!(msg.body(), "body\n");
    }
}
