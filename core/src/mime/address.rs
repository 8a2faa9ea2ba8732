/*
 * address.rs
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

//! RFC 5322 mailbox addresses and address-list parsing (To, Cc, Bcc).

/// An RFC 5322 mailbox: optional display name plus local-part@domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub display_name: Option<String>,
    pub local_part: String,
    pub domain: String,
}

impl EmailAddress {
    pub fn new(
        display_name: Option<impl Into<String>>,
        local_part: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.map(|s| s.into()),
            local_part: local_part.into(),
            domain: domain.into(),
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    /// The host part of the address; routing decisions compare this
    /// against the configured local domains.
    pub fn hostname(&self) -> &str {
        &self.domain
    }

    /// Full mailbox address: local-part@domain.
    pub fn address(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.display_name {
            Some(ref dn) if !dn.is_empty() => write!(f, "{} <{}>", dn, self.address()),
            _ => write!(f, "{}", self.address()),
        }
    }
}

/// Split a header value into top-level comma-separated items, honouring
/// quoted strings and angle-bracket groups.
fn split_list_items(value: &str) -> Vec<&str> {
    let bytes = value.as_bytes();
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quotes => i += 1,
            b'"' => in_quotes = !in_quotes,
            b'<' if !in_quotes => in_angle = true,
            b'>' if !in_quotes => in_angle = false,
            b',' if !in_quotes && !in_angle => {
                items.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    items.push(&value[start..]);
    items
}

/// Split `spec` at the `@` sign into (local-part, domain). Rejects specs
/// with a missing side.
fn split_addr_spec(spec: &str) -> Option<(String, String)> {
    let spec = spec.trim();
    let at = spec.rfind('@')?;
    if at == 0 || at == spec.len() - 1 {
        return None;
    }
    let local = spec[..at].trim();
    let domain = spec[at + 1..].trim();
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local.to_string(), domain.to_string()))
}

/// Parse a single list item: `"Name" <a@b>`, `Name <a@b>`, `<a@b>` or `a@b`.
fn parse_one_mailbox(item: &str) -> Option<EmailAddress> {
    let item = item.trim();
    if item.is_empty() {
        return None;
    }
    if let Some(open) = item.find('<') {
        let close = item[open..].find('>')? + open;
        let (local, domain) = split_addr_spec(&item[open + 1..close])?;
        let mut phrase = item[..open].trim();
        if phrase.len() >= 2 && phrase.starts_with('"') && phrase.ends_with('"') {
            phrase = phrase[1..phrase.len() - 1].trim();
        }
        let display_name = if phrase.is_empty() { None } else { Some(phrase) };
        return Some(EmailAddress::new(display_name, local, domain));
    }
    let (local, domain) = split_addr_spec(item)?;
    Some(EmailAddress::new(None::<String>, local, domain))
}

/// Parse a comma-separated RFC 5322 address list. Entries that do not
/// parse as a mailbox address are skipped; only well-formed
/// local-part@domain mailboxes are returned.
pub fn parse_address_list(value: &str) -> Vec<EmailAddress> {
    split_list_items(value)
        .into_iter()
        .filter_map(parse_one_mailbox)
        .collect()
}
