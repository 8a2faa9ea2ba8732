/*
 * tk.rs
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

//! Tokens and scopes.
//!
//! Currently defined scopes:
//!
//! - `act_as_user`
//! - `mail.read`, `mail.write`, `mail.send`
//! - `user.profile.read`, `user.profile.write`

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SCOPE_ACT_AS_USER: &str = "act_as_user";

/// A set of dotted permission strings with prefix-cover semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    scope: BTreeSet<String>,
}

impl Scope {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { scope: scopes.into_iter().map(Into::into).collect() }
    }

    /// Whether the permission area of `defined` covers `requesting`.
    ///
    /// Areas are split by `.`: `s1` covers `s1` and `s1.s2`, but `s1.s2`
    /// does not cover `s1` and `s1` never covers `s2`.
    pub fn covers(defined: &str, requesting: &str) -> bool {
        let mut defined = defined.split('.');
        let mut requesting = requesting.split('.');
        loop {
            match (defined.next(), requesting.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(d), Some(r)) if d != r => return false,
                _ => {}
            }
        }
    }

    /// Whether some member of this scope covers `requesting`.
    pub fn contains(&self, requesting: &str) -> bool {
        self.scope.iter().any(|s| Self::covers(s, requesting))
    }

    /// Whether every scope in `scopes` is covered by some member of this
    /// set.
    pub fn is_superset_of<'a, I>(&self, scopes: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        scopes.into_iter().all(|s| self.contains(s))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.scope.iter().map(String::as_str)
    }
}

/// A minted token. `appid` `"-1"` marks the native password grant;
/// `apprev` records the app-configuration revision the grant was made
/// against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub profileid: String,
    pub appid: String,
    pub apprev: String,
    pub scope: Vec<String>,
    #[serde(default)]
    pub expiration: Option<i64>,
}

impl TokenRecord {
    /// Create a token object (not yet stored). Empty `scope` defaults to
    /// `[act_as_user]`; `expiration_offset_seconds` counts from now.
    pub fn new(
        profileid: impl Into<String>,
        appid: Option<&str>,
        apprev: Option<&str>,
        scope: Vec<String>,
        expiration_offset_seconds: Option<i64>,
    ) -> Self {
        let scope = if scope.is_empty() {
            vec![SCOPE_ACT_AS_USER.to_string()]
        } else {
            scope
        };
        Self {
            token: Uuid::new_v4().to_string(),
            profileid: profileid.into(),
            appid: appid.unwrap_or("-1").to_string(),
            apprev: apprev.unwrap_or("").to_string(),
            scope,
            expiration: expiration_offset_seconds.map(|offset| Utc::now().timestamp() + offset),
        }
    }

    /// The granted scope as a `Scope` value (a copy; write back with
    /// `apply_new_scope`).
    pub fn scope_object(&self) -> Scope {
        Scope::new(self.scope.iter().cloned())
    }

    pub fn apply_new_scope(&mut self, scope: &Scope) {
        self.scope = scope.iter().map(str::to_string).collect();
    }

    /// A token is available while `expiration` is unset or still in the
    /// future.
    pub fn is_available(&self) -> bool {
        match self.expiration {
            None => true,
            Some(t) => t > Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_follows_dot_prefixes() {
        assert!(Scope::covers("s1", "s1"));
        assert!(Scope::covers("s1", "s1.s2"));
        assert!(!Scope::covers("s1.s2", "s1"));
        assert!(!Scope::covers("s1", "s2"));
        assert!(!Scope::covers("mail.read", "mail.write"));
    }

    #[test]
    fn scope_membership_uses_cover() {
        let scope = Scope::new(["a"]);
        assert!(scope.contains("a.b"));
        assert!(!scope.contains("b"));
    }

    #[test]
    fn superset_needs_every_query_scope_covered() {
        let scope = Scope::new(["mail", "user.profile.read"]);
        assert!(scope.is_superset_of(["mail.read", "mail.send"]));
        assert!(scope.is_superset_of(["user.profile.read"]));
        assert!(!scope.is_superset_of(["user.profile.write"]));
        assert!(!Scope::new([SCOPE_ACT_AS_USER]).is_superset_of(["mail"]));
    }

    #[test]
    fn empty_scope_defaults_to_act_as_user() {
        let token = TokenRecord::new("pid", None, None, Vec::new(), None);
        assert_eq!(token.scope, vec![SCOPE_ACT_AS_USER.to_string()]);
        assert_eq!(token.appid, "-1");
        assert_eq!(token.apprev, "");
    }

    #[test]
    fn availability_tracks_expiration() {
        let open = TokenRecord::new("pid", None, None, Vec::new(), None);
        assert!(open.is_available());
        let live = TokenRecord::new("pid", None, None, Vec::new(), Some(3600));
        assert!(live.is_available());
        let mut dead = TokenRecord::new("pid", None, None, Vec::new(), None);
        dead.expiration = Some(Utc::now().timestamp() - 1);
        assert!(!dead.is_available());
    }
}
