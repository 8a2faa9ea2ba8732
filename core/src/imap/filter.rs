/*
 * filter.rs
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

//! Per-identity filter storage. Scripts are stored and listed so a
//! client can manage them; evaluation during delivery is not part of
//! this server.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct FilterSet {
    scripts: Mutex<HashMap<String, Vec<u8>>>,
    active: Mutex<Option<String>>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: impl Into<String>, script: Vec<u8>) {
        self.scripts.lock().unwrap().insert(name.into(), script);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.scripts.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Mark `name` active. False when no such script is stored.
    pub fn set_active(&self, name: &str) -> bool {
        if !self.scripts.lock().unwrap().contains_key(name) {
            return false;
        }
        *self.active.lock().unwrap() = Some(name.to_string());
        true
    }

    pub fn active(&self) -> Option<String> {
        self.active.lock().unwrap().clone()
    }
}
