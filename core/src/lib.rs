/*
 * lib.rs
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

//! Mailboat core: the mail transfer agent and everything it leans on.
//!
//! The crate is organised around `Mailboat`, the entry object which wires
//! a `StorageHub` (named record collections over one embedded database),
//! the `TransferAgent` (SMTP front-end, durable queue, delivery worker),
//! the `AuthProvider` (password and token checks) and the IMAP backend
//! binding that makes stored mail visible to a mail-user-agent session.

pub mod apigate;
pub mod config;
pub mod imap;
pub mod mailboat;
pub mod mailstore;
pub mod mime;
pub mod mta;
pub mod net;
pub mod storage;
pub mod storagehub;
pub mod usrsys;
pub mod utils;

pub use config::{ConfigError, MailboatConfig};
pub use mailboat::Mailboat;
pub use storagehub::StorageHub;
