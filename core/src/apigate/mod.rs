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

//! The HTTP API gateway. Today it serves exactly one endpoint,
//! `GET /generate204`, as a liveness probe.
//!
//! Binds the configured `(address, port)` pairs; a random loopback port
//! is bound only when the configured list is empty.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

pub struct HttpApiGateway {
    http_binds: Vec<(Option<String>, u16)>,
    state: Mutex<Option<GatewayState>>,
}

struct GatewayState {
    local_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl HttpApiGateway {
    pub fn new(http_binds: Vec<(Option<String>, u16)>) -> Self {
        Self { http_binds, state: Mutex::new(None) }
    }

    /// Bind every configured address and start serving.
    pub async fn start(&self) -> Result<(), io::Error> {
        let mut binds = self.http_binds.clone();
        if binds.is_empty() {
            binds.push((Some("127.0.0.1".to_string()), 0));
        }
        let mut local_addrs = Vec::new();
        let mut tasks = Vec::new();
        for (address, port) in binds {
            let address = address.unwrap_or_else(|| "0.0.0.0".to_string());
            let listener = TcpListener::bind((address.as_str(), port)).await?;
            local_addrs.push(listener.local_addr()?);
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _peer)) => {
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream).await {
                                    debug!(error = %e, "http session ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            debug!(error = %e, "http accept failed");
                        }
                    }
                }
            }));
        }
        *self.state.lock().unwrap() = Some(GatewayState { local_addrs, tasks });
        Ok(())
    }

    /// Socket addresses actually bound (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.local_addrs.clone())
            .unwrap_or_default()
    }

    pub async fn stop(&self) {
        if let Some(state) = self.state.lock().unwrap().take() {
            for task in state.tasks {
                task.abort();
            }
        }
    }
}

async fn serve_connection(stream: TcpStream) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    // drain request headers
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    let response = if method == "GET" && path == "/generate204" {
        "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n"
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    };
    reader.get_mut().write_all(response.as_bytes()).await?;
    reader.get_mut().flush().await
}
