/*
 * client.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an HTTP client library.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! WebSocket opening handshake over the call driver: a GET with the
//! upgrade headers, verification of the 101 response, extension
//! negotiation, then hand-off of the raw transport to the frame tasks.

use crate::call::HttpClient;
use crate::error::{HttpError, HttpResult};
use crate::protocol::http::request::{Method, Request};
use crate::protocol::websocket::connection::WebSocket;
use crate::protocol::websocket::handler::WebSocketListener;
use crate::protocol::websocket::handshake::{
    negotiate_extensions, offered_extensions, generate_key, verify_accept,
};
use crate::uri::HttpUrl;

impl WebSocket {
    /// Connect to a ws:// or wss:// URL (http/https also accepted) and
    /// return the socket once the handshake has been verified. The
    /// listener's `on_open` fires before this returns.
    pub async fn connect(
        client: &HttpClient,
        url: &str,
        listener: Box<dyn WebSocketListener + Send>,
    ) -> HttpResult<WebSocket> {
        let url = HttpUrl::parse(url)?;
        let key = generate_key().map_err(HttpError::Io)?;
        let offer_deflate = client.config().websocket_compression;

        let mut request = Request::new(Method::Get, url)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Key", key.clone())
            .header("Sec-WebSocket-Version", "13");
        request.websocket_upgrade = true;
        if offer_deflate {
            request.headers.add("Sec-WebSocket-Extensions", offered_extensions());
        }

        let response = client.execute(request).await?;
        if response.status != 101 {
            return Err(HttpError::Protocol(format!(
                "expected 101 Switching Protocols, got {}",
                response.status
            )));
        }
        if !response
            .header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        {
            return Err(HttpError::Protocol(
                "response Upgrade header is not websocket".into(),
            ));
        }
        verify_accept(response.header("Sec-WebSocket-Accept"), &key)
            .map_err(|e| HttpError::Protocol(e.to_string()))?;
        let deflate = negotiate_extensions(
            response.header("Sec-WebSocket-Extensions"),
            offer_deflate,
        )
        .map_err(|e| HttpError::Protocol(e.to_string()))?;

        let socket = match response.socket {
            Some(s) => s,
            None => {
                return Err(HttpError::Protocol(
                    "101 response carried no upgraded socket".into(),
                ))
            }
        };
        let (stream, leftover) = socket.into_parts();
        Ok(WebSocket::spawn(
            stream,
            leftover,
            listener,
            deflate,
            client.config().minimum_deflate_size,
            client.config().ping_interval,
            client.config().close_timeout,
        ))
    }
}
