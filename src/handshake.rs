// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Parses and validates the HTTP/1.1 upgrade request, and builds the
//! `101 Switching Protocols` (or rejection) response.

use base64::Engine;
use log::debug;
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;
use crate::extension::{Offer, Param};

/// The GUID RFC 6455 section 1.3 has the server concatenate onto the
/// client's key before hashing.
const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_NUM_HEADERS: usize = 32;
const MAX_REQUEST_SIZE: usize = 4096;

/// A fully parsed and validated upgrade request.
pub struct Request<'a> {
    pub key: &'a str,
    pub protocols: Vec<&'a str>,
    pub extension_offers: Vec<(String, Vec<Offer<'a>>)>,
}

/// Outcome of attempting to parse a buffer as an upgrade request.
pub enum Parsed<'a> {
    /// Not enough bytes yet; keep buffering (up to [`MAX_REQUEST_SIZE`]).
    NeedMore,
    /// A complete, valid request.
    Accepted(Request<'a>),
}

/// Compute the `Sec-WebSocket-Accept` value for a given client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

fn header_value<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

fn header_contains_token(value: &str, token: &str) -> bool {
    value.split(',').any(|v| v.trim().eq_ignore_ascii_case(token))
}

fn is_valid_key(key: &str) -> bool {
    key.len() == 24
        && key.ends_with("==")
        && key[..22].bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

/// Parse one extension-parameter value: bare words are `BOOL`, all-digit
/// words are `INT`, anything following `=` is a `STRING`/`INT` value.
fn parse_params(raw: &str) -> Vec<Param<'_>> {
    let mut params: Vec<Param<'_>> = raw
        .split(';')
        .skip(1)
        .map(|p| {
            let p = p.trim();
            match p.split_once('=') {
                Some((k, v)) => Param::new(k.trim(), Some(v.trim().trim_matches('"').into())),
                None => Param::new(p, None),
            }
        })
        .filter(|p| !p.name().is_empty())
        .collect();
    if let Some(last) = params.last_mut() {
        last.is_last = true;
    }
    params
}

fn parse_extensions(value: &str) -> Vec<(String, Vec<Offer<'_>>)> {
    let mut by_token: Vec<(String, Vec<Offer<'_>>)> = Vec::new();
    for alt in value.split(',') {
        let alt = alt.trim();
        if alt.is_empty() {
            continue;
        }
        let token = alt.split(';').next().unwrap_or("").trim();
        if token.is_empty() || token.len() > 31 {
            continue;
        }
        let offer = Offer { params: parse_params(alt) };
        if let Some(entry) = by_token.iter_mut().find(|(t, _)| t == token) {
            entry.1.push(offer);
        } else {
            by_token.push((token.to_string(), vec![offer]));
        }
    }
    by_token
}

/// Parse and fully validate an HTTP/1.1 upgrade request out of `buf`.
/// `buf` must contain the bytes received so far; a trailing partial
/// request yields [`Parsed::NeedMore`].
pub fn parse_and_validate(buf: &[u8]) -> Result<Parsed<'_>, HandshakeError> {
    if buf.len() > MAX_REQUEST_SIZE {
        return Err(HandshakeError::TooLarge);
    }

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(buf)?;
    let body_offset = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(Parsed::NeedMore),
    };
    let _ = body_offset;

    if req.method != Some("GET") {
        return Err(HandshakeError::NotGet);
    }
    if req.version != Some(1) {
        return Err(HandshakeError::MissingHeader("HTTP/1.1"));
    }

    if header_value(req.headers, "Host").is_none() {
        return Err(HandshakeError::MissingHeader("Host"));
    }

    let upgrade = header_value(req.headers, "Upgrade").ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !header_contains_token(upgrade, "websocket") {
        return Err(HandshakeError::MissingHeader("Upgrade"));
    }

    let connection = header_value(req.headers, "Connection").ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !header_contains_token(connection, "Upgrade") {
        return Err(HandshakeError::MissingHeader("Connection"));
    }

    let version = header_value(req.headers, "Sec-WebSocket-Version").ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion);
    }

    let key = header_value(req.headers, "Sec-WebSocket-Key").ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    if !is_valid_key(key) {
        return Err(HandshakeError::InvalidKey);
    }

    let protocols = header_value(req.headers, "Sec-WebSocket-Protocol")
        .map(|v| v.split(',').map(str::trim).take_while(|t| t.len() <= 99).collect())
        .unwrap_or_default();

    let mut extension_offers = Vec::new();
    for h in req.headers.iter().filter(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Extensions")) {
        let value = std::str::from_utf8(h.value).map_err(|_| HandshakeError::InvalidExtensionOffer)?;
        for (token, offers) in parse_extensions(value) {
            if let Some(entry) = extension_offers.iter_mut().find(|(t, _): &&mut (String, Vec<Offer<'_>>)| *t == token) {
                let entry: &mut (String, Vec<Offer<'_>>) = entry;
                entry.1.extend(offers);
            } else {
                extension_offers.push((token, offers));
            }
        }
    }

    debug!("accepted handshake request, key={}, protocols={:?}", key, protocols);
    Ok(Parsed::Accepted(Request { key, protocols, extension_offers }))
}

/// Build the `101 Switching Protocols` response.
pub fn encode_accept_response(key: &str, protocol: Option<&str>, extensions: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"Upgrade: websocket\r\n");
    out.extend_from_slice(b"Connection: Upgrade\r\n");
    out.extend_from_slice(b"Sec-WebSocket-Accept: ");
    out.extend_from_slice(accept_key(key).as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(p) = protocol {
        out.extend_from_slice(b"Sec-WebSocket-Protocol: ");
        out.extend_from_slice(p.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !extensions.is_empty() {
        out.extend_from_slice(b"Sec-WebSocket-Extensions: ");
        out.extend_from_slice(extensions);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// The reason phrase this server uses for a given rejection status code.
fn reason_phrase(status: u16) -> &'static str {
    match status {
        405 => "Method Not Allowed",
        _ => "Bad Request",
    }
}

/// Build an HTTP error response for a rejected handshake.
pub fn encode_reject_response(status: u16, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + message.len());
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n");
    out.extend_from_slice(b"Content-Type: text/html\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", message.len()).as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 section 1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn parses_minimal_valid_request() {
        let req = b"GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        match parse_and_validate(req).unwrap() {
            Parsed::Accepted(r) => assert_eq!(r.key, "dGhlIHNhbXBsZSBub25jZQ=="),
            Parsed::NeedMore => panic!("expected Accepted"),
        }
    }

    #[test]
    fn rejects_wrong_version() {
        let req = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n";
        assert!(matches!(parse_and_validate(req), Err(HandshakeError::UnsupportedVersion)));
    }

    #[test]
    fn reports_need_more_on_partial_request() {
        let req = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert!(matches!(parse_and_validate(req).unwrap(), Parsed::NeedMore));
    }

    #[test]
    fn parses_extension_offer_with_alternatives() {
        let req = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Extensions: permessage-deflate; client_max_window_bits=10, permessage-deflate\r\n\r\n";
        match parse_and_validate(req).unwrap() {
            Parsed::Accepted(r) => {
                assert_eq!(r.extension_offers.len(), 1);
                assert_eq!(r.extension_offers[0].0, "permessage-deflate");
                assert_eq!(r.extension_offers[0].1.len(), 2);
            }
            Parsed::NeedMore => panic!("expected Accepted"),
        }
    }
}
