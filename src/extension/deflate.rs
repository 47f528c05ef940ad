// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The `permessage-deflate` extension (RFC 7692): per-direction raw DEFLATE
//! streams negotiated over `Sec-WebSocket-Extensions`.

use std::collections::HashMap;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::{debug, warn};

use crate::error::Error;
use crate::extension::{Extension, Param};
use crate::frame::Frame;
use crate::opcode::OpCode;

/// Marker bytes RFC 7692 section 7.2.1 specifies a SYNC_FLUSH deflate block
/// ends with; stripped before sending, re-appended before inflating.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;

#[derive(Debug, Clone, Copy)]
struct Params {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: u8,
    client_max_window_bits: u8,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
        }
    }
}

struct ConnState {
    params: Params,
    inflater: Option<Decompress>,
    deflater: Option<Compress>,
}

/// The `permessage-deflate` extension. Registered once, process-wide; holds
/// one [`ConnState`] per negotiated connection, keyed by handle.
#[derive(Default)]
pub struct Deflate {
    conns: HashMap<usize, ConnState>,
}

impl std::fmt::Debug for Deflate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deflate").field("connections", &self.conns.len()).finish()
    }
}

impl Deflate {
    pub fn new() -> Self {
        Deflate::default()
    }

    fn parse_window_bits(value: Option<&str>) -> Result<u8, ()> {
        match value {
            None => Ok(MAX_WINDOW_BITS),
            Some(v) => {
                let n: u8 = v.parse().map_err(|_| ())?;
                if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&n) {
                    Ok(n)
                } else {
                    Err(())
                }
            }
        }
    }
}

impl Extension for Deflate {
    fn token(&self) -> &'static str {
        "permessage-deflate"
    }

    fn claimed_rsv_bits(&self) -> (bool, bool, bool) {
        (true, false, false)
    }

    fn validate_offer(&mut self, handle: usize, params: &[Param<'_>]) -> bool {
        let mut seen = [false; 4];
        let mut p = Params::default();
        for param in params {
            match param.name() {
                "server_no_context_takeover" if !seen[0] => {
                    seen[0] = true;
                    p.server_no_context_takeover = true;
                }
                "client_no_context_takeover" if !seen[1] => {
                    seen[1] = true;
                    p.client_no_context_takeover = true;
                }
                "server_max_window_bits" if !seen[2] => {
                    seen[2] = true;
                    match Self::parse_window_bits(param.value()) {
                        Ok(bits) => p.server_max_window_bits = bits,
                        Err(()) => {
                            warn!("rejecting permessage-deflate offer: bad server_max_window_bits");
                            return false;
                        }
                    }
                }
                "client_max_window_bits" if !seen[3] => {
                    seen[3] = true;
                    match Self::parse_window_bits(param.value()) {
                        Ok(bits) => p.client_max_window_bits = bits,
                        Err(()) => {
                            warn!("rejecting permessage-deflate offer: bad client_max_window_bits");
                            return false;
                        }
                    }
                }
                other => {
                    warn!("rejecting permessage-deflate offer: unknown or duplicate param {}", other);
                    return false;
                }
            }
        }
        debug!("negotiated permessage-deflate for connection {}: {:?}", handle, p);
        self.conns.insert(handle, ConnState { params: p, inflater: None, deflater: None });
        true
    }

    fn respond_to_offer(&self, handle: usize, out: &mut Vec<u8>) -> usize {
        let state = match self.conns.get(&handle) {
            Some(s) => s,
            None => return 0,
        };
        let start = out.len();
        out.extend_from_slice(b"permessage-deflate");
        if state.params.server_no_context_takeover {
            out.extend_from_slice(b"; server_no_context_takeover");
        }
        if state.params.client_no_context_takeover {
            out.extend_from_slice(b"; client_no_context_takeover");
        }
        if state.params.server_max_window_bits != MAX_WINDOW_BITS {
            out.extend_from_slice(format!("; server_max_window_bits={}", state.params.server_max_window_bits).as_bytes());
        }
        if state.params.client_max_window_bits != MAX_WINDOW_BITS {
            out.extend_from_slice(format!("; client_max_window_bits={}", state.params.client_max_window_bits).as_bytes());
        }
        out.len() - start
    }

    fn process_data(&mut self, handle: usize, frame: &Frame, payload: &mut Vec<u8>) -> Result<(), Error> {
        if !frame.rsv1 || !matches!(frame.opcode, OpCode::Text | OpCode::Binary) {
            return Ok(());
        }
        let state = self.conns.get_mut(&handle).ok_or(Error::Extension("permessage-deflate"))?;
        if state.inflater.is_none() {
            state.inflater = Some(Decompress::new_with_window_bits(false, state.params.client_max_window_bits));
        }
        let inflater = state.inflater.as_mut().unwrap();

        payload.extend_from_slice(&TRAILER);
        let mut out = Vec::with_capacity(payload.len() * 2 + 32);
        let mut input_pos = 0usize;
        loop {
            let in_before = inflater.total_in();
            let out_before = inflater.total_out();
            let status = inflater
                .decompress_vec(&payload[input_pos..], &mut out, FlushDecompress::Sync)
                .map_err(|_| Error::Extension("permessage-deflate"))?;
            input_pos += (inflater.total_in() - in_before) as usize;
            let produced = inflater.total_out() - out_before;
            match status {
                Status::StreamEnd => break,
                _ if input_pos >= payload.len() => break,
                _ if produced == 0 => {
                    let cap = out.capacity();
                    out.reserve(cap.max(4096));
                }
                _ => {}
            }
        }
        *payload = out;
        if state.params.client_no_context_takeover {
            state.inflater = None;
        }
        Ok(())
    }

    fn generate_data(&mut self, handle: usize, payload: &mut Vec<u8>) -> Result<(bool, bool, bool), Error> {
        let state = self.conns.get_mut(&handle).ok_or(Error::Extension("permessage-deflate"))?;
        if state.deflater.is_none() {
            state.deflater = Some(Compress::new_with_window_bits(
                Compression::fast(),
                false,
                state.params.server_max_window_bits,
            ));
        }
        let deflater = state.deflater.as_mut().unwrap();

        let mut out = Vec::with_capacity(payload.len() + 32);
        let mut input_pos = 0usize;
        loop {
            let in_before = deflater.total_in();
            let out_before = out.len();
            deflater
                .compress_vec(&payload[input_pos..], &mut out, FlushCompress::Sync)
                .map_err(|_| Error::Extension("permessage-deflate"))?;
            input_pos += (deflater.total_in() - in_before) as usize;
            if input_pos >= payload.len() {
                break;
            }
            if out.len() == out_before {
                out.reserve(out.capacity().max(64));
            }
        }
        if out.ends_with(&TRAILER) {
            out.truncate(out.len() - TRAILER.len());
        }
        *payload = out;
        if state.params.server_no_context_takeover {
            state.deflater = None;
        }
        Ok((true, false, false))
    }

    fn close(&mut self, handle: usize) {
        self.conns.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn round_trips_arbitrary_payload() {
        let mut ext = Deflate::new();
        assert!(ext.validate_offer(1, &[]));

        let original = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let mut payload = original.clone();
        let rsv = ext.generate_data(1, &mut payload).unwrap();
        assert_eq!(rsv, (true, false, false));
        assert!(payload.len() < original.len());

        let frame = Frame { opcode: OpCode::Binary, rsv1: true, ..Frame::default() };
        ext.process_data(1, &frame, &mut payload).unwrap();
        assert_eq!(payload, original);
    }

    #[test]
    fn respond_includes_non_default_params_only() {
        let mut ext = Deflate::new();
        let params = vec![Param::new("server_no_context_takeover", None)];
        assert!(ext.validate_offer(2, &params));
        let mut out = Vec::new();
        ext.respond_to_offer(2, &mut out);
        assert_eq!(out, b"permessage-deflate; server_no_context_takeover");
    }

    #[test]
    fn rejects_out_of_range_window_bits() {
        let mut ext = Deflate::new();
        let params = vec![Param::new("server_max_window_bits", Some("7".into()))];
        assert!(!ext.validate_offer(3, &params));
    }

    #[test]
    fn accepts_minimum_window_bits_of_eight() {
        let mut ext = Deflate::new();
        let params = vec![Param::new("server_max_window_bits", Some("8".into()))];
        assert!(ext.validate_offer(4, &params));
    }

    #[test]
    fn quickcheck_roundtrips_arbitrary_payloads_under_a_megabyte() {
        fn prop(payload: Vec<u8>) -> bool {
            let payload = if payload.len() > 1024 * 1024 { payload[..1024 * 1024].to_vec() } else { payload };
            let mut ext = Deflate::new();
            assert!(ext.validate_offer(1, &[]));
            let original = payload.clone();
            let mut buf = payload;
            ext.generate_data(1, &mut buf).unwrap();
            let frame = Frame { opcode: OpCode::Binary, rsv1: true, ..Frame::default() };
            ext.process_data(1, &frame, &mut buf).unwrap();
            buf == original
        }
        quickcheck::QuickCheck::new().tests(200).quickcheck(prop as fn(Vec<u8>) -> bool);
    }
}
