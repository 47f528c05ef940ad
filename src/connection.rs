// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Per-connection state: the decode/assemble/encode/write pipeline that
//! the orchestrator drives whenever a socket becomes readable or writable.

use std::io::{self, Read, Write};

use log::{trace, warn};

use crate::error::{CloseCode, Error};
use crate::extension::Registry as ExtensionRegistry;
use crate::frame::{Decoder, Progress};
use crate::opcode::OpCode;
use crate::util::utf8;

/// Maximum bytes this server will buffer for one connection's outbound
/// writes before giving up on the peer and closing with 1011.
pub const MAX_PENDING_WRITE_BYTES: usize = 16 * 1024 * 1024;

/// The byte-incremental read buffer is grown in chunks this size.
pub const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingRequest,
    Open,
    Closing,
    Closed,
}

/// One accepted TCP connection past the HTTP upgrade.
pub struct Connection {
    pub phase: Phase,
    decoder: Decoder,
    pub accepted_extensions: Vec<usize>,
    request_buffer: Vec<u8>,
    read_buffer: Vec<u8>,
    outbound: Vec<u8>,
    outbound_offset: usize,
    sent_close: bool,
    received_close: bool,
    max_pending_write_bytes: usize,
}

impl Connection {
    pub fn new(rsv_allowed: (bool, bool, bool)) -> Self {
        Connection::with_limits(rsv_allowed, crate::frame::MAX_PAYLOAD_SIZE, MAX_PENDING_WRITE_BYTES)
    }

    /// Like [`Connection::new`], but with the payload and outbound-buffer
    /// ceilings taken from [`ServerConfig`](crate::server::ServerConfig)
    /// instead of the built-in defaults.
    pub fn with_limits(rsv_allowed: (bool, bool, bool), max_payload_size: u64, max_pending_write_bytes: usize) -> Self {
        Connection {
            phase: Phase::AwaitingRequest,
            decoder: Decoder::with_max_payload_size(rsv_allowed, max_payload_size),
            accepted_extensions: Vec::new(),
            request_buffer: Vec::new(),
            read_buffer: Vec::new(),
            outbound: Vec::new(),
            outbound_offset: 0,
            sent_close: false,
            received_close: false,
            max_pending_write_bytes,
        }
    }

    pub fn request_buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.request_buffer
    }

    pub fn request_buffer(&self) -> &[u8] {
        &self.request_buffer
    }

    pub fn open(&mut self, accepted_extensions: Vec<usize>, rsv_allowed: (bool, bool, bool)) {
        self.decoder.set_rsv_allowed(rsv_allowed);
        self.accepted_extensions = accepted_extensions;
        self.phase = Phase::Open;
        self.request_buffer.clear();
        self.request_buffer.shrink_to_fit();
    }

    pub fn has_pending_write(&self) -> bool {
        self.outbound_offset < self.outbound.len()
    }

    /// Queue raw bytes (e.g. the handshake response) bypassing the frame
    /// encoder and extension pipeline.
    pub fn queue_raw(&mut self, bytes: &[u8]) {
        let _ = self.queue(bytes);
    }

    fn queue(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.outbound.len() - self.outbound_offset + bytes.len() > self.max_pending_write_bytes {
            return Err(Error::MessageTooLarge { current: bytes.len() as u64, maximum: self.max_pending_write_bytes as u64 });
        }
        if self.outbound_offset > 0 && self.outbound_offset == self.outbound.len() {
            self.outbound.clear();
            self.outbound_offset = 0;
        } else if self.outbound_offset > READ_CHUNK {
            self.outbound.drain(..self.outbound_offset);
            self.outbound_offset = 0;
        }
        self.outbound.extend_from_slice(bytes);
        Ok(())
    }

    /// Drain as much of the pending outbound buffer as the socket accepts.
    /// Returns `Ok(true)` if the buffer fully drained.
    pub fn write_pending<W: Write>(&mut self, w: &mut W) -> io::Result<bool> {
        while self.outbound_offset < self.outbound.len() {
            match w.write(&self.outbound[self.outbound_offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        self.outbound.clear();
        self.outbound_offset = 0;
        Ok(true)
    }

    /// Queue an application message (TEXT or BINARY) for sending, passing
    /// it through the negotiated extension pipeline first.
    pub fn send_message(&mut self, extensions: &mut ExtensionRegistry, handle: usize, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        if self.phase != Phase::Open {
            return Err(Error::Closed);
        }
        let mut buf = payload.to_vec();
        let rsv = extensions.generate_data(handle, &self.accepted_extensions, &mut buf)?;
        let frame = encode_frame(opcode, true, rsv, &buf);
        self.queue(&frame)
    }

    /// Begin the close handshake: send a CLOSE frame with `code` and mark
    /// this connection as closing.
    pub fn initiate_close(&mut self, code: CloseCode) -> Result<(), Error> {
        if self.sent_close {
            return Ok(());
        }
        let payload = code.0.to_be_bytes();
        let frame = encode_frame(OpCode::Close, true, (false, false, false), &payload);
        self.sent_close = true;
        self.phase = Phase::Closing;
        self.queue(&frame)
    }

    /// Begin the close handshake with a CLOSE frame that carries no status
    /// payload at all, per RFC 6455 section 7.4.1's "no status code" case.
    pub fn initiate_close_empty(&mut self) -> Result<(), Error> {
        if self.sent_close {
            return Ok(());
        }
        let frame = encode_frame(OpCode::Close, true, (false, false, false), &[]);
        self.sent_close = true;
        self.phase = Phase::Closing;
        self.queue(&frame)
    }

    /// Feed freshly-read bytes through the decoder, dispatching complete
    /// control frames and assembled messages. `on_message` is called
    /// synchronously for each fully assembled, validated message.
    pub fn handle_readable<R: Read>(
        &mut self,
        reader: &mut R,
        extensions: &mut ExtensionRegistry,
        handle: usize,
        mut on_message: impl FnMut(&[u8], OpCode),
    ) -> Result<(), Error> {
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let n = match reader.read(&mut chunk) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            };
            self.read_buffer.extend_from_slice(&chunk[..n]);
            self.drain_read_buffer(extensions, handle, &mut on_message)?;
        }
    }

    fn drain_read_buffer(
        &mut self,
        extensions: &mut ExtensionRegistry,
        handle: usize,
        on_message: &mut impl FnMut(&[u8], OpCode),
    ) -> Result<(), Error> {
        let mut pos = 0;
        loop {
            let call_start = pos;
            let (consumed, progress) = match self.decoder.decode(&mut self.read_buffer[pos..]) {
                Ok(v) => v,
                Err(e) => {
                    self.fail(e.close_code())?;
                    return Err(e);
                }
            };
            pos += consumed;
            let outcome = match progress {
                Progress::NeedMore => break,
                Progress::Control => self.handle_control_frame(),
                Progress::FragmentDone => Ok(()),
                Progress::MessageDone { inline: None } => self.handle_message_done(extensions, handle, on_message),
                Progress::MessageDone { inline: Some((start, len)) } => {
                    self.handle_message_done_inline(call_start + start, len, extensions, handle, on_message)
                }
            };
            if let Err(e) = outcome {
                self.fail(e.close_code())?;
                self.read_buffer.drain(..pos);
                return Err(e);
            }
            if consumed == 0 {
                break;
            }
        }
        self.read_buffer.drain(..pos);
        Ok(())
    }

    fn handle_control_frame(&mut self) -> Result<(), Error> {
        let frame = self.decoder.control_frame().clone();
        let payload = &frame.buffer[..frame.filled];
        match frame.opcode {
            OpCode::Ping => {
                let reply = encode_frame(OpCode::Pong, true, (false, false, false), payload);
                self.queue(&reply)?;
            }
            OpCode::Pong => {}
            OpCode::Close => {
                self.received_close = true;
                let reply = close_answer(payload)?;
                if !self.sent_close {
                    match reply {
                        Some(code) => self.initiate_close(code)?,
                        None => self.initiate_close_empty()?,
                    }
                } else {
                    self.phase = Phase::Closing;
                }
            }
            other => return Err(Error::UnexpectedOpCode(other)),
        }
        Ok(())
    }

    fn handle_message_done(
        &mut self,
        extensions: &mut ExtensionRegistry,
        handle: usize,
        on_message: &mut impl FnMut(&[u8], OpCode),
    ) -> Result<(), Error> {
        let frame = self.decoder.data_frame().clone();
        let payload = frame.buffer[..frame.filled].to_vec();
        self.finish_message(frame, payload, extensions, handle, on_message)
    }

    /// Complete a single, unfragmented data message whose already-unmasked
    /// payload lives at `self.read_buffer[start..start + len]` rather than in
    /// the decoder's assembly buffer (the zero-copy fast path).
    fn handle_message_done_inline(
        &mut self,
        start: usize,
        len: usize,
        extensions: &mut ExtensionRegistry,
        handle: usize,
        on_message: &mut impl FnMut(&[u8], OpCode),
    ) -> Result<(), Error> {
        let frame = self.decoder.data_frame().clone();
        let payload = self.read_buffer[start..start + len].to_vec();
        self.finish_message(frame, payload, extensions, handle, on_message)
    }

    fn finish_message(
        &mut self,
        frame: crate::frame::Frame,
        mut payload: Vec<u8>,
        extensions: &mut ExtensionRegistry,
        handle: usize,
        on_message: &mut impl FnMut(&[u8], OpCode),
    ) -> Result<(), Error> {
        if !self.accepted_extensions.is_empty() {
            extensions.process_data(handle, &self.accepted_extensions, &frame, &mut payload)?;
        }
        if frame.opcode == OpCode::Text && !utf8::validate(&payload).map_err(|_| Error::Utf8)? {
            return Err(Error::Utf8);
        }

        on_message(&payload, frame.opcode);
        self.decoder.reset_data_frame();
        Ok(())
    }

    fn fail(&mut self, code: CloseCode) -> Result<(), Error> {
        warn!("closing connection with code {}", code.0);
        if !self.sent_close {
            self.initiate_close(code)?;
        }
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.phase == Phase::Closing
    }

    pub fn should_close_now(&self) -> bool {
        self.phase == Phase::Closing && !self.has_pending_write()
    }

    pub fn mark_closed(&mut self) {
        self.phase = Phase::Closed;
        trace!("connection closed");
    }
}

/// Build an outgoing frame. Server-to-client frames are never masked.
pub fn encode_frame(opcode: OpCode, fin: bool, rsv: (bool, bool, bool), payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    let byte0 = (if fin { 0x80 } else { 0 })
        | (if rsv.0 { 0x40 } else { 0 })
        | (if rsv.1 { 0x20 } else { 0 })
        | (if rsv.2 { 0x10 } else { 0 })
        | u8::from(opcode);
    out.push(byte0);

    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len < 65536 {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Map an inbound CLOSE frame's payload to the status code to echo back,
/// per RFC 6455 section 7.4.1. `Ok(None)` means the reply must carry no
/// status code at all, rather than falling back to a fixed code.
fn close_answer(payload: &[u8]) -> Result<Option<CloseCode>, Error> {
    if payload.is_empty() {
        return Ok(Some(CloseCode::NORMAL));
    }
    if payload.len() == 1 {
        return Ok(Some(CloseCode::PROTOCOL_ERROR));
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    std::str::from_utf8(&payload[2..])?;
    let code = if code == 1001 { CloseCode::NORMAL.0 } else { code };
    if CloseCode(code).is_echoable() {
        Ok(Some(CloseCode(code)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::Registry;

    /// A reader that yields `buf` once, then behaves like a non-blocking
    /// socket with no more data available, rather than signalling EOF.
    struct OneShot {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for OneShot {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn mask_payload(mask: [u8; 4], payload: &[u8]) -> Vec<u8> {
        payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect()
    }

    fn masked_frame(fin: bool, opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode];
        let len = payload.len();
        out.push(0x80 | len as u8);
        out.extend_from_slice(&mask);
        out.extend_from_slice(&mask_payload(mask, payload));
        out
    }

    #[test]
    fn with_limits_rejects_oversized_payload_using_the_configured_ceiling() {
        let mut conn = Connection::with_limits((false, false, false), 10, MAX_PENDING_WRITE_BYTES);
        conn.open(vec![], (false, false, false));
        let mut ext = Registry::new();
        let wire = masked_frame(true, 2, b"this payload is well over ten bytes", [1, 2, 3, 4]);
        let mut reader = OneShot { data: wire, pos: 0 };
        let err = conn.handle_readable(&mut reader, &mut ext, 1, |_, _| {}).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::MESSAGE_TOO_LARGE);
        assert_eq!(&conn.outbound[conn.outbound_offset..], &[0x88, 0x02, 0x03, 0xf1]);
    }

    #[test]
    fn with_limits_enforces_the_configured_pending_write_ceiling() {
        let mut conn = Connection::with_limits((false, false, false), crate::frame::MAX_PAYLOAD_SIZE, 8);
        conn.open(vec![], (false, false, false));
        let mut ext = Registry::new();
        assert!(conn.send_message(&mut ext, 1, OpCode::Binary, b"way more than eight bytes of payload").is_err());
    }

    #[test]
    fn basic_echo_matches_the_literal_rfc_scenario() {
        // "Hello" masked with 37 fa 21 3d, per the distilled spec's concrete
        // end-to-end scenario 1.
        let wire: [u8; 11] = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut conn = Connection::new((false, false, false));
        conn.open(vec![], (false, false, false));
        let mut ext = Registry::new();
        let mut reader = OneShot { data: wire.to_vec(), pos: 0 };
        let mut received = None;
        conn.handle_readable(&mut reader, &mut ext, 1, |b, op| received = Some((b.to_vec(), op))).unwrap();
        let (payload, opcode) = received.unwrap();
        assert_eq!(payload, b"Hello");
        assert_eq!(opcode, OpCode::Text);

        conn.send_message(&mut ext, 1, opcode, &payload).unwrap();
        assert_eq!(&conn.outbound[conn.outbound_offset..], &[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
    }

    #[test]
    fn echoes_ping_as_pong() {
        let mut conn = Connection::new((false, false, false));
        conn.open(vec![], (false, false, false));
        let mut ext = Registry::new();
        let wire = masked_frame(true, 9, b"abc", [1, 2, 3, 4]);
        let mut reader = OneShot { data: wire, pos: 0 };
        conn.handle_readable(&mut reader, &mut ext, 1, |_, _| {}).unwrap();
        assert!(conn.has_pending_write());
    }

    #[test]
    fn delivers_text_message_to_callback() {
        let mut conn = Connection::new((false, false, false));
        conn.open(vec![], (false, false, false));
        let mut ext = Registry::new();
        let wire = masked_frame(true, 1, b"hello", [9, 9, 9, 9]);
        let mut reader = OneShot { data: wire, pos: 0 };
        let mut received = None;
        conn.handle_readable(&mut reader, &mut ext, 1, |b, op| received = Some((b.to_vec(), op))).unwrap();
        assert_eq!(received, Some((b"hello".to_vec(), OpCode::Text)));
    }

    #[test]
    fn invalid_utf8_text_closes_with_1007() {
        let mut conn = Connection::new((false, false, false));
        conn.open(vec![], (false, false, false));
        let mut ext = Registry::new();
        let wire = masked_frame(true, 1, &[0xff, 0xfe], [1, 1, 1, 1]);
        let mut reader = OneShot { data: wire, pos: 0 };
        let err = conn.handle_readable(&mut reader, &mut ext, 1, |_, _| {}).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::INVALID_ENCODING);
        assert_eq!(&conn.outbound[conn.outbound_offset..], &[0x88, 0x02, 0x03, 0xef]);
    }

    #[test]
    fn close_frame_with_invalid_utf8_reason_queues_1007_close() {
        let mut conn = Connection::new((false, false, false));
        conn.open(vec![], (false, false, false));
        let mut ext = Registry::new();
        let mut close_payload = 1000u16.to_be_bytes().to_vec();
        close_payload.extend_from_slice(&[0xff, 0xfe]);
        let wire = masked_frame(true, 8, &close_payload, [1, 1, 1, 1]);
        let mut reader = OneShot { data: wire, pos: 0 };
        let err = conn.handle_readable(&mut reader, &mut ext, 1, |_, _| {}).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::INVALID_ENCODING);
        assert_eq!(&conn.outbound[conn.outbound_offset..], &[0x88, 0x02, 0x03, 0xef]);
    }

    #[test]
    fn extension_pipeline_failure_queues_1010_close() {
        use crate::extension::deflate::Deflate;

        let mut conn = Connection::new((false, false, false));
        // Deflate is registered but never negotiated for this handle (no
        // `validate_offer` call), so `process_data` finds no per-connection
        // state for a frame that claims RSV1 and fails with an extension error.
        conn.open(vec![0], (true, false, false));
        let mut ext = Registry::new();
        ext.register(Box::new(Deflate::new()));
        let mut wire = masked_frame(true, 2, b"payload", [1, 2, 3, 4]);
        wire[0] |= 0x40;
        let mut reader = OneShot { data: wire, pos: 0 };
        let err = conn.handle_readable(&mut reader, &mut ext, 1, |_, _| {}).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::EXTENSION_FAILURE);
        assert_eq!(&conn.outbound[conn.outbound_offset..], &[0x88, 0x02, 0x03, 0xf2]);
    }

    #[test]
    fn close_code_1001_is_echoed_as_1000() {
        let payload = 1001u16.to_be_bytes();
        assert_eq!(close_answer(&payload).unwrap(), Some(CloseCode::NORMAL));
    }

    #[test]
    fn non_echoable_close_code_gets_empty_reply() {
        let payload = 4999u16.to_be_bytes();
        assert_eq!(close_answer(&payload).unwrap(), None);
        let payload = 2999u16.to_be_bytes();
        assert_eq!(close_answer(&payload).unwrap(), None);
        let payload = 1015u16.to_be_bytes();
        assert_eq!(close_answer(&payload).unwrap(), None);
    }

    #[test]
    fn one_byte_close_payload_is_protocol_error() {
        assert_eq!(close_answer(&[0x12]).unwrap(), Some(CloseCode::PROTOCOL_ERROR));
    }

    #[test]
    fn peer_close_with_non_echoable_code_sends_empty_close_frame() {
        let mut conn = Connection::new((false, false, false));
        conn.open(vec![], (false, false, false));
        let mut ext = Registry::new();
        let close_payload = 4999u16.to_be_bytes();
        let wire = masked_frame(true, 8, &close_payload, [1, 1, 1, 1]);
        let mut reader = OneShot { data: wire, pos: 0 };
        conn.handle_readable(&mut reader, &mut ext, 1, |_, _| {}).unwrap();
        // CLOSE frame header (2 bytes) + empty payload, no status code.
        assert_eq!(&conn.outbound[conn.outbound_offset..], &[0x88, 0x00]);
    }
}
