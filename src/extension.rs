// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The extension pipeline: registration, offer negotiation, and the
//! per-message hooks invoked by the [`crate::connection::Connection`].

use std::borrow::Cow;

use crate::error::Error;
use crate::frame::Frame;

pub mod deflate;

/// One parameter of a `Sec-WebSocket-Extensions` offer, e.g. the
/// `client_max_window_bits=15` in `permessage-deflate; client_max_window_bits=15`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param<'a> {
    name: Cow<'a, str>,
    value: Option<Cow<'a, str>>,
    /// Set on the last parameter of an alternative parameter set (the
    /// parameters preceding a comma that starts a new alternative for the
    /// same extension token).
    pub is_last: bool,
}

impl<'a> Param<'a> {
    pub fn new(name: impl Into<Cow<'a, str>>, value: Option<Cow<'a, str>>) -> Self {
        Param { name: name.into(), value, is_last: false }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

/// An alternative set of parameters offered for one extension token.
/// `Sec-WebSocket-Extensions: permessage-deflate; x=1, permessage-deflate; y=2`
/// yields two `Offer`s, each with `params` containing one parameter.
#[derive(Debug, Clone, Default)]
pub struct Offer<'a> {
    pub params: Vec<Param<'a>>,
}

/// Capability an extension provides. Implementations are registered once,
/// process-wide, and store any per-connection state behind the connection's
/// extension slot rather than inside `Self` (`Self` is shared across every
/// negotiated connection).
pub trait Extension: std::fmt::Debug {
    /// The `Sec-WebSocket-Extensions` token this extension answers to, e.g.
    /// `"permessage-deflate"`.
    fn token(&self) -> &'static str;

    /// The RSV1/RSV2/RSV3 bits this extension may legitimately set on a
    /// frame once negotiated. The decoder rejects any RSV bit not claimed
    /// by a negotiated extension as a protocol violation.
    fn claimed_rsv_bits(&self) -> (bool, bool, bool) {
        (false, false, false)
    }

    /// Inspect one offered alternative and decide whether to accept it. On
    /// acceptance the extension must record whatever per-connection
    /// configuration it read out of `params` (keyed by `handle`) and return
    /// `true`. Returning `false` lets the negotiator try the next
    /// alternative, if any.
    fn validate_offer(&mut self, handle: usize, params: &[Param<'_>]) -> bool;

    /// Write this extension's response token (and any negotiated
    /// parameters) into `out`. Returns the number of bytes written; `0` if
    /// this extension was not negotiated for `handle`.
    fn respond_to_offer(&self, handle: usize, out: &mut Vec<u8>) -> usize;

    /// Transform an assembled inbound message in place before it reaches the
    /// user callback (e.g. inflate a `permessage-deflate` payload).
    fn process_data(&mut self, handle: usize, frame: &Frame, payload: &mut Vec<u8>) -> Result<(), Error>;

    /// Transform an outbound payload before it is framed (e.g. deflate it),
    /// returning the RSV bits this extension wants set on the frame header.
    fn generate_data(&mut self, handle: usize, payload: &mut Vec<u8>) -> Result<(bool, bool, bool), Error>;

    /// Release any per-connection state associated with `handle`.
    fn close(&mut self, handle: usize);
}

/// Process-wide, insertion-ordered table of registered extensions.
/// Bounded at 255 entries, matching the distilled spec's `u8`-indexable
/// extension id space.
#[derive(Default)]
pub struct Registry {
    extensions: Vec<Box<dyn Extension + Send>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { extensions: Vec::new() }
    }

    pub fn register(&mut self, ext: Box<dyn Extension + Send>) {
        assert!(self.extensions.len() < 255, "extension registry is full");
        self.extensions.push(ext);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Negotiate every offered token against the registry, in registration
    /// order. For each extension whose token matches an offer, alternatives
    /// are tried in the order they were offered; the first one
    /// `validate_offer` accepts wins and later alternatives for that token
    /// are ignored.
    pub fn negotiate(&mut self, handle: usize, offers: &[(String, Vec<Offer<'_>>)]) -> Vec<usize> {
        let mut accepted = Vec::new();
        for (idx, ext) in self.extensions.iter_mut().enumerate() {
            if let Some((_, alternatives)) = offers.iter().find(|(tok, _)| tok == ext.token()) {
                for alt in alternatives {
                    if ext.validate_offer(handle, &alt.params) {
                        accepted.push(idx);
                        break;
                    }
                }
            }
        }
        accepted
    }

    pub fn respond(&self, handle: usize, accepted: &[usize], out: &mut Vec<u8>) {
        for &idx in accepted {
            self.extensions[idx].respond_to_offer(handle, out);
        }
    }

    pub fn process_data(&mut self, handle: usize, accepted: &[usize], frame: &Frame, payload: &mut Vec<u8>) -> Result<(), Error> {
        for &idx in accepted {
            self.extensions[idx].process_data(handle, frame, payload)?;
        }
        Ok(())
    }

    pub fn generate_data(&mut self, handle: usize, accepted: &[usize], payload: &mut Vec<u8>) -> Result<(bool, bool, bool), Error> {
        let mut rsv = (false, false, false);
        for &idx in accepted {
            let bits = self.extensions[idx].generate_data(handle, payload)?;
            rsv.0 |= bits.0;
            rsv.1 |= bits.1;
            rsv.2 |= bits.2;
        }
        Ok(rsv)
    }

    pub fn close(&mut self, handle: usize, accepted: &[usize]) {
        for &idx in accepted {
            self.extensions[idx].close(handle);
        }
    }

    pub fn token_at(&self, idx: usize) -> &'static str {
        self.extensions[idx].token()
    }

    /// The union of RSV bits every negotiated extension in `accepted`
    /// claims, used to gate which RSV bits the decoder accepts as valid.
    pub fn claimed_rsv_bits(&self, accepted: &[usize]) -> (bool, bool, bool) {
        let mut mask = (false, false, false);
        for &idx in accepted {
            let bits = self.extensions[idx].claimed_rsv_bits();
            mask.0 |= bits.0;
            mask.1 |= bits.1;
            mask.2 |= bits.2;
        }
        mask
    }
}
