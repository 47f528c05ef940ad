// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The readiness reactor: a thin wrapper over [`mio::Poll`] that the
//! orchestrator uses to learn when a socket is readable, writable, or has
//! hung up, without this crate ever touching epoll/kqueue/IOCP directly.

use std::io;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// A readiness kind delivered for one registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
    HangUp,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Reactor { poll: Poll::new()?, events: Events::with_capacity(event_capacity) })
    }

    pub fn add<S: Source + ?Sized>(&self, source: &mut S, token: Token, writable: bool) -> io::Result<()> {
        let interest = if writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        self.poll.registry().register(source, token, interest)
    }

    pub fn set_write_interest<S: Source + ?Sized>(&self, source: &mut S, token: Token, writable: bool) -> io::Result<()> {
        let interest = if writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn remove<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        // Idempotent: a socket the peer already closed may already be gone
        // from the registry; that's not a reason to fail the close path.
        let _ = self.poll.registry().deregister(source);
        Ok(())
    }

    /// Block until at least one registered source is ready, invoking
    /// `on_event` once per (token, readiness) pair observed.
    pub fn poll(&mut self, mut on_event: impl FnMut(Token, Readiness)) -> io::Result<()> {
        self.poll.poll(&mut self.events, None)?;
        for event in self.events.iter() {
            if event.is_read_closed() || event.is_error() {
                on_event(event.token(), Readiness::HangUp);
                continue;
            }
            if event.is_readable() {
                on_event(event.token(), Readiness::Readable);
            }
            if event.is_writable() {
                on_event(event.token(), Readiness::Writable);
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }
}
