// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The orchestrator: owns the listener, the connection registry, and the
//! extension registry, and routes reactor readiness events to the right
//! per-connection handler.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::Token;

use crate::connection::Connection;
use crate::error::CloseCode;
use crate::extension::deflate::Deflate;
use crate::extension::Registry as ExtensionRegistry;
use crate::handshake::{self, Parsed};
use crate::opcode::OpCode;
use crate::reactor::{Reactor, Readiness};
use crate::registry::Registry as ConnectionRegistry;

const LISTENER_TOKEN: Token = Token(0);

/// Tunables the distilled spec leaves as fixed constants; exposed here so
/// an embedder can size them for its deployment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub max_payload_size: u64,
    pub max_pending_write_bytes: usize,
    pub registry_buckets: usize,
    pub enable_permessage_deflate: bool,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        ServerConfig {
            addr,
            max_payload_size: crate::frame::MAX_PAYLOAD_SIZE,
            max_pending_write_bytes: crate::connection::MAX_PENDING_WRITE_BYTES,
            registry_buckets: crate::registry::BUCKETS,
            enable_permessage_deflate: true,
        }
    }
}

/// A callback invoked for every fully assembled, validated application
/// message. `handle` identifies the connection it arrived on.
pub type MessageHandler = Box<dyn FnMut(usize, &[u8], OpCode) + Send>;

/// The single-threaded WebSocket server core.
pub struct Server {
    config: ServerConfig,
    reactor: Reactor,
    listener: TcpListener,
    sockets: HashMap<usize, TcpStream>,
    connections: ConnectionRegistry,
    extensions: ExtensionRegistry,
    next_handle: usize,
    on_message: MessageHandler,
}

impl Server {
    pub fn new(config: ServerConfig, on_message: MessageHandler) -> io::Result<Self> {
        let mut listener = TcpListener::bind(config.addr)?;
        let reactor = Reactor::new(1024)?;
        reactor.add(&mut listener, LISTENER_TOKEN, false)?;

        let mut extensions = ExtensionRegistry::new();
        if config.enable_permessage_deflate {
            extensions.register(Box::new(Deflate::new()));
        }

        let connections = ConnectionRegistry::new(config.registry_buckets);
        Ok(Server {
            config,
            reactor,
            listener,
            sockets: HashMap::new(),
            connections,
            extensions,
            next_handle: 1,
            on_message,
        })
    }

    pub fn register_extension(&mut self, ext: Box<dyn crate::extension::Extension + Send>) {
        self.extensions.register(ext);
    }

    /// The address the listener is actually bound to. Useful when
    /// `ServerConfig::addr` used port `0` to let the OS pick one.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Enter the reactor loop. Does not return unless a fatal
    /// initialization-time error occurs.
    pub fn run(&mut self) -> io::Result<()> {
        info!("listening on {}", self.config.addr);
        loop {
            self.tick()?;
        }
    }

    /// Run a single reactor poll-and-dispatch cycle. Exposed separately
    /// from [`Server::run`] so tests can drive the loop deterministically.
    pub fn tick(&mut self) -> io::Result<()> {
        let mut ready = Vec::new();
        self.reactor.poll(|token, readiness| ready.push((token.0, readiness)))?;

        for (token, readiness) in ready {
            if token == LISTENER_TOKEN.0 {
                self.accept_all();
                continue;
            }
            match readiness {
                Readiness::Readable => self.on_readable(token),
                Readiness::Writable => self.on_writable(token),
                Readiness::HangUp => self.close_connection(token),
            }
        }
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let handle = self.next_handle;
                    self.next_handle += 1;
                    debug!("accepted connection {} from {}", handle, addr);
                    if let Err(e) = self.reactor.add(&mut stream, Token(handle), false) {
                        warn!("failed to register accepted socket: {}", e);
                        continue;
                    }
                    self.sockets.insert(handle, stream);
                    let conn = Connection::with_limits((false, false, false), self.config.max_payload_size, self.config.max_pending_write_bytes);
                    self.connections.insert(handle, conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn on_readable(&mut self, handle: usize) {
        let phase = match self.connections.get(handle) {
            Some(c) => c.phase,
            None => return,
        };
        if phase == crate::connection::Phase::AwaitingRequest {
            if self.read_handshake(handle).is_err() {
                self.close_connection(handle);
            } else {
                self.flush(handle);
            }
            return;
        }
        match self.read_frames(handle) {
            Ok(()) => self.flush(handle),
            // A non-EAGAIN read error or peer EOF: no close frame was
            // queued (there is nothing to drain for), release the
            // connection outright per spec section 7's I/O-error/HangUp rules.
            Err(crate::error::Error::Io(_)) | Err(crate::error::Error::Closed) => self.close_connection(handle),
            // Every other error path already queued a CLOSE frame via
            // `Connection::fail`; flush it and let `should_close_now`
            // finish the teardown once the writer drains (spec section 7:
            // "send CLOSE, drain writer, close").
            Err(_) => self.flush(handle),
        }
    }

    fn read_handshake(&mut self, handle: usize) -> Result<(), ()> {
        let socket = self.sockets.get_mut(&handle).ok_or(())?;
        let mut chunk = [0u8; 4096];
        let n = match std::io::Read::read(socket, &mut chunk) {
            Ok(0) => return Err(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(_) => return Err(()),
        };
        let conn = self.connections.get_mut(handle).ok_or(())?;
        conn.request_buffer_mut().extend_from_slice(&chunk[..n]);

        match handshake::parse_and_validate(conn.request_buffer()) {
            Ok(Parsed::NeedMore) => Ok(()),
            Ok(Parsed::Accepted(req)) => {
                let accepted = self.extensions.negotiate(handle, &req.extension_offers);
                let rsv_allowed = self.extensions.claimed_rsv_bits(&accepted);
                let mut ext_resp = Vec::new();
                self.extensions.respond(handle, &accepted, &mut ext_resp);
                let protocol = req.protocols.first().copied();
                let response = handshake::encode_accept_response(req.key, protocol, &ext_resp);
                let conn = self.connections.get_mut(handle).unwrap();
                conn.open(accepted, rsv_allowed);
                conn.queue_raw(&response);
                Ok(())
            }
            Err(e) => {
                let response = handshake::encode_reject_response(e.status(), &e.to_string());
                if let Some(socket) = self.sockets.get_mut(&handle) {
                    let _ = std::io::Write::write_all(socket, &response);
                }
                Err(())
            }
        }
    }

    fn read_frames(&mut self, handle: usize) -> Result<(), crate::error::Error> {
        let extensions = &mut self.extensions;
        let on_message = &mut self.on_message;
        let socket = self.sockets.get_mut(&handle).ok_or(crate::error::Error::Closed)?;
        let conn = self.connections.get_mut(handle).ok_or(crate::error::Error::Closed)?;
        conn.handle_readable(socket, extensions, handle, |payload, opcode| {
            on_message(handle, payload, opcode);
        })
    }

    fn flush(&mut self, handle: usize) {
        let (drained, closing) = {
            let conn = match self.connections.get_mut(handle) {
                Some(c) => c,
                None => return,
            };
            let socket = match self.sockets.get_mut(&handle) {
                Some(s) => s,
                None => return,
            };
            match conn.write_pending(socket) {
                Ok(drained) => (drained, conn.should_close_now()),
                Err(e) => {
                    warn!("send error on connection {}: {}", handle, e);
                    self.close_connection(handle);
                    return;
                }
            }
        };
        if let Some(socket) = self.sockets.get_mut(&handle) {
            let _ = self.reactor.set_write_interest(socket, Token(handle), !drained);
        }
        if closing {
            self.close_connection(handle);
        }
    }

    fn on_writable(&mut self, handle: usize) {
        self.flush(handle);
    }

    fn close_connection(&mut self, handle: usize) {
        if let Some(conn) = self.connections.get_mut(handle) {
            self.extensions.close(handle, &conn.accepted_extensions);
            conn.mark_closed();
        }
        if let Some(mut socket) = self.sockets.remove(&handle) {
            let _ = self.reactor.remove(&mut socket);
        }
        self.connections.remove(handle);
        debug!("connection {} closed", handle);
    }

    /// Send an application message to a connection. Returns `false` if the
    /// connection is already closing or unknown.
    pub fn send_message(&mut self, handle: usize, opcode: OpCode, payload: &[u8]) -> bool {
        let result = match self.connections.get_mut(handle) {
            Some(conn) => conn.send_message(&mut self.extensions, handle, opcode, payload).is_ok(),
            None => false,
        };
        if result {
            self.flush(handle);
        }
        result
    }

    /// Initiate a normal (1000) close handshake for a connection.
    pub fn close(&mut self, handle: usize) {
        if let Some(conn) = self.connections.get_mut(handle) {
            let _ = conn.initiate_close(CloseCode::NORMAL);
        }
        self.flush(handle);
    }
}
