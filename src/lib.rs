// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A single-process implementation of the [RFC 6455][rfc6455] WebSocket
//! protocol with a pluggable extension layer, driven entirely from a
//! non-blocking readiness reactor (no async/await, no thread-per-connection).
//!
//! # Basic usage
//!
//! ```no_run
//! use nitrows_rs::{Server, ServerConfig};
//!
//! let config = ServerConfig::new("127.0.0.1:9001".parse().unwrap());
//! let mut server = Server::new(config, Box::new(|handle, payload, opcode| {
//!     println!("{}: {:?} {} bytes", handle, opcode, payload.len());
//! })).unwrap();
//! server.run().unwrap();
//! ```
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455

pub mod connection;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod opcode;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod util;

pub use error::{CloseCode, Error, HandshakeError};
pub use opcode::OpCode;
pub use server::{Server, ServerConfig};
