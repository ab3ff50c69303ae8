#![forbid(unsafe_code)]
//! Asynchronous 9P2000 and 9P2000.L protocol engine for Rust.
//!
//! This crate provides a tokio-based implementation of both ends of the 9P
//! protocol: the wire codec for every message, a framed encoder and decoder,
//! a multiplexing client, and a server that dispatches requests to a
//! user-supplied [`srv::Service`]. Servers built on it can be mounted with the
//! Linux kernel's v9fs module.
//!
//! # Overview
//!
//! 9P was developed for the Plan 9 distributed operating system. 9P2000.L is
//! the Linux variant that adds POSIX permissions, symbolic links, extended
//! attributes and locks. Both share the same framing:
//!
//! ```text
//! size[4] type[1] tag[2] body[size-7]
//! ```
//!
//! All integers are little-endian. Strings are a 2-byte length followed by
//! UTF-8 bytes. The `tag` pairs each reply with its request, so many requests
//! can be outstanding on one connection at once.
//!
//! # Serving a filesystem
//!
//! 1. Define a type to hold per-fid state (or use `()`)
//! 2. Implement [`srv::Service`]; unimplemented operations answer `EOPNOTSUPP`
//! 3. Start a [`srv::Server`] on a `proto!address!port` address
//!
//! ```no_run
//! use p9core::{srv::{Config, Fid, Server, Service}, Rattach, Qid, QidType, Result};
//! use async_trait::async_trait;
//!
//! struct MyFs;
//!
//! #[async_trait]
//! impl Service for MyFs {
//!     type Fid = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &Fid<()>,
//!         _afid: Option<&Fid<()>>,
//!         _uname: &str,
//!         _aname: &str,
//!         _n_uname: u32,
//!     ) -> Result<Rattach> {
//!         Ok(Rattach {
//!             qid: Qid { typ: QidType::DIR, version: 0, path: 0 },
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::new(MyFs, Config::default())?;
//!     server.serve("tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Talking to a server
//!
//! ```no_run
//! use p9core::{client::{Client, Config}, NOFID, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::connect("tcp!127.0.0.1!564", Config::default()).await?;
//!     let root = client.alloc_fid()?;
//!     client.attach(root, NOFID, "glenda", "", 1000).await?;
//!     client.clunk(root).await?;
//!     client.close().await
//! }
//! ```
//!
//! # Fid Management
//!
//! A fid is a 32-bit handle chosen by the client to name a file on the
//! server. The server session keeps the table; services only see resolved
//! [`srv::Fid`] values.
//!
//! - Each fid is unique per connection
//! - Fids persist across operations until explicitly clunked
//! - Walking to a new fid creates a new fid (the old one remains valid)
//! - After `Tclunk` or `Tremove`, the fid is invalid whatever the outcome
//!
//! # Error Handling
//!
//! Services return [`Error::No`] with an errno from [`errno`]. The session
//! answers with `Rlerror` in 9P2000.L sessions and `Rerror` in 9P2000 ones.
//! Framing problems are reported as [`error::FrameError`].
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
//!
//! Any `AsyncRead`/`AsyncWrite` pair works through [`srv::Server::serve_conn`]
//! and [`client::Client::new`].
#[macro_use]
pub mod utils;
pub mod buffer;
pub mod client;
pub mod error;
pub mod fcall;
pub mod framed;
pub mod mode;
pub mod pool;
pub mod serialize;
pub mod srv;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::fcall::*;
pub use crate::utils::Result;
