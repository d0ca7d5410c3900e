#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # wharf
//!
//! wharf is an embeddable HTTP/1.x server core, meant to live inside a
//! larger networking library and host its request handlers — small REST
//! endpoints, health checks, and the HTTP side of WebSocket upgrades.
//!
//! It is deliberately not a web framework. There is no middleware, no
//! extractors, no templating: a [`Server`] owns a listener, a registry of
//! routes, and the set of live connections, and drives each connection
//! through a strict read-dispatch-respond cycle.
//!
//! - Servers are deduplicated per process: [`server::open`] with the same
//!   `host:port` returns the same server, so independent subsystems can
//!   mount handlers on one listener.
//! - Registration is strict: routes that could both claim a request are
//!   rejected at [`Server::add_handler`] time, not raced at dispatch time.
//! - A handler registered as an upgrader may take the connection's byte
//!   pipe for itself ([`Exchange::upgrade`]) and speak another protocol.
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::Response;
//! use wharf::{handler_fn, Route};
//!
//! #[tokio::main]
//! async fn main() -> wharf::Result<()> {
//!     let server = wharf::server::open("http://127.0.0.1:8080").await?;
//!     server.add_handler(
//!         Route::get("/hi"),
//!         handler_fn(|_req| async { Ok(Response::new(Bytes::from_static(b"hello"))) }),
//!     )?;
//!     server.start()?;
//!     // ... the server accepts until the last handle stops or closes it.
//!     server.stop().await;
//!     server.close().await;
//!     Ok(())
//! }
//! ```

#[doc(hidden)]
pub use http;

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

pub use crate::error::{Error, Result};

mod canon;
mod error;
mod mime;
mod proto;
mod registry;
pub mod server;
pub mod service;
pub mod upgrade;

pub use crate::registry::{HandlerId, Route};
pub use crate::server::{Directory, Server};
pub use crate::service::{handler_fn, Exchange, Handler};
