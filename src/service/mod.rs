//! Handlers: the user-supplied side of a dispatch.
//!
//! A matched request is handed to its handler as an owned [`Exchange`]
//! carrying the request and the connection's transport. The handler gives
//! the exchange back with a response attached, or — for upgraders — keeps
//! the transport and returns the exchange empty-handed.
//!
//! Most handlers are plain async functions wrapped with [`handler_fn`]:
//!
//! ```
//! use bytes::Bytes;
//! use http::Response;
//! use wharf::service::handler_fn;
//!
//! let hello = handler_fn(|_req| async {
//!     Ok(Response::new(Bytes::from_static(b"hello")))
//! });
//! # drop(hello);
//! ```

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, Response};

use crate::proto::h1::Transport;
use crate::upgrade::Upgraded;

mod files;

pub(crate) use self::files::{FileHandler, StaticHandler};

/// An asynchronous request handler.
///
/// The exchange is owned for the duration of the call; returning it hands
/// the connection back to the session. Returning an error abandons the
/// connection.
pub trait Handler: Send + Sync + 'static {
    /// Handles one dispatched request.
    fn call(&self, exchange: Exchange) -> BoxFuture<'static, crate::Result<Exchange>>;
}

/// One dispatched request/response pair on a connection.
pub struct Exchange {
    request: Option<Request<Bytes>>,
    response: Option<Response<Bytes>>,
    io: Option<Transport>,
    canon: Bytes,
    upgradable: bool,
}

impl Exchange {
    pub(crate) fn new(request: Request<Bytes>, canon: Bytes, io: Transport, upgradable: bool) -> Exchange {
        Exchange {
            request: Some(request),
            response: None,
            io: Some(io),
            canon,
            upgradable,
        }
    }

    /// Borrows the request being handled.
    ///
    /// # Panics
    ///
    /// Panics if the request was moved out with [`take_request`](Exchange::take_request).
    pub fn request(&self) -> &Request<Bytes> {
        self.request.as_ref().expect("request already taken")
    }

    /// Moves the request out of the exchange.
    pub fn take_request(&mut self) -> Request<Bytes> {
        self.request.take().expect("request already taken")
    }

    /// The canonical form of the request target: query stripped, authority
    /// removed, percent escapes decoded. This is the byte string the route
    /// was matched against.
    pub fn canonical_path(&self) -> &[u8] {
        &self.canon
    }

    /// Attaches the response the session should write once the handler
    /// returns. A later call replaces an earlier one.
    pub fn respond(&mut self, response: Response<Bytes>) {
        self.response = Some(response);
    }

    /// Takes ownership of the connection's byte pipe.
    ///
    /// Only handlers registered with [`Route::upgrader`](crate::Route::upgrader)
    /// may do this; anyone else gets an error and the session keeps the
    /// connection. After a successful claim the session finishes without
    /// writing to or closing the pipe.
    pub fn upgrade(&mut self) -> crate::Result<Upgraded> {
        if !self.upgradable {
            return Err(crate::Error::new_not_upgrader());
        }
        let io = self.io.take().ok_or_else(crate::Error::new_closed)?;
        let (io, read_buf) = io.into_parts();
        Ok(Upgraded::new(io, read_buf))
    }

    /// Writes raw bytes straight to the transport, bypassing response
    /// serialization. A handler that uses this and returns without calling
    /// [`respond`](Exchange::respond) is trusted to have written a complete
    /// HTTP response itself.
    pub async fn write_raw(&mut self, buf: &[u8]) -> crate::Result<()> {
        match self.io.as_mut() {
            Some(io) => io.write_raw(buf).await,
            None => Err(crate::Error::new_closed()),
        }
    }

    pub(crate) fn into_parts(self) -> (Option<Transport>, Option<Response<Bytes>>) {
        (self.io, self.response)
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("upgradable", &self.upgradable)
            .field("responded", &self.response.is_some())
            .finish()
    }
}

/// Creates a [`Handler`] from an async function of the request.
///
/// The function receives the request by value and returns the response; the
/// session takes care of persistence, `HEAD` bodies and error responses.
pub fn handler_fn<F, R>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<Bytes>) -> R + Send + Sync + 'static,
    R: Future<Output = crate::Result<Response<Bytes>>> + Send + 'static,
{
    HandlerFn { f }
}

/// A [`Handler`] implemented by a closure, created by [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F, R> Handler for HandlerFn<F>
where
    F: Fn(Request<Bytes>) -> R + Send + Sync + 'static,
    R: Future<Output = crate::Result<Response<Bytes>>> + Send + 'static,
{
    fn call(&self, mut exchange: Exchange) -> BoxFuture<'static, crate::Result<Exchange>> {
        let fut = (self.f)(exchange.take_request());
        Box::pin(async move {
            let response = fut.await?;
            exchange.respond(response);
            Ok(exchange)
        })
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish()
    }
}
