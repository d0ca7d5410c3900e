//! HTTP upgrades.
//!
//! A handler registered with [`Route::upgrader`](crate::Route::upgrader) may
//! call [`Exchange::upgrade`](crate::Exchange::upgrade) to assume ownership
//! of the connection's byte pipe. The session finishes without touching the
//! pipe again; writing the switching-protocols response and speaking the new
//! protocol are the upgrader's business.

use std::any::TypeId;
use std::cmp;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// An upgraded connection, detached from its session.
///
/// This type holds a trait object internally of the original IO the session
/// was speaking HTTP over. It can be used directly as an `AsyncRead` or
/// `AsyncWrite` for convenience.
///
/// Alternatively, if the exact type is known, this can be deconstructed
/// into its parts.
pub struct Upgraded {
    io: Box<dyn Io + Send>,
    read_buf: Bytes,
}

/// The deconstructed parts of an [`Upgraded`](Upgraded) type.
///
/// Includes the original IO type, and a read buffer of bytes that the HTTP
/// transport may have already read before the upgrade.
#[derive(Debug)]
pub struct Parts<T> {
    /// The original IO object used before the upgrade.
    pub io: T,
    /// A buffer of bytes that have been read but not processed as HTTP.
    ///
    /// If the peer began speaking the new protocol optimistically, its first
    /// bytes may be here rather than on the socket. Check this before
    /// reading from the IO object.
    pub read_buf: Bytes,
    _inner: (),
}

pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + 'static {
    fn io_type_id(&self) -> TypeId {
        TypeId::of::<Self>()
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + 'static> Io for T {}

impl dyn Io + Send {
    fn is<T: Io>(&self) -> bool {
        self.io_type_id() == TypeId::of::<T>()
    }

    fn downcast<T: Io>(self: Box<Self>) -> Result<Box<T>, Box<Self>> {
        if self.is::<T>() {
            // Taken from `std::error::Error::downcast()`.
            unsafe {
                let raw: *mut (dyn Io + Send) = Box::into_raw(self);
                Ok(Box::from_raw(raw as *mut T))
            }
        } else {
            Err(self)
        }
    }
}

// ===== impl Upgraded =====

impl Upgraded {
    pub(crate) fn new(io: Box<dyn Io + Send>, read_buf: Bytes) -> Self {
        Upgraded { io, read_buf }
    }

    /// Tries to downcast the internal trait object to the type passed.
    ///
    /// On success, returns the downcasted parts. On error, returns the
    /// `Upgraded` back.
    pub fn downcast<T: AsyncRead + AsyncWrite + Unpin + 'static>(self) -> Result<Parts<T>, Self> {
        let Upgraded { io, read_buf } = self;
        match io.downcast::<T>() {
            Ok(io) => Ok(Parts {
                io: *io,
                read_buf,
                _inner: (),
            }),
            Err(io) => Err(Upgraded { io, read_buf }),
        }
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.read_buf.is_empty() {
            let n = cmp::min(this.read_buf.len(), buf.remaining());
            let chunk = this.read_buf.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded").finish()
    }
}
