//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have wharf `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur serving HTTP connections or mutating a
/// server's handler registry.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(super) enum Kind {
    Parse(Parse),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    Io,
    /// Error creating the server listener.
    Listen,
    /// A request body was refused (over the configured cap).
    Body,
    /// Delivered to in-flight work when a session or server shuts down.
    Closed,
    /// The URL given to `open` has an unsupported scheme or an unresolvable host.
    InvalidAddress,
    /// A TLS scheme was requested but the `tls` feature is not compiled in.
    NotSupported,
    /// A mutator was called while the server is running.
    #[cfg(feature = "tls")]
    Busy,
    /// A new handler overlaps an existing registration.
    AddressInUse,
    User(User),
}

#[derive(Debug)]
pub(super) enum Parse {
    Method,
    Uri,
    /// The request line does not carry an HTTP/1.x version.
    Version,
    /// The request line carries an HTTP/2 or later version.
    VersionUnsupported,
    Header,
    ContentLength,
    /// `Transfer-Encoding` framing is not accepted on ingress.
    TransferEncoding,
    TooLarge,
}

#[derive(Debug)]
pub(super) enum User {
    /// A handler registration failed validation.
    InvalidRoute,
    /// Error returned from a user handler.
    Handler,
    /// A handler tried to take the transport without registering as an upgrader.
    NotUpgrader,
}

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this error was delivered because a session or server
    /// shut down.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if a registration was rejected for overlapping an
    /// existing handler.
    pub fn is_address_in_use(&self) -> bool {
        matches!(self.inner.kind, Kind::AddressInUse)
    }

    /// Returns true if a URL could not be opened.
    pub fn is_invalid_address(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidAddress)
    }

    /// Returns true if a mutator was refused because the server is running.
    #[cfg(feature = "tls")]
    pub fn is_busy(&self) -> bool {
        matches!(self.inner.kind, Kind::Busy)
    }

    /// Returns true if the requested facility is not compiled in.
    pub fn is_not_supported(&self) -> bool {
        matches!(self.inner.kind, Kind::NotSupported)
    }

    /// Returns true if a handler registration failed validation.
    pub fn is_invalid_route(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::InvalidRoute))
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// The HTTP status a session answers with before closing, when the
    /// failed request can still be answered at all.
    pub(crate) fn response_status(&self) -> Option<http::StatusCode> {
        match self.inner.kind {
            Kind::Parse(Parse::VersionUnsupported) => {
                Some(http::StatusCode::HTTP_VERSION_NOT_SUPPORTED)
            }
            Kind::Parse(_) => Some(http::StatusCode::BAD_REQUEST),
            Kind::Body => Some(http::StatusCode::INTERNAL_SERVER_ERROR),
            _ => None,
        }
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_body_refused() -> Error {
        Error::new(Kind::Body)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_invalid_address() -> Error {
        Error::new(Kind::InvalidAddress)
    }

    pub(crate) fn new_not_supported() -> Error {
        Error::new(Kind::NotSupported)
    }

    #[cfg(feature = "tls")]
    pub(crate) fn new_busy() -> Error {
        Error::new(Kind::Busy)
    }

    pub(crate) fn new_address_in_use() -> Error {
        Error::new(Kind::AddressInUse)
    }

    pub(crate) fn new_invalid_route(reason: &'static str) -> Error {
        Error::new(Kind::User(User::InvalidRoute)).with(reason)
    }

    /// Wraps an error raised by handler code, so a handler can fail its
    /// dispatch with a cause attached. A failed dispatch closes the
    /// connection.
    pub fn new_user<E: Into<Box<dyn StdError + Send + Sync>>>(cause: E) -> Error {
        Error::new(Kind::User(User::Handler)).with(cause)
    }

    pub(crate) fn new_not_upgrader() -> Error {
        Error::new(Kind::User(User::NotUpgrader))
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::VersionUnsupported) => "unsupported HTTP version",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::TransferEncoding) => "unexpected transfer-encoding parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Io => "connection error",
            Kind::Listen => "error creating server listener",
            Kind::Body => "request body refused",
            Kind::Closed => "session or server closed",
            Kind::InvalidAddress => "unsupported scheme or unresolvable host",
            Kind::NotSupported => "TLS support is not compiled in",
            #[cfg(feature = "tls")]
            Kind::Busy => "server is running",
            Kind::AddressInUse => "handler overlaps an existing registration",
            Kind::User(User::InvalidRoute) => "invalid handler registration",
            Kind::User(User::Handler) => "error from user's handler",
            Kind::User(User::NotUpgrader) => "handler is not registered as an upgrader",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("wharf::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Uri,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::method::InvalidMethod> for Parse {
    fn from(_: http::method::InvalidMethod) -> Parse {
        Parse::Method
    }
}

impl From<http::uri::InvalidUri> for Parse {
    fn from(_: http::uri::InvalidUri) -> Parse {
        Parse::Uri
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}
