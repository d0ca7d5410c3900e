//! The server: a bound address, a handler registry, and the set of live
//! sessions.
//!
//! Servers come from a [`Directory`] — `open` the same `host:port` twice and
//! you get the same server back. Starting is reference-counted the same way:
//! the first [`start`](Server::start) binds and begins accepting, the last
//! [`stop`](Server::stop) tears down the listener, cancels every live
//! session, and waits for them to drain.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::proto::h1::Transport;
use crate::proto::session;
use crate::registry::{HandlerId, Lookup, Registry, Route};
use crate::service::{FileHandler, Handler, StaticHandler};

#[cfg(feature = "tls")]
use tokio_rustls::{rustls, TlsAcceptor};

mod directory;

pub use self::directory::Directory;

#[cfg(feature = "tls")]
type TlsConfig = Option<Arc<rustls::ServerConfig>>;
#[cfg(not(feature = "tls"))]
type TlsConfig = ();

/// A handle on a server held in a [`Directory`].
///
/// All handles returned for one `host:port` address share the same
/// underlying server; the server itself is torn down when the last handle
/// is [`close`](Server::close)d or dropped.
pub struct Server {
    core: Arc<ServerCore>,
    directory: Directory,
    released: bool,
}

/// Opens a server from the process-wide default directory.
///
/// The scheme must be `http` or `ws` — or `https`/`wss` with the `tls`
/// feature enabled. The host is resolved here, asynchronously; prefer
/// numeric addresses on latency-sensitive paths.
pub async fn open(url: &str) -> crate::Result<Server> {
    Directory::global().open(url).await
}

impl Server {
    pub(crate) fn from_core(core: Arc<ServerCore>, directory: Directory) -> Server {
        Server {
            core,
            directory,
            released: false,
        }
    }

    /// Starts accepting connections. Reference-counted: only the first
    /// start binds the listener, and a matching number of
    /// [`stop`](Server::stop)s tears it down.
    pub fn start(&self) -> crate::Result<()> {
        self.core.start()
    }

    /// Undoes one [`start`](Server::start). The last stop closes the
    /// listener, cancels every live session, and waits until all of them
    /// have finished.
    pub async fn stop(&self) {
        self.core.stop().await
    }

    /// Registers a handler. Fails with an address-in-use error if the route
    /// overlaps an existing registration, on any handle of this server.
    pub fn add_handler<H: Handler>(&self, route: Route, handler: H) -> crate::Result<HandlerId> {
        self.core.add_handler(route, Box::new(handler))
    }

    /// Removes a handler. Dispatches already in flight to it complete
    /// normally.
    pub fn remove_handler(&self, id: HandlerId) {
        self.core.remove_handler(id)
    }

    /// Registers a `GET` handler serving a blob of memory at `uri`.
    ///
    /// The content type defaults to `application/octet-stream`.
    pub fn add_static(
        &self,
        host: Option<&str>,
        content_type: Option<&str>,
        uri: &str,
        data: impl Into<Bytes>,
    ) -> crate::Result<HandlerId> {
        let handler = StaticHandler::new(content_type, data.into())?;
        self.core.add_handler(route_for(host, uri), Box::new(handler))
    }

    /// Registers a `GET` handler serving a filesystem file at `uri`, read
    /// per request.
    ///
    /// Without an explicit content type, one is inferred from the file
    /// extension.
    pub fn add_file(
        &self,
        host: Option<&str>,
        content_type: Option<&str>,
        uri: &str,
        path: impl Into<PathBuf>,
    ) -> crate::Result<HandlerId> {
        let handler = FileHandler::new(content_type, path.into())?;
        self.core.add_handler(route_for(host, uri), Box::new(handler))
    }

    /// The address the listener is bound to, once started. With a port of
    /// zero in the URL, this is where the kernel put the server.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    /// Replaces the TLS configuration used for new connections.
    ///
    /// Refused with a busy error while the server is started.
    #[cfg(feature = "tls")]
    pub fn set_tls(&self, config: Arc<rustls::ServerConfig>) -> crate::Result<()> {
        self.core.set_tls(config)
    }

    /// The TLS configuration, if one was set.
    #[cfg(feature = "tls")]
    pub fn get_tls(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.core.get_tls()
    }

    /// Releases this handle. The last handle on a server removes it from
    /// its directory and tears it down, waiting for live sessions to
    /// finish. Dropping the handle instead does the same teardown without
    /// waiting.
    pub async fn close(mut self) {
        self.released = true;
        let core = Arc::clone(&self.core);
        let directory = self.directory.clone();
        directory.release(&core).await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.released {
            self.directory.release_fast(&self.core);
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("hostname", &self.core.hostname)
            .field("port", &self.core.port)
            .finish()
    }
}

fn route_for(host: Option<&str>, uri: &str) -> Route {
    let route = Route::new(Method::GET, uri);
    match host {
        Some(host) => route.host(host),
        None => route,
    }
}

pub(crate) struct ServerCore {
    hostname: String,
    port: u16,
    tls_scheme: bool,
    addr: SocketAddr,
    state: Mutex<State>,
    drained: Notify,
}

struct State {
    registry: Registry,
    sessions: HashSet<u64>,
    next_session: u64,
    starts: usize,
    closed: bool,
    shutdown: Option<watch::Sender<bool>>,
    local_addr: Option<SocketAddr>,
    accept: Option<JoinHandle<()>>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl ServerCore {
    pub(crate) fn new(hostname: String, port: u16, tls_scheme: bool, addr: SocketAddr) -> ServerCore {
        ServerCore {
            hostname,
            port,
            tls_scheme,
            addr,
            state: Mutex::new(State {
                registry: Registry::new(),
                sessions: HashSet::new(),
                next_session: 0,
                starts: 0,
                closed: false,
                shutdown: None,
                local_addr: None,
                accept: None,
                #[cfg(feature = "tls")]
                tls: None,
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("server state lock poisoned")
    }

    pub(crate) fn add_handler(
        &self,
        route: Route,
        handler: Box<dyn Handler>,
    ) -> crate::Result<HandlerId> {
        self.lock().registry.add(route, handler)
    }

    pub(crate) fn remove_handler(&self, id: HandlerId) {
        self.lock().registry.remove(id)
    }

    pub(crate) fn lookup(&self, method: &Method, path: &[u8], host: Option<&[u8]>) -> Lookup {
        self.lock().registry.lookup(method, path, host)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    #[cfg(feature = "tls")]
    fn set_tls(&self, config: Arc<rustls::ServerConfig>) -> crate::Result<()> {
        let mut state = self.lock();
        if state.starts > 0 {
            return Err(crate::Error::new_busy());
        }
        state.tls = Some(config);
        Ok(())
    }

    #[cfg(feature = "tls")]
    fn get_tls(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.lock().tls.clone()
    }

    fn start(self: &Arc<Self>) -> crate::Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(crate::Error::new_closed());
        }
        if state.starts > 0 {
            state.starts += 1;
            return Ok(());
        }

        #[cfg(feature = "tls")]
        {
            if self.tls_scheme && state.tls.is_none() {
                return Err(crate::Error::new_listen(
                    "TLS server started without a TLS config",
                ));
            }
        }

        let std_listener = StdTcpListener::bind(self.addr).map_err(crate::Error::new_listen)?;
        std_listener
            .set_nonblocking(true)
            .map_err(crate::Error::new_listen)?;
        let listener = TcpListener::from_std(std_listener).map_err(crate::Error::new_listen)?;
        let local_addr = listener.local_addr().map_err(crate::Error::new_listen)?;

        let (tx, rx) = watch::channel(false);
        state.starts = 1;
        state.shutdown = Some(tx);
        state.local_addr = Some(local_addr);
        trace!("server listening on {}", local_addr);
        state.accept = Some(tokio::spawn(accept_loop(Arc::clone(self), listener, rx)));
        Ok(())
    }

    async fn stop(&self) {
        let teardown = {
            let mut state = self.lock();
            if state.starts == 0 {
                return;
            }
            state.starts -= 1;
            state.starts == 0
        };
        if teardown {
            self.teardown().await;
        }
    }

    /// Tears down the listener, cancels live sessions, and waits for the
    /// session set to drain.
    async fn teardown(&self) {
        let (shutdown, accept) = {
            let mut state = self.lock();
            state.starts = 0;
            state.local_addr = None;
            (state.shutdown.take(), state.accept.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(accept) = accept {
            let _ = accept.await;
        }
        self.wait_drained().await;
    }

    /// Waits until the session set is empty. Cancel-safe: nothing is torn
    /// down here, it only observes.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.lock().sessions.is_empty() {
                break;
            }
            notified.await;
        }
    }

    /// Directory removal: cancels the accept loop and every live session
    /// and marks the core so no further open or start can revive it.
    /// Sessions are cancelled but not awaited.
    pub(crate) fn destroy_fast(&self) {
        let shutdown = {
            let mut state = self.lock();
            state.closed = true;
            state.starts = 0;
            state.local_addr = None;
            state.accept.take();
            state.shutdown.take()
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
    }

    fn spawn_session(self: &Arc<Self>, stream: TcpStream) {
        let (id, rx, tls) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let shutdown = match state.shutdown.as_ref() {
                Some(tx) => tx,
                // Stopped between accept and registration; discard the pipe.
                None => return,
            };
            let rx = shutdown.subscribe();
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(id);

            #[cfg(feature = "tls")]
            let tls = if self.tls_scheme { state.tls.clone() } else { None };
            #[cfg(not(feature = "tls"))]
            let tls = ();

            (id, rx, tls)
        };

        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = SessionGuard {
                core: Arc::clone(&core),
                id,
            };
            let io = match wrap_stream(stream, tls, rx.clone()).await {
                Some(io) => io,
                None => return,
            };
            session::run(core, io, rx).await;
        });
    }
}

impl fmt::Debug for ServerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCore")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .finish()
    }
}

/// Removes the session from the server's set when the task ends, however it
/// ends, and wakes anyone waiting for the set to drain.
struct SessionGuard {
    core: Arc<ServerCore>,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.core.state.lock() {
            state.sessions.remove(&self.id);
            let empty = state.sessions.is_empty();
            drop(state);
            if empty {
                self.core.drained.notify_waiters();
            }
        }
    }
}

async fn accept_loop(
    core: Arc<ServerCore>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    trace!("accepted connection from {}", remote);
                    stream
                }
                Err(err) => {
                    if is_connection_error(&err) {
                        debug!("accept error: {}", err);
                        continue;
                    }
                    // Resource exhaustion (EMFILE and friends): log loudly,
                    // back off, and keep the listener alive.
                    error!("accept error: {}", err);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            },
        };
        core.spawn_session(stream);
    }
    trace!("accept loop finished");
}

/// These errors describe the accepted socket, not the listener; skip the
/// backoff for them.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(feature = "tls")]
async fn wrap_stream(
    stream: TcpStream,
    tls: TlsConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Option<Transport> {
    match tls {
        None => Some(Transport::new(Box::new(stream))),
        Some(config) => {
            let acceptor = TlsAcceptor::from(config);
            tokio::select! {
                _ = shutdown.changed() => None,
                accepted = acceptor.accept(stream) => match accepted {
                    Ok(stream) => Some(Transport::new(Box::new(stream))),
                    Err(err) => {
                        debug!("TLS handshake failed: {}", err);
                        None
                    }
                },
            }
        }
    }
}

#[cfg(not(feature = "tls"))]
async fn wrap_stream(
    stream: TcpStream,
    _tls: TlsConfig,
    _shutdown: watch::Receiver<bool>,
) -> Option<Transport> {
    Some(Transport::new(Box::new(stream)))
}
