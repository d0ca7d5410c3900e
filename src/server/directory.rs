//! The server directory: process-wide dedup of servers by address.
//!
//! Two `open`s of the same `host:port` pair share one server, so separate
//! subsystems of one process can mount handlers on one listener without
//! coordinating. The pairing is by string equality on the URL's host — no
//! normalization, `localhost` and `127.0.0.1` are different keys.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use super::{Server, ServerCore};

static GLOBAL: OnceLock<Directory> = OnceLock::new();

/// A set of servers deduplicated by `(hostname, port)`.
///
/// Most callers want the process-wide [`Directory::global`] (that is what
/// [`server::open`](crate::server::open) uses); separate instances exist so
/// tests and embedders can keep their servers to themselves.
#[derive(Clone)]
pub struct Directory {
    inner: Arc<Mutex<Vec<Entry>>>,
}

struct Entry {
    hostname: String,
    port: u16,
    core: Arc<ServerCore>,
    refs: usize,
}

impl Directory {
    /// Creates an empty directory.
    pub fn new() -> Directory {
        Directory {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The process-wide directory.
    pub fn global() -> &'static Directory {
        GLOBAL.get_or_init(Directory::new)
    }

    /// Opens a server for `url`, reusing an existing one when the address
    /// matches.
    ///
    /// The scheme picks the transport: `http` and `ws` are plain, `https`
    /// and `wss` are TLS (refused without the `tls` feature). Unknown
    /// schemes and unresolvable hosts are invalid-address errors.
    pub async fn open(&self, url: &str) -> crate::Result<Server> {
        let uri: http::Uri = url
            .parse()
            .map_err(|_| crate::Error::new_invalid_address())?;
        let tls = match uri.scheme_str() {
            Some("http") | Some("ws") => false,
            Some("https") | Some("wss") => {
                if cfg!(feature = "tls") {
                    true
                } else {
                    return Err(crate::Error::new_not_supported());
                }
            }
            _ => return Err(crate::Error::new_invalid_address()),
        };
        let hostname = uri
            .host()
            .ok_or_else(crate::Error::new_invalid_address)?
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

        if let Some(server) = self.reuse(&hostname, port) {
            return Ok(server);
        }

        let addr = resolve(&hostname, port).await?;
        let core = Arc::new(ServerCore::new(hostname.clone(), port, tls, addr));

        let mut entries = self.lock();
        // The address may have been opened while we were resolving.
        for entry in entries.iter_mut() {
            if entry.hostname == hostname && entry.port == port {
                entry.refs += 1;
                return Ok(Server::from_core(Arc::clone(&entry.core), self.clone()));
            }
        }
        entries.push(Entry {
            hostname,
            port,
            core: Arc::clone(&core),
            refs: 1,
        });
        Ok(Server::from_core(core, self.clone()))
    }

    fn reuse(&self, hostname: &str, port: u16) -> Option<Server> {
        let mut entries = self.lock();
        for entry in entries.iter_mut() {
            if entry.hostname == hostname && entry.port == port {
                entry.refs += 1;
                return Some(Server::from_core(Arc::clone(&entry.core), self.clone()));
            }
        }
        None
    }

    /// Releases one handle; tears the server down when it was the last,
    /// waiting for its sessions to finish.
    pub(crate) async fn release(&self, core: &Arc<ServerCore>) {
        if self.detach(core) {
            core.destroy_fast();
            core.wait_drained().await;
        }
    }

    /// Releases one handle without waiting for the drain.
    pub(crate) fn release_fast(&self, core: &Arc<ServerCore>) {
        if self.detach(core) {
            core.destroy_fast();
        }
    }

    /// Drops one reference; true when the entry was removed.
    fn detach(&self, core: &Arc<ServerCore>) -> bool {
        let mut entries = self.lock();
        if let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(&e.core, core)) {
            entries[pos].refs -= 1;
            if entries[pos].refs == 0 {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.inner.lock().expect("directory lock poisoned")
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

impl Default for Directory {
    fn default() -> Directory {
        Directory::new()
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("servers", &self.lock().len())
            .finish()
    }
}

async fn resolve(hostname: &str, port: u16) -> crate::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((hostname, port))
        .await
        .map_err(|err| crate::Error::new_invalid_address().with(err))?;
    addrs.next().ok_or_else(crate::Error::new_invalid_address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Route;
    use crate::service::handler_fn;
    use bytes::Bytes;
    use http::Response;

    fn hello() -> impl crate::service::Handler {
        handler_fn(|_req| async { Ok(Response::new(Bytes::from_static(b"hello"))) })
    }

    #[tokio::test]
    async fn unknown_schemes_are_invalid() {
        let directory = Directory::new();
        let err = directory.open("ftp://127.0.0.1:8080").await.unwrap_err();
        assert!(err.is_invalid_address());

        let err = directory.open("not a url at all").await.unwrap_err();
        assert!(err.is_invalid_address());
    }

    #[cfg(not(feature = "tls"))]
    #[tokio::test]
    async fn tls_schemes_need_the_feature() {
        let directory = Directory::new();
        let err = directory.open("https://127.0.0.1:8443").await.unwrap_err();
        assert!(err.is_not_supported());
        let err = directory.open("wss://127.0.0.1:8443").await.unwrap_err();
        assert!(err.is_not_supported());
    }

    #[tokio::test]
    async fn same_url_shares_one_server() {
        let directory = Directory::new();
        let first = directory.open("http://127.0.0.1:19841").await.unwrap();
        let second = directory.open("http://127.0.0.1:19841").await.unwrap();
        assert_eq!(directory.len(), 1);

        // Both handles mutate the same registry.
        first.add_handler(Route::get("/x"), hello()).unwrap();
        let err = second.add_handler(Route::get("/x"), hello()).unwrap_err();
        assert!(err.is_address_in_use());

        second.close().await;
        // One handle remains; the server survives.
        assert_eq!(directory.len(), 1);
        first.close().await;
        assert_eq!(directory.len(), 0);
    }

    #[tokio::test]
    async fn hostnames_are_compared_as_strings() {
        let directory = Directory::new();
        let numeric = directory.open("ws://127.0.0.1:19842").await.unwrap();
        let named = directory.open("ws://localhost:19842").await.unwrap();
        assert_eq!(directory.len(), 2);
        numeric.close().await;
        named.close().await;
    }

    #[tokio::test]
    async fn closing_the_last_handle_forgets_the_registry() {
        let directory = Directory::new();
        let server = directory.open("http://127.0.0.1:19843").await.unwrap();
        server.add_handler(Route::get("/x"), hello()).unwrap();
        server.close().await;

        let fresh = directory.open("http://127.0.0.1:19843").await.unwrap();
        // A fresh server: the route is free again.
        fresh.add_handler(Route::get("/x"), hello()).unwrap();
        fresh.close().await;
    }

    #[tokio::test]
    async fn default_ports_follow_the_scheme() {
        let directory = Directory::new();
        let plain = directory.open("http://127.0.0.1").await.unwrap();
        assert_eq!(directory.len(), 1);
        // Explicit port 80 is the same key.
        let same = directory.open("http://127.0.0.1:80").await.unwrap();
        assert_eq!(directory.len(), 1);
        plain.close().await;
        same.close().await;
    }
}
