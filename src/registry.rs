//! The handler registry: an ordered set of route entries.
//!
//! Registration is strict — two entries that could both claim a request are
//! rejected up front, so scan order never decides a dispatch. Entries are
//! `Arc`-shared: the registry holds one reference, every in-flight dispatch
//! holds another, and an entry removed mid-flight stays alive until its last
//! dispatch completes.

use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::service::Handler;

/// A route registration: where a handler is mounted and how it behaves.
///
/// ```
/// use wharf::Route;
/// use http::Method;
///
/// let route = Route::new(Method::GET, "/assets")
///     .host("static.example.com")
///     .directory(true);
/// ```
#[derive(Clone)]
pub struct Route {
    method: Method,
    path: String,
    host: Option<String>,
    directory: bool,
    upgrader: bool,
}

impl Route {
    /// Creates a route for the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Route {
        Route {
            method,
            path: path.into(),
            host: None,
            directory: false,
            upgrader: false,
        }
    }

    /// Shorthand for a `GET` route.
    pub fn get(path: impl Into<String>) -> Route {
        Route::new(Method::GET, path)
    }

    /// Restricts the route to requests whose `Host` header names this host.
    ///
    /// Matching is case-insensitive and tolerates an absolute-form trailing
    /// dot and a `:port` suffix on the header. Without a host the route is a
    /// wildcard.
    pub fn host(mut self, host: impl Into<String>) -> Route {
        self.host = Some(host.into());
        self
    }

    /// Marks the path as a directory prefix: `/assets` also claims
    /// `/assets/logo.png`.
    pub fn directory(mut self, directory: bool) -> Route {
        self.directory = directory;
        self
    }

    /// Marks the handler as an upgrader, allowed to take the connection's
    /// byte pipe via [`Exchange::upgrade`](crate::Exchange::upgrade).
    pub fn upgrader(mut self, upgrader: bool) -> Route {
        self.upgrader = upgrader;
        self
    }

    pub(crate) fn method(&self) -> &Method {
        &self.method
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("host", &self.host)
            .field("directory", &self.directory)
            .field("upgrader", &self.upgrader)
            .finish()
    }
}

/// Opaque identifier for a registered handler, returned from
/// [`Server::add_handler`](crate::Server::add_handler).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandlerId(u64);

pub(crate) struct Endpoint {
    route: Route,
    handler: Box<dyn Handler>,
    id: HandlerId,
}

impl Endpoint {
    pub(crate) fn handler(&self) -> &dyn Handler {
        &*self.handler
    }

    pub(crate) fn is_upgrader(&self) -> bool {
        self.route.upgrader
    }
}

pub(crate) enum Lookup {
    Found(Arc<Endpoint>),
    NoneMatching,
    MethodNotAllowed,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<Arc<Endpoint>>,
    next_id: u64,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry::default()
    }

    /// Validates, normalizes and appends a route.
    pub(crate) fn add(
        &mut self,
        mut route: Route,
        handler: Box<dyn Handler>,
    ) -> crate::Result<HandlerId> {
        if route.method == Method::HEAD {
            // HEAD is always answered by the GET handler.
            return Err(crate::Error::new_invalid_route("HEAD routes are implicit"));
        }
        if route.path.is_empty() {
            return Err(crate::Error::new_invalid_route("empty path"));
        }

        while route.path.ends_with('/') {
            route.path.pop();
        }
        if let Some(host) = route.host.as_mut() {
            if host.ends_with('.') {
                host.pop();
            }
        }

        for other in &self.entries {
            if conflicts(&route, &other.route) {
                return Err(crate::Error::new_address_in_use());
            }
        }

        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.entries.push(Arc::new(Endpoint { route, handler, id }));
        Ok(id)
    }

    /// Detaches an entry. In-flight dispatches keep their own reference.
    pub(crate) fn remove(&mut self, id: HandlerId) {
        self.entries.retain(|e| e.id != id);
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry claiming a request, by canonical path, `Host` header
    /// and method.
    pub(crate) fn lookup(&self, method: &Method, path: &[u8], host: Option<&[u8]>) -> Lookup {
        let mut method_rejected = false;
        for entry in &self.entries {
            let route = &entry.route;
            if let Some(ref entry_host) = route.host {
                if !host_matches(entry_host, host) {
                    continue;
                }
            }
            if !path_matches(route.path.as_bytes(), route.directory, path) {
                continue;
            }
            if *method == route.method || (*method == Method::HEAD && route.method == Method::GET)
            {
                return Lookup::Found(Arc::clone(entry));
            }
            method_rejected = true;
        }
        if method_rejected {
            Lookup::MethodNotAllowed
        } else {
            Lookup::NoneMatching
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Two routes conflict when a request could match both: overlapping hosts
/// (a missing host is a wildcard), byte-equal methods, and one path a
/// prefix of the other. `/foo` and `/foobar` count as overlapping; the rule
/// compares only the shorter length.
fn conflicts(a: &Route, b: &Route) -> bool {
    let hosts_overlap = match (&a.host, &b.host) {
        (Some(ha), Some(hb)) => ha.eq_ignore_ascii_case(hb),
        _ => true,
    };
    if !hosts_overlap || a.method != b.method {
        return false;
    }
    let n = a.path.len().min(b.path.len());
    a.path.as_bytes()[..n] == b.path.as_bytes()[..n]
}

fn host_matches(entry: &str, header: Option<&[u8]>) -> bool {
    let header = match header {
        Some(h) => h,
        None => return false,
    };
    let entry = entry.as_bytes();
    if header.len() < entry.len() || !header[..entry.len()].eq_ignore_ascii_case(entry) {
        return false;
    }
    // After the host: nothing, a port, or an absolute-form trailing dot.
    match &header[entry.len()..] {
        [] => true,
        [b'.'] => true,
        rest => rest[0] == b':',
    }
}

fn path_matches(entry: &[u8], directory: bool, path: &[u8]) -> bool {
    if path.len() < entry.len() || &path[..entry.len()] != entry {
        return false;
    }
    match &path[entry.len()..] {
        [] => true,
        [b'/'] => true,
        rest => directory && rest[0] == b'/',
    }
}
