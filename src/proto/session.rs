//! The per-connection session: reads requests, dispatches them, writes
//! responses, and honors HTTP/1.x persistence.
//!
//! One session is one spawned task driving the connection linearly. At any
//! moment exactly one thing is in flight — a read, a dispatch, or a write —
//! so responses are always fully written before the next request is read.
//! Server shutdown flips a watch channel the whole task is raced against;
//! losing that race drops the transport at whatever await point the session
//! had reached.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, HOST};
use http::{HeaderMap, Method, Response, StatusCode, Version};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::canon::canonical_path;
use crate::proto::h1::Transport;
use crate::registry::Lookup;
use crate::server::ServerCore;
use crate::service::Exchange;

pub(crate) async fn run(
    server: Arc<ServerCore>,
    io: Transport,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = serve(&server, io) => {}
        _ = shutdown.changed() => {
            trace!("session canceled by server shutdown");
        }
    }
}

async fn serve(server: &ServerCore, mut io: Transport) {
    let mut close = false;
    loop {
        let request = match io.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                if let Some(status) = err.response_status() {
                    debug!("request refused: {}", err);
                    let _ = write_error(&mut io, status, true).await;
                } else if !err.is_incomplete_message() {
                    debug!("session read failed: {}", err);
                }
                break;
            }
        };

        if request.version() != Version::HTTP_11 {
            close = true;
        }
        if connection_wants_close(request.headers()) {
            close = true;
        }
        let head = request.method() == Method::HEAD;
        let canon = Bytes::from(canonical_path(request.uri().to_string().as_bytes()));

        let host = request.headers().get(HOST).map(|v| v.as_bytes().to_vec());
        let endpoint = match server.lookup(request.method(), &canon, host.as_deref()) {
            Lookup::Found(endpoint) => endpoint,
            Lookup::NoneMatching => {
                if write_error(&mut io, StatusCode::NOT_FOUND, close).await.is_err() || close {
                    break;
                }
                continue;
            }
            Lookup::MethodNotAllowed => {
                if write_error(&mut io, StatusCode::METHOD_NOT_ALLOWED, close)
                    .await
                    .is_err()
                    || close
                {
                    break;
                }
                continue;
            }
        };

        let exchange = Exchange::new(request, canon, io, endpoint.is_upgrader());
        let result = endpoint.handler().call(exchange).await;
        // The dispatch's reference to the endpoint ends here; a handler
        // removed from the registry mid-flight is freed now.
        drop(endpoint);

        let (returned_io, response) = match result {
            Ok(exchange) => exchange.into_parts(),
            Err(err) => {
                debug!("handler failed: {}", err);
                return;
            }
        };
        io = match returned_io {
            Some(io) => io,
            None => {
                trace!("connection upgraded; transport now belongs to the handler");
                return;
            }
        };

        let mut response = match response {
            Some(response) => response,
            None => {
                // The handler wrote its own response bytes.
                if close {
                    break;
                }
                continue;
            }
        };

        if connection_wants_close(response.headers()) {
            close = true;
        }
        if close && !connection_wants_close(response.headers()) {
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        // HEAD gets the headers GET would have sent, and nothing else.
        let body_len = response.body().len();
        if io.write_head(&response, body_len).await.is_err() {
            break;
        }
        if !head && body_len > 0 {
            if io.write_body(response.body()).await.is_err() {
                break;
            }
        }
        if close {
            break;
        }
    }
    io.shutdown().await;
}

async fn write_error(io: &mut Transport, status: StatusCode, close: bool) -> crate::Result<()> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    if close {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    io.write_head(&response, 0).await
}

fn connection_wants_close(headers: &HeaderMap) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .as_bytes()
            .windows(5)
            .any(|w| w.eq_ignore_ascii_case(b"close"))
    })
}
