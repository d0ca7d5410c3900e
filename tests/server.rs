#![deny(warnings)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;

use wharf::{handler_fn, Directory, Exchange, Handler, Route, Server};

async fn serve() -> Server {
    let _ = pretty_env_logger::try_init();
    let directory = Directory::new();
    let server = directory.open("http://127.0.0.1:0").await.expect("open");
    server.start().expect("start");
    server
}

async fn connect(server: &Server) -> TcpStream {
    TcpStream::connect(server.local_addr().expect("local_addr"))
        .await
        .expect("connect")
}

fn hello() -> impl Handler {
    handler_fn(|_req| async { Ok(Response::new(Bytes::from_static(b"hello"))) })
}

/// Reads status line and headers, up to and including the blank line.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return String::from_utf8_lossy(&buf[..end + 4]).to_string();
        }
        let n = stream.read(&mut tmp).await.expect("read head");
        assert!(
            n > 0,
            "eof before response head, got {:?}",
            String::from_utf8_lossy(&buf)
        );
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Reads a full response: head plus a `Content-Length` body.
async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end + 4]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().expect("content-length value"))
                })
                .unwrap_or(0);
            let total = end + 4 + content_length;
            while buf.len() < total {
                let n = stream.read(&mut tmp).await.expect("read body");
                assert!(n > 0, "eof mid body");
                buf.extend_from_slice(&tmp[..n]);
            }
            assert_eq!(buf.len(), total, "unexpected bytes after the response");
            return String::from_utf8_lossy(&buf).to_string();
        }
        let n = stream.read(&mut tmp).await.expect("read head");
        assert!(
            n > 0,
            "eof before response head, got {:?}",
            String::from_utf8_lossy(&buf)
        );
        buf.extend_from_slice(&tmp[..n]);
    }
}

async fn expect_eof(stream: &mut TcpStream) {
    let mut tmp = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut tmp))
        .await
        .expect("timed out waiting for eof")
        .expect("read");
    assert_eq!(n, 0, "expected eof, got {:?}", &tmp[..n]);
}

#[tokio::test]
async fn get_is_served_and_the_connection_persists() {
    let server = serve().await;
    server.add_handler(Route::get("/hi"), hello()).unwrap();

    let mut stream = connect(&server).await;
    for _ in 0..2 {
        stream
            .write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut stream).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", response);
        assert!(response.ends_with("\r\n\r\nhello"), "{:?}", response);
        assert!(!response.to_ascii_lowercase().contains("connection: close"));
    }
}

#[tokio::test]
async fn head_sends_get_headers_and_no_body() {
    let server = serve().await;
    server
        .add_handler(
            Route::get("/hi"),
            handler_fn(|_req| async {
                let mut response = Response::new(Bytes::from_static(b"hello"));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                Ok(response)
            }),
        )
        .unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"HEAD /hi HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    let lower = head.to_ascii_lowercase();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", head);
    assert!(lower.contains("content-length: 5\r\n"), "{:?}", head);
    assert!(lower.contains("content-type: text/plain\r\n"), "{:?}", head);

    // No body bytes were written: the next response begins immediately.
    stream
        .write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", response);
    assert!(response.ends_with("hello"), "{:?}", response);
}

#[tokio::test]
async fn unknown_routes_are_404_and_do_not_kill_the_connection() {
    let server = serve().await;
    server.add_handler(Route::get("/hi"), hello()).unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response.starts_with("HTTP/1.1 404 Not Found\r\n"),
        "{:?}",
        response
    );

    stream
        .write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", response);
}

#[tokio::test]
async fn wrong_method_is_405() {
    let server = serve().await;
    server
        .add_handler(Route::new(Method::POST, "/x"), hello())
        .unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"),
        "{:?}",
        response
    );
}

#[tokio::test]
async fn http10_closes_after_the_response() {
    let server = serve().await;
    server.add_handler(Route::get("/hi"), hello()).unwrap();

    let mut stream = connect(&server).await;
    stream.write_all(b"GET /hi HTTP/1.0\r\n\r\n").await.unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", response);
    assert!(!response.to_ascii_lowercase().contains("keep-alive"));
    expect_eof(&mut stream).await;
}

#[tokio::test]
async fn close_token_in_a_list_closes() {
    let server = serve().await;
    server.add_handler(Route::get("/hi"), hello()).unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\nConnection: keep-alive, close\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response.to_ascii_lowercase().contains("connection: close\r\n"),
        "{:?}",
        response
    );
    expect_eof(&mut stream).await;
}

#[tokio::test]
async fn newer_http_versions_get_505() {
    let server = serve().await;

    let mut stream = connect(&server).await;
    stream.write_all(b"GET /x HTTP/2.0\r\n\r\n").await.unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response.starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"),
        "{:?}",
        response
    );
    expect_eof(&mut stream).await;
}

#[tokio::test]
async fn ancient_http_versions_get_400() {
    let server = serve().await;

    let mut stream = connect(&server).await;
    stream.write_all(b"GET /x HTTP/0.9\r\n\r\n").await.unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "{:?}",
        response
    );
    assert!(response.to_ascii_lowercase().contains("connection: close"));
    expect_eof(&mut stream).await;
}

#[tokio::test]
async fn request_bodies_reach_the_handler() {
    let server = serve().await;
    server
        .add_handler(
            Route::new(Method::POST, "/echo"),
            handler_fn(|req| async move { Ok(Response::new(req.into_body())) }),
        )
        .unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 7\r\n\r\npayload")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.ends_with("payload"), "{:?}", response);

    // The body was consumed; the connection still frames correctly.
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nok")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.ends_with("ok"), "{:?}", response);
}

#[tokio::test]
async fn chunked_requests_are_refused() {
    let server = serve().await;

    let mut stream = connect(&server).await;
    stream
        .write_all(b"POST /x HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "{:?}",
        response
    );
    expect_eof(&mut stream).await;
}

#[tokio::test]
async fn percent_escapes_match_decoded_routes() {
    let server = serve().await;
    server.add_handler(Route::get("/a b"), hello()).unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /a%20b HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", response);
}

#[tokio::test]
async fn trailing_slash_routes_match_both_spellings() {
    let server = serve().await;
    server.add_handler(Route::get("/foo/"), hello()).unwrap();

    let mut stream = connect(&server).await;
    for (target, expected) in &[
        ("/foo", "HTTP/1.1 200"),
        ("/foo/", "HTTP/1.1 200"),
        ("/foo/bar", "HTTP/1.1 404"),
    ] {
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", target).as_bytes())
            .await
            .unwrap();
        let response = read_response(&mut stream).await;
        assert!(
            response.starts_with(expected),
            "target {:?} got {:?}",
            target,
            response
        );
    }
}

#[tokio::test]
async fn host_restricted_routes_check_the_host_header() {
    let server = serve().await;
    server
        .add_handler(Route::get("/h").host("example.com"), hello())
        .unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /h HTTP/1.1\r\nHost: EXAMPLE.com:8080\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", response);

    stream
        .write_all(b"GET /h HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{:?}", response);
}

#[tokio::test]
async fn overlapping_routes_are_rejected() {
    let server = serve().await;
    server.add_handler(Route::get("/foo"), hello()).unwrap();
    let err = server.add_handler(Route::get("/foobar"), hello()).unwrap_err();
    assert!(err.is_address_in_use());
}

struct RawReply;

impl Handler for RawReply {
    fn call(&self, mut exchange: Exchange) -> BoxFuture<'static, wharf::Result<Exchange>> {
        Box::pin(async move {
            exchange
                .write_raw(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                .await?;
            Ok(exchange)
        })
    }
}

#[tokio::test]
async fn handlers_may_write_their_own_response_bytes() {
    let server = serve().await;
    server.add_handler(Route::get("/raw"), RawReply).unwrap();
    server.add_handler(Route::get("/hi"), hello()).unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /raw HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response.starts_with("HTTP/1.1 204 No Content\r\n"),
        "{:?}",
        response
    );

    // The session kept the connection and keeps serving.
    stream
        .write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", response);
}

struct WsEcho;

impl Handler for WsEcho {
    fn call(&self, mut exchange: Exchange) -> BoxFuture<'static, wharf::Result<Exchange>> {
        Box::pin(async move {
            let mut upgraded = exchange.upgrade()?;
            tokio::spawn(async move {
                upgraded
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
                    .await
                    .unwrap();
                let mut buf = [0u8; 64];
                loop {
                    let n = upgraded.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    upgraded.write_all(&buf[..n]).await.unwrap();
                }
            });
            Ok(exchange)
        })
    }
}

#[tokio::test]
async fn upgraders_keep_the_transport_past_server_stop() {
    let server = serve().await;
    server
        .add_handler(Route::get("/ws").upgrader(true), WsEcho)
        .unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(
        head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "{:?}",
        head
    );

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // The session is finished; stop() does not wait on the upgraded pipe,
    // and stopping the server does not close it.
    timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop timed out");

    stream.write_all(b"pong").await.unwrap();
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn non_upgraders_cannot_take_the_transport() {
    struct Sneaky;
    impl Handler for Sneaky {
        fn call(&self, mut exchange: Exchange) -> BoxFuture<'static, wharf::Result<Exchange>> {
            Box::pin(async move {
                assert!(exchange.upgrade().is_err());
                exchange.respond(Response::new(Bytes::from_static(b"denied")));
                Ok(exchange)
            })
        }
    }

    let server = serve().await;
    server.add_handler(Route::get("/s"), Sneaky).unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /s HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.ends_with("denied"), "{:?}", response);
}

#[tokio::test]
async fn removing_a_handler_mid_flight_lets_the_dispatch_finish() {
    let server = serve().await;
    let gate = Arc::new(Notify::new());
    let handler_gate = Arc::clone(&gate);
    let id = server
        .add_handler(
            Route::get("/slow"),
            handler_fn(move |_req| {
                let gate = Arc::clone(&handler_gate);
                async move {
                    gate.notified().await;
                    Ok(Response::new(Bytes::from_static(b"late")))
                }
            }),
        )
        .unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    // Let the dispatch reach the handler before pulling it out.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.remove_handler(id);
    gate.notify_waiters();

    let response = read_response(&mut stream).await;
    assert!(response.ends_with("late"), "{:?}", response);

    // The route is gone for new requests.
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{:?}", response);
}

#[tokio::test]
async fn stop_cancels_idle_sessions_and_drains() {
    let server = serve().await;
    server.add_handler(Route::get("/hi"), hello()).unwrap();

    // One served request pins the session; it then idles in its next read.
    let mut idle = connect(&server).await;
    idle.write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    read_response(&mut idle).await;

    timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop timed out");
    expect_eof(&mut idle).await;

    // A second start/stop cycle works on the same server.
    server.start().expect("restart");
    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{:?}", response);
    server.stop().await;
}

#[tokio::test]
async fn start_is_reference_counted() {
    let server = serve().await;
    server.start().expect("second start");

    // One stop leaves the listener up.
    server.stop().await;
    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{:?}", response);

    server.stop().await;
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn static_blobs_are_served_with_a_default_content_type() {
    let server = serve().await;
    server
        .add_static(None, None, "/blob", &b"binary-blob"[..])
        .unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /blob HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response
            .to_ascii_lowercase()
            .contains("content-type: application/octet-stream\r\n"),
        "{:?}",
        response
    );
    assert!(response.ends_with("binary-blob"), "{:?}", response);
}

#[tokio::test]
async fn files_are_served_with_an_inferred_content_type() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("wharf-test-{}.html", std::process::id()));
    std::fs::write(&path, "<h1>hi</h1>").unwrap();

    let server = serve().await;
    server.add_file(None, None, "/page", path.clone()).unwrap();
    server
        .add_file(None, None, "/missing", dir.join("wharf-no-such-file"))
        .unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /page HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(
        response
            .to_ascii_lowercase()
            .contains("content-type: text/html; charset=utf8\r\n"),
        "{:?}",
        response
    );
    assert!(response.ends_with("<h1>hi</h1>"), "{:?}", response);

    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{:?}", response);

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn the_global_directory_serves_opens_by_url() {
    let server = wharf::server::open("http://127.0.0.1:0").await.expect("open");
    server.start().expect("start");
    server.add_handler(Route::get("/hi"), hello()).unwrap();

    let mut stream = connect(&server).await;
    stream
        .write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", response);

    server.stop().await;
    server.close().await;
}
