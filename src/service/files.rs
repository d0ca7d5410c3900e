//! Built-in handlers serving memory blobs and filesystem files.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use tracing::debug;

use super::{Exchange, Handler};
use crate::mime;

/// Serves a fixed blob of memory.
#[derive(Debug)]
pub(crate) struct StaticHandler {
    content_type: HeaderValue,
    data: Bytes,
}

impl StaticHandler {
    pub(crate) fn new(content_type: Option<&str>, data: Bytes) -> crate::Result<StaticHandler> {
        let content_type = parse_content_type(content_type.unwrap_or(mime::DEFAULT_CONTENT_TYPE))?;
        Ok(StaticHandler { content_type, data })
    }
}

impl Handler for StaticHandler {
    fn call(&self, mut exchange: Exchange) -> BoxFuture<'static, crate::Result<Exchange>> {
        let mut response = Response::new(self.data.clone());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, self.content_type.clone());
        exchange.respond(response);
        Box::pin(async move { Ok(exchange) })
    }
}

/// Serves one filesystem file, read per request.
pub(crate) struct FileHandler {
    content_type: HeaderValue,
    path: PathBuf,
}

impl FileHandler {
    pub(crate) fn new(content_type: Option<&str>, path: PathBuf) -> crate::Result<FileHandler> {
        let content_type = match content_type {
            Some(ty) => parse_content_type(ty)?,
            None => HeaderValue::from_static(mime::guess(&path)),
        };
        Ok(FileHandler { content_type, path })
    }
}

impl Handler for FileHandler {
    fn call(&self, mut exchange: Exchange) -> BoxFuture<'static, crate::Result<Exchange>> {
        let path = self.path.clone();
        let content_type = self.content_type.clone();
        Box::pin(async move {
            let response = match tokio::fs::read(&path).await {
                Ok(data) => {
                    let mut response = Response::new(Bytes::from(data));
                    response.headers_mut().insert(CONTENT_TYPE, content_type);
                    response
                }
                Err(err) => {
                    debug!("file handler failed to read {:?}: {}", path, err);
                    let mut response = Response::new(Bytes::new());
                    *response.status_mut() = read_error_status(&err);
                    response
                }
            };
            exchange.respond(response);
            Ok(exchange)
        })
    }
}

fn parse_content_type(ty: &str) -> crate::Result<HeaderValue> {
    HeaderValue::from_str(ty)
        .map_err(|_| crate::Error::new_invalid_route("content type is not a valid header value"))
}

fn read_error_status(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_errors_map_to_statuses() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "x");
        assert_eq!(read_error_status(&not_found), StatusCode::NOT_FOUND);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "x");
        assert_eq!(read_error_status(&denied), StatusCode::FORBIDDEN);

        let other = io::Error::new(io::ErrorKind::Other, "x");
        assert_eq!(
            read_error_status(&other),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bad_content_type_is_an_invalid_registration() {
        let err = StaticHandler::new(Some("bad\nvalue"), Bytes::new()).unwrap_err();
        assert!(err.is_invalid_route());
    }
}
