//! Pieces pertaining to the HTTP/1.x wire protocol and its per-connection
//! driver.

pub(crate) mod h1;
pub(crate) mod session;
