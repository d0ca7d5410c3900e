//! File-extension to content-type mapping for the file handler.

pub(crate) const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Returns the content type for a file extension, if it is a known one.
///
/// Lookups are case-insensitive; callers pass the extension without the dot.
pub(crate) fn from_extension(extension: &str) -> Option<&'static str> {
    let lower = extension.to_ascii_lowercase();
    let ty = match lower.as_str() {
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        "css" => "text/css",
        "csv" => "text/csv; charset=utf8",
        "gif" => "image/gif",
        "gz" => "application/gzip",
        "htm" | "html" => "text/html; charset=utf8",
        "ico" => "image/x-icon",
        "jpeg" | "jpg" => "image/jpeg",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "md" => "text/markdown; charset=utf8",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "ogg" => "audio/ogg",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "tar" => "application/x-tar",
        "tif" | "tiff" => "image/tiff",
        "ttf" => "font/ttf",
        "txt" => "text/plain; charset=utf8",
        "wasm" => "application/wasm",
        "wav" => "audio/wav",
        "webm" => "video/webm",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "xml" => "text/xml; charset=utf8",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(ty)
}

/// Returns the content type for a filesystem path, falling back to
/// `application/octet-stream` when the extension is missing or unknown.
pub(crate) fn guess(path: &std::path::Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(from_extension)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn known_extensions() {
        assert_eq!(from_extension("html"), Some("text/html; charset=utf8"));
        assert_eq!(from_extension("PNG"), Some("image/png"));
        assert_eq!(from_extension("woff2"), Some("font/woff2"));
    }

    #[test]
    fn unknown_extensions_fall_back() {
        assert_eq!(from_extension("wat"), None);
        assert_eq!(guess(Path::new("blob.wat")), DEFAULT_CONTENT_TYPE);
        assert_eq!(guess(Path::new("no_extension")), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn guess_uses_the_last_extension() {
        assert_eq!(guess(Path::new("archive.tar.gz")), "application/gzip");
        assert_eq!(guess(Path::new("page.en.html")), "text/html; charset=utf8");
    }
}
