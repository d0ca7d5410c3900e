//! Request-target canonicalization.
//!
//! Matching against the handler registry happens on a canonical form of the
//! request target: query stripped, any absolute-form scheme and authority
//! removed, percent escapes decoded. The canonical form is plain bytes, not
//! a `Uri` — decoding can produce bytes a URI may not contain.

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn strip_scheme<'a>(target: &'a [u8], scheme: &str) -> Option<&'a [u8]> {
    let prefix = scheme.len();
    if target.len() >= prefix && target[..prefix].eq_ignore_ascii_case(scheme.as_bytes()) {
        Some(&target[prefix..])
    } else {
        None
    }
}

/// Canonicalizes a request target as received on the request line.
///
/// Never fails: any byte sequence in, some path out. A malformed percent
/// escape copies the `%` through unchanged, and a decoded NUL truncates the
/// result, matching how the matcher treats the path as a C-style string.
pub(crate) fn canonical_path(target: &[u8]) -> Vec<u8> {
    let mut src = target;

    // Drop the query.
    if let Some(q) = src.iter().position(|&b| b == b'?') {
        src = &src[..q];
    }

    // Absolute-form targets: skip past the authority.
    if let Some(rest) = strip_scheme(src, "http://").or_else(|| strip_scheme(src, "https://")) {
        match rest.iter().position(|&b| b == b'/') {
            Some(slash) => src = &rest[slash..],
            None => return b"/".to_vec(),
        }
    }

    // Percent-decode. Decoding only ever shrinks.
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let c = src[i];
        if c == b'%' && i + 2 < src.len() {
            if let (Some(hi), Some(lo)) = (hex_val(src[i + 1]), hex_val(src[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }

    // %00 terminates the path.
    if let Some(nul) = out.iter().position(|&b| b == 0) {
        out.truncate(nul);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::canonical_path;

    fn canon(s: &str) -> Vec<u8> {
        canonical_path(s.as_bytes())
    }

    #[test]
    fn plain_paths_pass_through() {
        assert_eq!(canon("/"), b"/");
        assert_eq!(canon("/index.html"), b"/index.html");
    }

    #[test]
    fn query_is_dropped() {
        assert_eq!(canon("/search?q=one%20two"), b"/search");
        assert_eq!(canon("/?"), b"/");
    }

    #[test]
    fn absolute_form_loses_authority() {
        assert_eq!(canon("http://example.com/a/b"), b"/a/b");
        assert_eq!(canon("HTTPS://EXAMPLE.COM/x"), b"/x");
        assert_eq!(canon("http://example.com"), b"/");
        assert_eq!(canon("http://example.com?q=1"), b"/");
    }

    #[test]
    fn percent_escapes_decode() {
        assert_eq!(canon("/a%20b"), b"/a b");
        assert_eq!(canon("/%41%42%43"), b"/ABC");
    }

    #[test]
    fn decoded_slash_is_not_special() {
        assert_eq!(canon("/a%2Fb"), b"/a/b");
        assert_eq!(canon("/a%2fb"), b"/a/b");
    }

    #[test]
    fn garbage_escapes_copy_through() {
        assert_eq!(canon("/a%2"), b"/a%2");
        assert_eq!(canon("/a%zzb"), b"/a%zzb");
        assert_eq!(canon("/100%"), b"/100%");
    }

    #[test]
    fn nul_truncates() {
        assert_eq!(canon("/a%00b"), b"/a");
        assert_eq!(canon("/%00"), b"/");
    }

    #[test]
    fn idempotent_on_decoded_paths() {
        for case in &["/", "/a b", "/a/b/c", "/trailing/", "*"] {
            let once = canonical_path(case.as_bytes());
            let twice = canonical_path(&once);
            assert_eq!(once, twice, "case {:?}", case);
        }
    }
}
