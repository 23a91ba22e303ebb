//! Document-URI handling.
//!
//! URIs are compared byte-for-byte, so every URI entering the system is
//! canonicalized through a path round-trip first. The encoder is
//! deliberately aggressive: every byte outside `/`, `.` and
//! alphanumerics becomes `%HH`, which keeps the encoding stable across
//! clients that disagree about which characters need escaping.
//!
//! A URI whose scheme is not `file` is a virtual document. Its path form
//! is the whole URI behind the `///` marker, and it round-trips verbatim.

use tower_lsp::lsp_types::Url;

use crate::error::ParseError;
use crate::path::{self, VIRTUAL_FILE_MARKER};

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Percent-encodes all bytes of `path` except `/`, `.` and alphanumerics.
pub fn encode(path: &str) -> String {
    let mut res = String::with_capacity(path.len());
    for &b in path.as_bytes() {
        if b == b'/' || b == b'.' || b.is_ascii_alphanumeric() {
            res.push(b as char);
        } else {
            res.push('%');
            res.push(HEX[(b >> 4) as usize] as char);
            res.push(HEX[(b & 0xf) as usize] as char);
        }
    }
    res
}

fn decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut res = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                res.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        res.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&res).into_owned()
}

/// Converts a host path (or `///`-marked virtual path) to a document URI.
pub fn path_to_uri(path: &str) -> Result<Url, ParseError> {
    if let Some(rest) = path.strip_prefix(VIRTUAL_FILE_MARKER) {
        return Url::parse(rest)
            .map_err(|e| ParseError::malformed(format!("invalid virtual document uri '{rest}': {e}")));
    }
    let raw = format!("file://{}", encode(&path::to_compiler_path(path)));
    Url::parse(&raw).map_err(|e| ParseError::malformed(format!("invalid file uri '{raw}': {e}")))
}

/// Converts a document URI back to a host path. Virtual URIs come back
/// with the `///` marker in front.
pub fn uri_to_path(uri: &Url) -> String {
    if uri.scheme() == "file" {
        path::from_compiler_path(&decode(uri.path()))
    } else {
        format!("{VIRTUAL_FILE_MARKER}{uri}")
    }
}

/// Converts a document URI directly to compiler path form.
pub fn uri_to_compiler_path(uri: &Url) -> String {
    path::to_compiler_path(&uri_to_path(uri))
}

/// Canonical form of `uri`: the result of a path round-trip. Idempotent.
pub fn canonicalize(uri: &Url) -> Url {
    path_to_uri(&uri_to_path(uri)).unwrap_or_else(|_| uri.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_everything_but_the_safe_set() {
        assert_eq!(encode("/a/b.toit"), "/a/b.toit");
        assert_eq!(encode("/a b"), "/a%20b");
        assert_eq!(encode("/a-b_c"), "/a%2db%5fc");
        assert_eq!(encode("/ä"), "/%c3%a4");
    }

    #[test]
    fn path_uri_round_trip() {
        let uri = path_to_uri("/foo/bar baz.toit").unwrap();
        assert_eq!(uri.as_str(), "file:///foo/bar%20baz.toit");
        assert_eq!(uri_to_path(&uri), "/foo/bar baz.toit");
    }

    #[test]
    fn virtual_uris_round_trip_verbatim() {
        let uri = path_to_uri("///untitled:Untitled-1").unwrap();
        assert_eq!(uri.as_str(), "untitled:Untitled-1");
        assert_eq!(uri_to_path(&uri), "///untitled:Untitled-1");
        assert_eq!(uri_to_compiler_path(&uri), "///untitled:Untitled-1");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for raw in [
            "file:///simple.toit",
            "file:///with-dash/and_underscore.toit",
            "untitled:Untitled-1",
        ] {
            let uri = Url::parse(raw).unwrap();
            let once = canonicalize(&uri);
            let twice = canonicalize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn canonicalize_unifies_escapes() {
        let plain = Url::parse("file:///a-b.toit").unwrap();
        let escaped = Url::parse("file:///a%2db.toit").unwrap();
        assert_ne!(plain, escaped);
        assert_eq!(canonicalize(&plain), canonicalize(&escaped));
    }
}
