//! Request-path normalization (`spec.md` §4.6, testable property 7).
//!
//! Every gateway request path is canonicalised before routing: null bytes
//! (raw or percent-encoded) are rejected, `..` segments are rejected after
//! percent-decoding, doubled slashes are rejected, and the result is a
//! clean absolute path with no `.` segments.

use percent_encoding::percent_decode_str;

use crate::error::GatewayError;

/// Canonicalises `raw` (the request's undecoded path) per `spec.md` §4.6.
///
/// # Errors
///
/// Returns [`GatewayError::BadPath`] if `raw` contains a null byte (raw or
/// percent-encoded), a `..` segment after percent-decoding, a `//` run, or
/// does not decode as UTF-8.
pub fn canonicalise_path(raw: &str) -> Result<String, GatewayError> {
    if raw.contains('\0') {
        return Err(GatewayError::BadPath("raw null byte in path".to_owned()));
    }
    if raw.contains("//") {
        return Err(GatewayError::BadPath("doubled slash in path".to_owned()));
    }

    let decoded_bytes = percent_decode_str(raw).collect::<Vec<u8>>();
    if decoded_bytes.contains(&0) {
        return Err(GatewayError::BadPath(
            "percent-encoded null byte in path".to_owned(),
        ));
    }
    let decoded = String::from_utf8(decoded_bytes)
        .map_err(|_| GatewayError::BadPath("path is not valid UTF-8 after decoding".to_owned()))?;

    let mut clean = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(GatewayError::BadPath("`..` segment in path".to_owned()));
            }
            other => clean.push(other),
        }
    }

    Ok(format!("/{}", clean.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalises_to_clean_absolute_path() {
        assert_eq!(canonicalise_path("/a/./b").unwrap(), "/a/b");
        assert_eq!(canonicalise_path("a/b").unwrap(), "/a/b");
        assert_eq!(canonicalise_path("/").unwrap(), "/");
    }

    #[test]
    fn rejects_raw_null_byte() {
        assert!(canonicalise_path("/a\0b").is_err());
    }

    #[test]
    fn rejects_percent_encoded_null_byte() {
        assert!(canonicalise_path("/a%00b").is_err());
    }

    #[test]
    fn rejects_dot_dot_after_decode() {
        assert!(canonicalise_path("/a/..%2f..%2fetc/passwd").is_err());
        assert!(canonicalise_path("/a/../b").is_err());
    }

    #[test]
    fn rejects_doubled_slash() {
        assert!(canonicalise_path("/a//b").is_err());
    }
}
