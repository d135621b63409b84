//! Binary-vs-text body classification, shared by both sides of a relay.
//!
//! The server encodes a request body before handing it to the agent;
//! the agent encodes a response body before handing it back. Both must
//! agree on what counts as "text" or the other side will misinterpret
//! base64 as literal bytes (or vice versa), so this logic lives here
//! once rather than twice.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Marker header added to carry the binary/text decision across the wire
/// alongside the original headers.
pub const BODY_ENCODING_HEADER: &str = "x-relay-body-encoding";

/// Encodes `body` for wire transport. A `Content-Type` naming an image,
/// video, audio, or font type, or one of `application/octet-stream`,
/// `application/pdf`, `application/zip`, is base64-encoded; everything
/// else (including a missing `Content-Type`) is decoded as UTF-8 with
/// replacement. Returns `(is_binary, encoded_text)`.
pub fn encode(headers: &[(String, String)], body: &[u8]) -> (bool, String) {
    if body.is_empty() {
        return (false, String::new());
    }
    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.as_str())
        .unwrap_or("");
    if is_binary_content_type(content_type) {
        (true, BASE64.encode(body))
    } else {
        (false, String::from_utf8_lossy(body).into_owned())
    }
}

/// Decodes a wire body back to bytes given the `is_binary` flag it was
/// encoded with.
pub fn decode(is_binary: bool, text: &str) -> Vec<u8> {
    if is_binary {
        BASE64.decode(text).unwrap_or_default()
    } else {
        text.as_bytes().to_vec()
    }
}

fn is_binary_content_type(content_type: &str) -> bool {
    let base = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    base.starts_with("image/")
        || base.starts_with("video/")
        || base.starts_with("audio/")
        || base.starts_with("font/")
        || base == "application/octet-stream"
        || base == "application/pdf"
        || base == "application/zip"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_types_round_trip_as_utf8() {
        let headers = vec![("Content-Type".to_string(), "text/plain; charset=utf-8".to_string())];
        let (is_binary, text) = encode(&headers, b"hello world");
        assert!(!is_binary);
        assert_eq!(decode(is_binary, &text), b"hello world");
    }

    #[test]
    fn json_is_treated_as_text() {
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        let (is_binary, text) = encode(&headers, br#"{"a":1}"#);
        assert!(!is_binary);
        assert_eq!(text, r#"{"a":1}"#);
    }

    #[test]
    fn binary_types_round_trip_through_base64() {
        let headers = vec![("Content-Type".to_string(), "image/png".to_string())];
        let bytes = vec![0xffu8, 0x00, 0xd8, 0xc3, 0x10];
        let (is_binary, text) = encode(&headers, &bytes);
        assert!(is_binary);
        assert_eq!(decode(is_binary, &text), bytes);
    }

    #[test]
    fn non_utf8_bytes_under_a_text_type_are_replaced_not_preserved() {
        let headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
        let bytes = vec![0xff, 0xfe, 0x00, 0x01];
        let (is_binary, text) = encode(&headers, &bytes);
        assert!(!is_binary);
        assert_eq!(text, String::from_utf8_lossy(&bytes));
        assert_ne!(decode(is_binary, &text), bytes);
    }

    #[test]
    fn empty_body_is_never_classified_as_binary() {
        let (is_binary, text) = encode(&[], b"");
        assert!(!is_binary);
        assert!(text.is_empty());
    }

    #[test]
    fn a_missing_content_type_is_classified_as_text() {
        let (is_binary, text) = encode(&[], b"plain upstream body");
        assert!(!is_binary);
        assert_eq!(text, "plain upstream body");
    }

    #[test]
    fn video_audio_and_font_types_are_classified_as_binary() {
        for ct in ["video/mp4", "audio/mpeg", "font/woff2", "application/octet-stream", "application/pdf", "application/zip"] {
            let headers = vec![("Content-Type".to_string(), ct.to_string())];
            let (is_binary, _) = encode(&headers, b"\x00\x01\x02");
            assert!(is_binary, "{ct} should classify as binary");
        }
    }

    #[test]
    fn an_uncommon_text_type_is_not_misclassified_as_binary() {
        let headers = vec![("Content-Type".to_string(), "application/vnd.api+json".to_string())];
        let (is_binary, text) = encode(&headers, b"{}");
        assert!(!is_binary);
        assert_eq!(text, "{}");
    }
}
