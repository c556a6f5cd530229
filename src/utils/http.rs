//! HTTP utility functions

use crate::models::Header;

/// Find the first value of a header, compared case-insensitively
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_slice())
}

/// Check whether any comma-separated element of the named header(s) equals `token`
///
/// Used for list-valued headers such as `Connection` and `Transfer-Encoding`.
pub fn has_token(headers: &[Header], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .flat_map(|h| h.value.split(|b| *b == b','))
        .any(|item| trim_ascii(item).eq_ignore_ascii_case(token.as_bytes()))
}

/// Check whether `chunked` is the final transfer coding
pub fn is_chunked(headers: &[Header]) -> bool {
    let last = headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
        .flat_map(|h| h.value.split(|b| *b == b','))
        .map(trim_ascii)
        .filter(|item| !item.is_empty())
        .last();

    matches!(last, Some(coding) if coding.eq_ignore_ascii_case(b"chunked"))
}

/// Parse the Content-Length header
///
/// Repeated headers (or a comma-separated list) must agree, otherwise the
/// message framing is ambiguous and the message is rejected.
pub fn content_length(headers: &[Header]) -> Result<Option<u64>, String> {
    let mut length: Option<u64> = None;

    for header in headers.iter().filter(|h| h.name.eq_ignore_ascii_case("content-length")) {
        for item in header.value.split(|b| *b == b',') {
            let item = trim_ascii(item);
            if item.is_empty() || !item.iter().all(u8::is_ascii_digit) {
                return Err(format!(
                    "invalid content-length: {}",
                    String::from_utf8_lossy(&header.value)
                ));
            }
            let parsed = std::str::from_utf8(item)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| "content-length out of range".to_string())?;

            match length {
                Some(existing) if existing != parsed => {
                    return Err(format!(
                        "conflicting content-length values: {} and {}",
                        existing, parsed
                    ));
                }
                _ => length = Some(parsed),
            }
        }
    }

    Ok(length)
}

/// Replace every header with the given name by a single `name: value` entry
///
/// The new header takes the position of the first replaced one, or is
/// appended when the header was absent.
pub fn set_header(headers: &mut Vec<Header>, name: &str, value: &str) {
    let position = headers.iter().position(|h| h.name.eq_ignore_ascii_case(name));
    headers.retain(|h| !h.name.eq_ignore_ascii_case(name));

    let header = Header::new(name, value.as_bytes());
    match position {
        Some(index) => headers.insert(index.min(headers.len()), header),
        None => headers.push(header),
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}
