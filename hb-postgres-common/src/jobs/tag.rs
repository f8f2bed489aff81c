//! Tagged-payload wire format shared by producers and workers.
//!
//! The queue itself never inspects payload bytes; this module is the convention
//! both sides of the queue use to agree on which handler a payload belongs to,
//! without the driver knowing about it.

/// Separates the job-type tag from the body in an encoded payload.
const TAG_SEPARATOR: u8 = 0;

/// Prepend `job_type` and a NUL separator to `body`, producing the bytes a
/// producer should push onto the queue.
pub fn encode_tagged(job_type: &str, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(job_type.len() + 1 + body.len());
    payload.extend_from_slice(job_type.as_bytes());
    payload.push(TAG_SEPARATOR);
    payload.extend_from_slice(body);
    payload
}

/// Split a claimed payload back into its job-type tag and body. Returns `None`
/// if the payload has no tag separator or the tag isn't valid UTF-8.
pub fn decode_tagged(payload: &[u8]) -> Option<(&str, &[u8])> {
    let index = payload.iter().position(|byte| *byte == TAG_SEPARATOR)?;
    let (tag, rest) = payload.split_at(index);
    let body = &rest[1..];
    std::str::from_utf8(tag).ok().map(|tag| (tag, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let payload = encode_tagged("send_email", b"{\"to\":\"a@b.com\"}");
        let (tag, body) = decode_tagged(&payload).expect("should decode");
        assert_eq!(tag, "send_email");
        assert_eq!(body, b"{\"to\":\"a@b.com\"}");
    }

    #[test]
    fn test_decode_missing_separator_is_none() {
        assert!(decode_tagged(b"no-separator-here").is_none());
    }

    #[test]
    fn test_decode_empty_body() {
        let payload = encode_tagged("ping", b"");
        let (tag, body) = decode_tagged(&payload).unwrap();
        assert_eq!(tag, "ping");
        assert!(body.is_empty());
    }
}
