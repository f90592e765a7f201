use std::borrow::Cow;

pub fn parse_http_status_code(raw: &[u8]) -> Option<u16> {
    let (header_text, _) = parse_http_response_parts(raw)?;
    parse_http_status_code_from_headers(&header_text)
}

pub fn is_success_status(status_code: u16) -> bool {
    (200..300).contains(&status_code)
}

/// True once the buffered bytes hold the full headers and, when the length is
/// knowable, the full body.
pub fn is_complete_http_response(raw: &[u8]) -> bool {
    let Some((header_text, body)) = parse_http_response_parts(raw) else {
        return false;
    };
    let header_text = header_text.to_ascii_lowercase();

    if header_text.contains("transfer-encoding: chunked") {
        return body.windows(5).any(|window| window == b"0\r\n\r\n");
    }

    if let Some(content_length) = header_text
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
    {
        return body.len() >= content_length;
    }

    false
}

fn parse_http_response_parts(raw: &[u8]) -> Option<(Cow<'_, str>, &[u8])> {
    let header_end = raw.windows(4).position(|window| window == b"\r\n\r\n")?;
    let (header_bytes, body_bytes) = raw.split_at(header_end + 4);
    Some((String::from_utf8_lossy(header_bytes), body_bytes))
}

fn parse_http_status_code_from_headers(header_text: &str) -> Option<u16> {
    header_text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_http_status_code_extracts_status_line() {
        let raw = b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n";
        assert_eq!(parse_http_status_code(raw), Some(204));
    }

    #[test]
    fn parse_http_status_code_needs_complete_headers() {
        assert_eq!(parse_http_status_code(b"HTTP/1.1 200 OK\r\n"), None);
        assert_eq!(parse_http_status_code(b"garbage\r\n\r\n"), None);
    }

    #[test]
    fn success_status_is_2xx_only() {
        assert!(is_success_status(200));
        assert!(is_success_status(204));
        assert!(!is_success_status(302));
        assert!(!is_success_status(503));
    }

    #[test]
    fn is_complete_http_response_respects_content_length() {
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
        assert!(is_complete_http_response(full));

        let partial = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nO";
        assert!(!is_complete_http_response(partial));
    }

    #[test]
    fn is_complete_http_response_waits_for_last_chunk() {
        let open = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n";
        assert!(!is_complete_http_response(open));

        let closed = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n";
        assert!(is_complete_http_response(closed));
    }
}
