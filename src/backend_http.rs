use std::{io::ErrorKind, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};
use url::Url;

use crate::http_response;

pub fn backend_base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

/// Issues `GET api_path` against `base_url` and returns the response status.
///
/// Connection failures, malformed responses and exceeding `timeout` all map
/// to `None`; a probe never errors.
pub async fn request_status_code(base_url: &str, api_path: &str, timeout: Duration) -> Option<u16> {
    let raw = time::timeout(timeout, request_response_bytes("GET", base_url, api_path))
        .await
        .ok()??;
    http_response::parse_http_status_code(&raw)
}

/// Plain TCP reachability of the backend listener.
pub async fn ping_backend(base_url: &str, timeout: Duration) -> bool {
    let Some((host, port)) = host_and_port(base_url) else {
        return false;
    };
    matches!(
        time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await,
        Ok(Ok(_))
    )
}

fn host_and_port(base_url: &str) -> Option<(String, u16)> {
    let parsed = Url::parse(base_url).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(80);
    Some((host, port))
}

async fn request_response_bytes(method: &str, base_url: &str, api_path: &str) -> Option<Vec<u8>> {
    let base = Url::parse(base_url).ok()?;
    let request_url = base.join(api_path).ok()?;
    if request_url.scheme() != "http" {
        return None;
    }

    let host = request_url.host_str()?;
    let port = request_url.port_or_known_default().unwrap_or(80);
    let mut stream = TcpStream::connect((host, port)).await.ok()?;

    let mut request_target = request_url.path().to_string();
    if let Some(query) = request_url.query() {
        request_target.push('?');
        request_target.push_str(query);
    }
    if request_target.is_empty() {
        request_target = "/".to_string();
    }

    let request = format!(
        "{method} {request_target} HTTP/1.1\r\n\
Host: {host}:{port}\r\n\
Accept: application/json\r\n\
Accept-Encoding: identity\r\n\
Connection: close\r\n\
Content-Length: 0\r\n\
\r\n"
    );
    stream.write_all(request.as_bytes()).await.ok()?;

    read_http_response_bytes(&mut stream).await
}

async fn read_http_response_bytes<R>(reader: &mut R) -> Option<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                response.extend_from_slice(&chunk[..read]);
                if http_response::is_complete_http_response(&response) {
                    break;
                }
            }
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if response.is_empty() {
                    return None;
                }
                break;
            }
            Err(_) => return None,
        }
    }

    if response.is_empty() {
        None
    } else {
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::HealthServer;

    #[test]
    fn backend_base_url_uses_loopback_host_and_port() {
        assert_eq!(
            backend_base_url("127.0.0.1", 54321),
            "http://127.0.0.1:54321"
        );
    }

    #[test]
    fn host_and_port_defaults_to_http_port() {
        assert_eq!(
            host_and_port("http://localhost"),
            Some(("localhost".to_string(), 80))
        );
        assert_eq!(host_and_port("not a url"), None);
    }

    #[tokio::test]
    async fn read_http_response_bytes_stops_at_eof() {
        let mut reader: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\n";
        let raw = read_http_response_bytes(&mut reader)
            .await
            .expect("response bytes");
        assert_eq!(http_response::parse_http_status_code(&raw), Some(503));

        let mut empty: &[u8] = b"";
        assert!(read_http_response_bytes(&mut empty).await.is_none());
    }

    #[tokio::test]
    async fn request_status_code_reads_live_server_status() {
        let server = HealthServer::start(204).await;
        let status =
            request_status_code(&server.base_url(), "/api/v1/health", Duration::from_secs(1)).await;
        assert_eq!(status, Some(204));
        assert!(ping_backend(&server.base_url(), Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn request_status_code_is_none_when_nothing_listens() {
        let base_url = backend_base_url("127.0.0.1", crate::test_support::unused_port());
        let status =
            request_status_code(&base_url, "/api/v1/health", Duration::from_millis(300)).await;
        assert_eq!(status, None);
        assert!(!ping_backend(&base_url, Duration::from_millis(300)).await);
    }

    #[tokio::test]
    async fn request_status_code_times_out_on_silent_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let base_url = backend_base_url("127.0.0.1", port);
        let status =
            request_status_code(&base_url, "/api/v1/health", Duration::from_millis(200)).await;
        assert_eq!(status, None);
        drop(listener);
    }
}
