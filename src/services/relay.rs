//! Single-stream relay
//!
//! Key behaviors:
//!   - No total request timeout (media transfers can run for a long time).
//!   - Connect (TLS included) and response-header waits are bounded.
//!   - Only allow-listed client headers go upstream; a default User-Agent is
//!     added when the client did not send one.
//!   - Upstream status and the media headers are passed back verbatim.

use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response, header};
use futures::TryStreamExt;
use reqwest::Client;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::RelayConfig;
use crate::errors::{AppError, AppResult};
use crate::models::VideoId;

/// Upstream response headers copied back to the client
const PASSTHROUGH_RESPONSE_HEADERS: [HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::ACCEPT_RANGES,
    header::CONTENT_RANGE,
    header::ETAG,
    header::LAST_MODIFIED,
];

pub const X_ACCEL_BUFFERING: &str = "x-accel-buffering";

/// `reqwest::Client` plus default outgoing headers, applied only where the
/// request does not already carry them.
#[derive(Clone)]
pub struct OutboundClient {
    client: Client,
    default_headers: HeaderMap,
    response_header_timeout: Duration,
}

impl OutboundClient {
    pub fn new(config: &RelayConfig) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| AppError::internal(format!("failed to build HTTP client: {e}")))?;

        let mut default_headers = HeaderMap::new();
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| AppError::internal(format!("invalid relay.user_agent: {e}")))?;
        default_headers.insert(header::USER_AGENT, user_agent);

        Ok(Self {
            client,
            default_headers,
            response_header_timeout: config.response_header_timeout,
        })
    }

    /// GET `url` with `headers`, waiting at most the configured time for the
    /// response head. The body is left unread.
    pub async fn get(&self, url: &Url, headers: &HeaderMap) -> AppResult<reqwest::Response> {
        let mut request = self
            .client
            .get(url.clone())
            .headers(headers.clone())
            .build()
            .map_err(|e| AppError::upstream_connect(format!("invalid upstream request: {e}")))?;

        for (name, value) in &self.default_headers {
            request
                .headers_mut()
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }

        match tokio::time::timeout(self.response_header_timeout, self.client.execute(request)).await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(AppError::upstream_connect(format!(
                "request to {} failed: {e}",
                url.host_str().unwrap_or("upstream")
            ))),
            Err(_) => Err(AppError::upstream_connect(format!(
                "no response from {} within {:?}",
                url.host_str().unwrap_or("upstream"),
                self.response_header_timeout
            ))),
        }
    }
}

/// Accept only absolute http(s) URLs
pub fn validate_location(location: &str) -> AppResult<Url> {
    match Url::parse(location) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(url),
        _ => Err(AppError::InvalidUpstreamLocation {
            location: location.chars().take(128).collect(),
        }),
    }
}

/// `attachment; filename="<id>.mp4"`
pub fn attachment_disposition(video_id: &VideoId) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", video_id.file_name()))
        .map_err(|e| AppError::internal(format!("invalid content disposition: {e}")))
}

/// Adapt a reqwest body to a stream of chunks no larger than `buffer_size`
pub fn buffered_body(upstream: reqwest::Response, buffer_size: usize) -> ReaderStream<impl tokio::io::AsyncRead> {
    let reader = StreamReader::new(upstream.bytes_stream().map_err(io::Error::other));
    ReaderStream::with_capacity(reader, buffer_size)
}

#[derive(Clone)]
pub struct StreamRelay {
    client: OutboundClient,
    buffer_size: usize,
}

impl StreamRelay {
    pub fn new(client: OutboundClient, config: &RelayConfig) -> Self {
        Self {
            client,
            buffer_size: config.buffer_size,
        }
    }

    pub async fn relay(
        &self,
        location: &str,
        forwarded: &HeaderMap,
        video_id: &VideoId,
    ) -> AppResult<Response<Body>> {
        let url = validate_location(location)?;
        debug!(video_id = %video_id, host = url.host_str().unwrap_or(""), "Relaying upstream stream");

        let upstream = self.client.get(&url, forwarded).await.inspect_err(|e| {
            error!(video_id = %video_id, "Upstream connection failed: {}", e);
        })?;

        let status = upstream.status();
        if !status.is_success() {
            warn!(video_id = %video_id, status = status.as_u16(), "Upstream answered with error status, passing through");
        }

        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            for name in PASSTHROUGH_RESPONSE_HEADERS {
                if let Some(value) = upstream.headers().get(&name) {
                    headers.insert(name, value.clone());
                }
            }
            headers.insert(header::CONTENT_DISPOSITION, attachment_disposition(video_id)?);
            headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
        }

        info!(
            video_id = %video_id,
            status = status.as_u16(),
            content_length = upstream.content_length(),
            "Streaming relay established"
        );

        let relayed_id = video_id.clone();
        let body = Body::from_stream(buffered_body(upstream, self.buffer_size).inspect_err(
            move |e| warn!(video_id = %relayed_id, "Upstream body interrupted mid-transfer: {}", e),
        ));
        builder
            .body(body)
            .map_err(|e| AppError::internal(format!("failed to build response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay() -> StreamRelay {
        let config = RelayConfig::default();
        StreamRelay::new(OutboundClient::new(&config).unwrap(), &config)
    }

    fn video_id() -> VideoId {
        VideoId::parse("dQw4w9WgXcQ").unwrap()
    }

    async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_location_validation() {
        assert!(validate_location("https://media.example/videoplayback?x=1").is_ok());
        assert!(validate_location("http://127.0.0.1:9000/v").is_ok());
        for bad in ["file:///etc/passwd", "ftp://media.example/v", "not a url", "", "https://"] {
            assert!(
                matches!(validate_location(bad), Err(AppError::InvalidUpstreamLocation { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_full_body_relayed_with_media_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "video/mp4")
                    .insert_header("accept-ranges", "bytes")
                    .insert_header("etag", "\"abc\"")
                    .insert_header("set-cookie", "tracking=1")
                    .set_body_bytes(b"0123456789".to_vec()),
            )
            .mount(&server)
            .await;

        let response = relay()
            .relay(&format!("{}/media", server.uri()), &HeaderMap::new(), &video_id())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[header::CONTENT_LENGTH], "10");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::ETAG], "\"abc\"");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"dQw4w9WgXcQ.mp4\""
        );
        assert_eq!(headers[X_ACCEL_BUFFERING], "no");
        assert!(headers.get(header::SET_COOKIE).is_none());
        assert_eq!(body_bytes(response).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_range_forwarded_and_partial_content_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media"))
            .and(header_is("range", "bytes=100-199"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 100-199/1000")
                    .set_body_bytes(vec![7u8; 100]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut forwarded = HeaderMap::new();
        forwarded.insert(header::RANGE, HeaderValue::from_static("bytes=100-199"));

        let response = relay()
            .relay(&format!("{}/media", server.uri()), &forwarded, &video_id())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(body_bytes(response).await.len(), 100);
    }

    #[tokio::test]
    async fn test_default_user_agent_only_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let url = format!("{}/media", server.uri());

        relay().relay(&url, &HeaderMap::new(), &video_id()).await.unwrap();

        let mut forwarded = HeaderMap::new();
        forwarded.insert(header::USER_AGENT, HeaderValue::from_static("vlc/3.0.20"));
        relay().relay(&url, &forwarded, &video_id()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].headers.get("user-agent").unwrap(),
            RelayConfig::default().user_agent.as_str()
        );
        assert_eq!(requests[1].headers.get("user-agent").unwrap(), "vlc/3.0.20");
    }

    #[tokio::test]
    async fn test_upstream_error_status_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("expired signature"))
            .mount(&server)
            .await;

        let response = relay()
            .relay(&format!("{}/media", server.uri()), &HeaderMap::new(), &video_id())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_invalid_scheme_rejected_before_any_request() {
        let server = MockServer::start().await;
        let result = relay()
            .relay("file:///etc/passwd", &HeaderMap::new(), &video_id())
            .await;
        assert!(matches!(result, Err(AppError::InvalidUpstreamLocation { .. })));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_upstream_surfaces_as_body_error() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: video/mp4\r\ncontent-length: 100000\r\n\r\n0123456789")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let response = relay()
            .relay(&format!("http://{addr}/media"), &HeaderMap::new(), &video_id())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "100000");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await;
        assert!(body.is_err());
    }

    #[tokio::test]
    async fn test_silent_upstream_hits_response_header_timeout() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _holder = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Accept, then never answer
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(socket);
        });

        let config = RelayConfig {
            response_header_timeout: Duration::from_millis(300),
            ..RelayConfig::default()
        };
        let relay = StreamRelay::new(OutboundClient::new(&config).unwrap(), &config);

        let started = std::time::Instant::now();
        let result = relay
            .relay(&format!("http://{addr}/media"), &HeaderMap::new(), &video_id())
            .await;
        match result {
            Err(AppError::UpstreamConnect { message }) => {
                assert!(message.contains("no response"), "{message}");
            }
            other => panic!("expected connect failure, got {:?}", other.map(|r| r.status())),
        }
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300), "{waited:?}");
        assert!(waited < Duration::from_secs(10), "{waited:?}");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_failure() {
        let result = relay()
            .relay("http://127.0.0.1:1/media", &HeaderMap::new(), &video_id())
            .await;
        assert!(matches!(result, Err(AppError::UpstreamConnect { .. })));
    }
}
