//! Dual-stream mux pipeline
//!
//! Fetches a video-only and an audio-only stream and has ffmpeg combine them
//! into fragmented MP4 on the fly. Video is fed through ffmpeg's stdin, audio
//! through a one-shot loopback TCP listener, and ffmpeg's stdout becomes the
//! response body. Dropping the body cancels the whole pipeline.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use futures::TryStreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{ChildStderr, ChildStdin, Command};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::errors::{AppError, AppResult};
use crate::models::VideoId;
use crate::services::relay::{
    OutboundClient, X_ACCEL_BUFFERING, attachment_disposition, validate_location,
};
use crate::utils::body_stream::GuardedStream;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client headers that still make sense for whole-stream sub-requests
const MUX_FORWARDED_HEADERS: [header::HeaderName; 2] = [header::USER_AGENT, header::ACCEPT];

#[derive(Clone)]
pub struct MuxPipeline {
    client: OutboundClient,
    ffmpeg_command: String,
    audio_codec: String,
    buffer_size: usize,
    bridge_accept_timeout: Duration,
}

impl MuxPipeline {
    pub fn new(client: OutboundClient, config: &RelayConfig) -> Self {
        Self {
            client,
            ffmpeg_command: config.ffmpeg_command.clone(),
            audio_codec: config.audio_codec.clone(),
            buffer_size: config.buffer_size,
            bridge_accept_timeout: config.bridge_accept_timeout,
        }
    }

    /// Check that `ffmpeg_command` can be executed at all
    pub async fn check_available(ffmpeg_command: &str) -> bool {
        let mut cmd = Command::new(ffmpeg_command);
        cmd.arg("-version");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        match tokio::time::timeout(CHECK_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {
                debug!(command = ffmpeg_command, "ffmpeg availability check succeeded");
                true
            }
            Ok(Ok(status)) => {
                warn!(command = ffmpeg_command, code = status.code().unwrap_or(-1), "ffmpeg availability check exited with failure");
                false
            }
            Ok(Err(e)) => {
                warn!(command = ffmpeg_command, "ffmpeg not available: {}", e);
                false
            }
            Err(_) => {
                warn!(command = ffmpeg_command, "ffmpeg availability check timed out");
                false
            }
        }
    }

    /// ffmpeg arguments: video on stdin, audio from the loopback bridge,
    /// fragmented MP4 on stdout.
    pub fn build_args(&self, audio_port: u16) -> Vec<String> {
        let audio_input = format!("tcp://127.0.0.1:{audio_port}");
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-i",
            audio_input.as_str(),
            "-map",
            "0:v:0",
            "-map",
            "1:a:0",
            "-c:v",
            "copy",
            "-c:a",
            self.audio_codec.as_str(),
            "-f",
            "mp4",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "pipe:1",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }

    pub async fn relay_muxed(
        &self,
        video_location: &str,
        audio_location: &str,
        forwarded: &HeaderMap,
        video_id: &VideoId,
    ) -> AppResult<Response<Body>> {
        let video_url = validate_location(video_location)?;
        let audio_url = validate_location(audio_location)?;

        let mut headers = HeaderMap::new();
        for name in MUX_FORWARDED_HEADERS {
            if let Some(value) = forwarded.get(&name) {
                headers.insert(name, value.clone());
            }
        }

        let (video, audio) = tokio::try_join!(
            self.fetch("video", &video_url, &headers),
            self.fetch("audio", &audio_url, &headers),
        )?;

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| AppError::mux(format!("failed to open audio bridge: {e}")))?;
        let audio_port = listener
            .local_addr()
            .map_err(|e| AppError::mux(format!("failed to read audio bridge address: {e}")))?
            .port();

        let args = self.build_args(audio_port);
        debug!(video_id = %video_id, "Starting ffmpeg mux: {} {}", self.ffmpeg_command, args.join(" "));

        let mut cmd = Command::new(&self.ffmpeg_command);
        cmd.args(&args);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            error!(video_id = %video_id, "Failed to spawn ffmpeg: {}", e);
            AppError::mux(format!("failed to spawn {}: {e}", self.ffmpeg_command))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(AppError::mux("ffmpeg pipes were not captured"));
        };

        let cancel = CancellationToken::new();

        tokio::spawn(pump_video(video, stdin, cancel.clone(), video_id.clone()));
        tokio::spawn(bridge_audio(
            audio,
            listener,
            self.bridge_accept_timeout,
            cancel.clone(),
            video_id.clone(),
        ));
        tokio::spawn(log_stderr(stderr, video_id.clone()));

        {
            let cancel = cancel.clone();
            let video_id = video_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) if status.success() => debug!(video_id = %video_id, "ffmpeg finished"),
                        Ok(status) => warn!(video_id = %video_id, code = status.code().unwrap_or(-1), "ffmpeg exited with failure"),
                        Err(e) => error!(video_id = %video_id, "Failed waiting for ffmpeg: {}", e),
                    },
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            debug!(video_id = %video_id, "ffmpeg kill failed: {}", e);
                        } else {
                            debug!(video_id = %video_id, "ffmpeg stopped after client went away");
                        }
                    }
                }
                cancel.cancel();
            });
        }

        info!(video_id = %video_id, audio_port, "Mux pipeline established");

        let muxed_id = video_id.clone();
        let output = ReaderStream::with_capacity(stdout, self.buffer_size).inspect_err(move |e| {
            warn!(video_id = %muxed_id, "ffmpeg output interrupted mid-transfer: {}", e)
        });
        let body_stream = GuardedStream::new(output, cancel.drop_guard());

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::CONTENT_DISPOSITION, attachment_disposition(video_id)?)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(X_ACCEL_BUFFERING, HeaderValue::from_static("no"))
            .body(Body::from_stream(body_stream))
            .map_err(|e| AppError::internal(format!("failed to build response: {e}")))
    }

    async fn fetch(
        &self,
        stream: &str,
        url: &url::Url,
        headers: &HeaderMap,
    ) -> AppResult<reqwest::Response> {
        let response = self.client.get(url, headers).await?;
        let status = response.status();
        if !status.is_success() {
            warn!(stream, status = status.as_u16(), "Mux sub-request rejected upstream");
            return Err(AppError::UpstreamStatus {
                stream: stream.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

fn upstream_reader(upstream: reqwest::Response) -> StreamReader<impl futures::Stream<Item = io::Result<bytes::Bytes>>, bytes::Bytes> {
    StreamReader::new(upstream.bytes_stream().map_err(io::Error::other))
}

async fn pump_video(
    upstream: reqwest::Response,
    mut stdin: ChildStdin,
    cancel: CancellationToken,
    video_id: VideoId,
) {
    let reader = upstream_reader(upstream);
    tokio::pin!(reader);

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy(&mut reader, &mut stdin) => match result {
            Ok(bytes) => debug!(video_id = %video_id, bytes, "Video input finished"),
            Err(e) => warn!(video_id = %video_id, "Video input interrupted: {}", e),
        }
    }
    // Closing stdin is ffmpeg's end-of-input signal
    drop(stdin);
}

/// Serve the audio stream to the first connection on `listener`.
///
/// The listener is bound to loopback on an ephemeral port and closed after
/// one accept, so only a process on this host that connects before ffmpeg
/// could take the stream. Local users are trusted; the peer is logged.
async fn bridge_audio(
    upstream: reqwest::Response,
    listener: TcpListener,
    accept_timeout: Duration,
    cancel: CancellationToken,
    video_id: VideoId,
) {
    let accepted = tokio::select! {
        _ = cancel.cancelled() => return,
        accepted = tokio::time::timeout(accept_timeout, listener.accept()) => accepted,
    };
    drop(listener);

    let mut socket = match accepted {
        Ok(Ok((socket, peer))) => {
            debug!(video_id = %video_id, peer = %peer, "Audio bridge connected");
            socket
        }
        Ok(Err(e)) => {
            error!(video_id = %video_id, "Audio bridge accept failed: {}", e);
            cancel.cancel();
            return;
        }
        Err(_) => {
            error!(video_id = %video_id, timeout_ms = accept_timeout.as_millis() as u64, "ffmpeg never connected to the audio bridge");
            cancel.cancel();
            return;
        }
    };

    let reader = upstream_reader(upstream);
    tokio::pin!(reader);

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy(&mut reader, &mut socket) => match result {
            Ok(bytes) => debug!(video_id = %video_id, bytes, "Audio input finished"),
            Err(e) => warn!(video_id = %video_id, "Audio input interrupted: {}", e),
        }
    }
    let _ = socket.shutdown().await;
}

async fn log_stderr(stderr: ChildStderr, video_id: VideoId) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!(video_id = %video_id, "ffmpeg: {}", line.trim());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(ffmpeg_command: &str) -> MuxPipeline {
        let config = RelayConfig {
            ffmpeg_command: ffmpeg_command.to_string(),
            ..RelayConfig::default()
        };
        MuxPipeline::new(OutboundClient::new(&config).unwrap(), &config)
    }

    fn video_id() -> VideoId {
        VideoId::parse("dQw4w9WgXcQ").unwrap()
    }

    #[test]
    fn test_args_wire_inputs_and_fragmented_output() {
        let args = pipeline("ffmpeg").build_args(41234);
        let joined = args.join(" ");
        assert!(joined.contains("-i pipe:0 -i tcp://127.0.0.1:41234"));
        assert!(joined.contains("-c:v copy -c:a aac"));
        assert!(joined.contains("-f mp4 -movflags frag_keyframe+empty_moov+default_base_moof"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[tokio::test]
    async fn test_availability_check_reports_missing_binary() {
        assert!(!MuxPipeline::check_available("/nonexistent/ffmpeg-binary").await);
    }

    #[tokio::test]
    async fn test_failed_sub_request_aborts_before_spawn() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/audio"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        // A missing ffmpeg would surface as a Mux error if the spawn were reached
        let result = pipeline("/nonexistent/ffmpeg-binary")
            .relay_muxed(
                &format!("{}/video", server.uri()),
                &format!("{}/audio", server.uri()),
                &HeaderMap::new(),
                &video_id(),
            )
            .await;

        match result {
            Err(AppError::UpstreamStatus { stream, status }) => {
                assert_eq!(stream, "audio");
                assert_eq!(status, 404);
            }
            other => panic!("expected upstream status error, got {:?}", other.map(|r| r.status())),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_mux_error_and_range_not_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let mut forwarded = HeaderMap::new();
        forwarded.insert(header::RANGE, HeaderValue::from_static("bytes=0-10"));
        forwarded.insert(header::USER_AGENT, HeaderValue::from_static("vlc/3.0.20"));

        let result = pipeline("/nonexistent/ffmpeg-binary")
            .relay_muxed(
                &format!("{}/video", server.uri()),
                &format!("{}/audio", server.uri()),
                &forwarded,
                &video_id(),
            )
            .await;
        assert!(matches!(result, Err(AppError::Mux { .. })));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        for request in requests {
            assert!(request.headers.get("range").is_none());
            assert_eq!(request.headers.get("user-agent").unwrap(), "vlc/3.0.20");
        }
    }

    #[tokio::test]
    async fn test_invalid_locations_rejected() {
        let result = pipeline("ffmpeg")
            .relay_muxed(
                "https://media.example/video",
                "file:///etc/passwd",
                &HeaderMap::new(),
                &video_id(),
            )
            .await;
        assert!(matches!(result, Err(AppError::InvalidUpstreamLocation { .. })));
    }
}
