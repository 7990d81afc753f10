//! Mux pipeline tests against a scripted stand-in for ffmpeg
//!
//! The stand-in connects to the audio bridge like ffmpeg would, reads both
//! inputs and writes them back out, so the bridge, the stdin pump, the
//! supervisor and the cancellation path all run for real.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use axum_test::TestServer;
use futures::StreamExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ytdl_relay::{
    config::{Config, RelayConfig},
    errors::ResolutionResult,
    models::VideoId,
    services::{BackendOutput, LookupRequest, MuxPipeline, OutboundClient, ResolutionBackend},
    web::{AppState, create_router},
};

const VIDEO_ID: &str = "dQw4w9WgXcQ";

struct StandIns {
    dir: PathBuf,
    /// Echoes `video=<stdin>;audio=<bridge>` and exits
    echo: PathBuf,
    /// Writes its pid, emits a little output, then never finishes
    stall: PathBuf,
}

impl StandIns {
    fn stall_pid_file(&self) -> PathBuf {
        self.dir.join("stall.pid")
    }
}

/// Scripts are written once, before any test spawns a process, so no file
/// is still open for writing when it is executed.
static STAND_INS: LazyLock<StandIns> = LazyLock::new(|| {
    let dir = std::env::temp_dir().join(format!("ytdl-relay-mux-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let echo = dir.join("echo-ffmpeg");
    write_script(
        &echo,
        r#"#!/usr/bin/env bash
for arg in "$@"; do
  case "$arg" in
    tcp://*) addr="${arg#tcp://}" ;;
  esac
done
exec 3<>"/dev/tcp/${addr%%:*}/${addr##*:}"
audio="$(cat <&3)"
video="$(cat)"
printf 'video=%s;audio=%s' "$video" "$audio"
"#,
    );

    let stall = dir.join("stall-ffmpeg");
    let pid_file = dir.join("stall.pid");
    write_script(
        &stall,
        &format!(
            "#!/usr/bin/env bash\necho $$ > '{}'\nprintf 'fragment'\nexec sleep 600\n",
            pid_file.display()
        ),
    );

    StandIns { dir, echo, stall }
});

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct SplitStreamsBackend {
    calls: AtomicUsize,
    video: String,
    audio: String,
}

#[async_trait]
impl ResolutionBackend for SplitStreamsBackend {
    async fn lookup(&self, _request: &LookupRequest) -> ResolutionResult<BackendOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BackendOutput::Lines(format!("{}\n{}\n", self.video, self.audio)))
    }

    fn name(&self) -> &'static str {
        "split"
    }
}

async fn split_media_host() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/video"))
        .respond_with(ResponseTemplate::new(200).set_body_string("VIDEOTRACK"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/audio"))
        .respond_with(ResponseTemplate::new(200).set_body_string("AUDIOTRACK"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_hd_request_is_muxed_through_ffmpeg() {
    let stand_ins = &*STAND_INS;
    let host = split_media_host().await;
    let backend = Arc::new(SplitStreamsBackend {
        calls: AtomicUsize::new(0),
        video: format!("{}/video", host.uri()),
        audio: format!("{}/audio", host.uri()),
    });

    let mut config = Config::default();
    config.relay.ffmpeg_command = stand_ins.echo.display().to_string();
    config.relay.bridge_accept_timeout = Duration::from_secs(10);
    let state = AppState::new(config, backend.clone(), true).unwrap();
    let server = TestServer::new(create_router(state.clone())).unwrap();

    let response = server
        .get("/api/stream")
        .add_query_param("v", VIDEO_ID)
        .add_query_param("q", "1080")
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.header("content-type"), "video/mp4");
    assert_eq!(
        response.header("content-disposition"),
        "attachment; filename=\"dQw4w9WgXcQ.mp4\""
    );
    assert_eq!(response.header("x-accel-buffering"), "no");
    assert_eq!(response.text(), "video=VIDEOTRACK;audio=AUDIOTRACK");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.admission.active(), 0);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dropping_body_kills_ffmpeg() {
    let stand_ins = &*STAND_INS;
    let host = split_media_host().await;

    let config = RelayConfig {
        ffmpeg_command: stand_ins.stall.display().to_string(),
        ..RelayConfig::default()
    };
    let pipeline = MuxPipeline::new(OutboundClient::new(&config).unwrap(), &config);
    let video_id = VideoId::parse(VIDEO_ID).unwrap();

    let response = pipeline
        .relay_muxed(
            &format!("{}/video", host.uri()),
            &format!("{}/audio", host.uri()),
            &HeaderMap::new(),
            &video_id,
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(10), body.next())
        .await
        .expect("ffmpeg output in time")
        .expect("a first chunk")
        .unwrap();
    assert_eq!(first.as_ref(), b"fragment");

    let pid: u32 = std::fs::read_to_string(stand_ins.stall_pid_file())
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let proc_entry = PathBuf::from(format!("/proc/{pid}"));
    assert!(proc_entry.exists());

    drop(body);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while proc_entry.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "ffmpeg process {pid} still running after the body was dropped"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
