//! yt-dlp resolution backend
//!
//! Runs the external tool once per lookup. The child is killed when the
//! lookup future is dropped, which is how the resolver's deadline stops it.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{OutputMode, ResolverConfig};
use crate::errors::{ResolutionError, ResolutionResult};
use crate::services::classifier::ErrorClassifier;
use crate::services::formats::FormatCatalog;
use crate::services::resolver::{BackendOutput, LookupRequest, ResolutionBackend};

pub struct YtDlpBackend {
    command: String,
    watch_url: String,
    cookies_path: Option<PathBuf>,
    output_mode: OutputMode,
    classifier: ErrorClassifier,
}

impl YtDlpBackend {
    pub fn new(config: &ResolverConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            command: config.command.clone(),
            watch_url: config.watch_url.clone(),
            cookies_path: config.cookies_path.clone(),
            output_mode: config.output_mode,
            classifier: ErrorClassifier::with_rules(&config.classification_rules)?,
        })
    }

    /// Command line for one lookup, program name excluded
    pub fn build_args(&self, request: &LookupRequest) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.cookies_path {
            args.push("--cookies".to_string());
            args.push(path.display().to_string());
        }
        args.push("--no-playlist".to_string());
        args.push("--no-warnings".to_string());

        match self.output_mode {
            OutputMode::Urls => {
                args.push("-g".to_string());
                args.push("-f".to_string());
                args.push(request.criteria.format_selector());
            }
            OutputMode::Catalog => args.push("-J".to_string()),
        }

        args.push(format!("{}{}", self.watch_url, request.video_id));
        args
    }

    /// Turn a finished run into backend output or a classified error
    fn interpret(&self, success: bool, stdout: &[u8], stderr: &[u8]) -> ResolutionResult<BackendOutput> {
        if !success {
            let stderr = String::from_utf8_lossy(stderr);
            let message = match stderr.trim() {
                "" => String::from_utf8_lossy(stdout).trim().to_string(),
                text => text.to_string(),
            };
            if message.is_empty() {
                return Err(ResolutionError::external_failure(
                    "yt-dlp exited with an error and no output",
                ));
            }
            return Err(self.classifier.classify(&message));
        }

        let stdout = String::from_utf8_lossy(stdout);
        match self.output_mode {
            OutputMode::Urls => Ok(BackendOutput::Lines(stdout.into_owned())),
            OutputMode::Catalog => Ok(BackendOutput::Catalog(FormatCatalog::from_json(&stdout)?)),
        }
    }
}

#[async_trait]
impl ResolutionBackend for YtDlpBackend {
    async fn lookup(&self, request: &LookupRequest) -> ResolutionResult<BackendOutput> {
        let args = self.build_args(request);
        debug!(
            video_id = %request.video_id,
            command = %self.command,
            "Running resolution tool: {}",
            args.join(" ")
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            warn!(command = %self.command, "Failed to start resolution tool: {}", e);
            ResolutionError::external_failure(format!("failed to run {}: {e}", self.command))
        })?;

        if !output.status.success() {
            debug!(
                video_id = %request.video_id,
                code = output.status.code().unwrap_or(-1),
                "Resolution tool exited with failure"
            );
        }

        self.interpret(output.status.success(), &output.stdout, &output.stderr)
    }

    fn name(&self) -> &'static str {
        "yt-dlp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HdFallback;
    use crate::errors::RestrictionKind;
    use crate::models::VideoId;
    use crate::services::formats::Criteria;

    fn request(criteria: Criteria) -> LookupRequest {
        LookupRequest {
            video_id: VideoId::parse("dQw4w9WgXcQ").unwrap(),
            criteria,
        }
    }

    #[test]
    fn test_url_mode_args() {
        let backend = YtDlpBackend::new(&ResolverConfig::default()).unwrap();
        let args = backend.build_args(&request(Criteria::Progressive {
            max_height: Some(720),
        }));
        assert_eq!(
            args,
            vec![
                "--no-playlist",
                "--no-warnings",
                "-g",
                "-f",
                "best[ext=mp4][height<=720]/best[ext=mp4]",
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            ]
        );
    }

    #[test]
    fn test_cookies_and_catalog_mode_args() {
        let config = ResolverConfig {
            cookies_path: Some(PathBuf::from("/etc/ytdl/cookies.txt")),
            output_mode: OutputMode::Catalog,
            ..ResolverConfig::default()
        };
        let backend = YtDlpBackend::new(&config).unwrap();
        let args = backend.build_args(&request(Criteria::Muxed {
            max_height: 1080,
            fallback: HdFallback::Progressive,
        }));

        assert_eq!(&args[..2], ["--cookies", "/etc/ytdl/cookies.txt"]);
        assert!(args.contains(&"-J".to_string()));
        assert!(!args.contains(&"-g".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
    }

    #[test]
    fn test_failure_output_is_classified() {
        let backend = YtDlpBackend::new(&ResolverConfig::default()).unwrap();

        let err = backend
            .interpret(false, b"", b"ERROR: [youtube] dQw4w9WgXcQ: Video unavailable\n")
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound { .. }));

        let err = backend
            .interpret(false, b"", b"ERROR: Sign in to confirm your age")
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::Restricted {
                kind: RestrictionKind::CredentialsRequired,
                ..
            }
        ));

        let err = backend.interpret(false, b"", b"").unwrap_err();
        assert!(matches!(err, ResolutionError::ExternalFailure { .. }));
    }

    #[test]
    fn test_success_output_by_mode() {
        let backend = YtDlpBackend::new(&ResolverConfig::default()).unwrap();
        let output = backend
            .interpret(true, b"https://media.example/v\n", b"")
            .unwrap();
        assert!(matches!(output, BackendOutput::Lines(text) if text.starts_with("https://")));

        let catalog = YtDlpBackend::new(&ResolverConfig {
            output_mode: OutputMode::Catalog,
            ..ResolverConfig::default()
        })
        .unwrap();
        assert!(matches!(
            catalog.interpret(true, br#"{"formats": []}"#, b""),
            Ok(BackendOutput::Catalog(_))
        ));
        assert!(catalog.interpret(true, b"garbage", b"").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_external_failure() {
        let backend = YtDlpBackend::new(&ResolverConfig {
            command: "/nonexistent/yt-dlp-binary".to_string(),
            ..ResolverConfig::default()
        })
        .unwrap();
        let result = backend
            .lookup(&request(Criteria::Progressive { max_height: None }))
            .await;
        assert!(matches!(result, Err(ResolutionError::ExternalFailure { .. })));
    }
}
