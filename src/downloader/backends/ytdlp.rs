use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::downloader::errors::{DownloadError, Stage};
use crate::downloader::models::{
    DownloadOutcome, FormatDescriptor, FormatSelection, MediaMetadata, MediaOptions, ProducedFile,
};
use crate::downloader::traits::MediaService;
use crate::downloader::utils::{find_executable, run_output_with_timeout, CommandError};

pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 900;

/// yt-dlp driven as a child process
pub struct YtDlpCli {
    ytdlp_bin: String,
    metadata_timeout_secs: u64,
    download_timeout_secs: u64,
}

impl YtDlpCli {
    pub fn new(ytdlp_bin: impl Into<String>) -> Self {
        Self {
            ytdlp_bin: ytdlp_bin.into(),
            metadata_timeout_secs: DEFAULT_METADATA_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }

    /// `binary` overrides discovery; otherwise common install paths and
    /// `which` are searched off the async threads, falling back to `yt-dlp`
    /// on PATH.
    pub async fn discover(binary: Option<String>) -> Self {
        let ytdlp_bin = match binary {
            Some(bin) => bin,
            None => tokio::task::spawn_blocking(|| find_executable("yt-dlp"))
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "yt-dlp".to_string()),
        };
        Self::new(ytdlp_bin)
    }

    pub fn with_timeouts(mut self, metadata_secs: u64, download_secs: u64) -> Self {
        self.metadata_timeout_secs = metadata_secs;
        self.download_timeout_secs = download_secs;
        self
    }

    pub fn binary(&self) -> &str {
        &self.ytdlp_bin
    }

    async fn run(
        &self,
        stage: Stage,
        args: &[String],
        timeout_secs: u64,
    ) -> Result<Vec<u8>, DownloadError> {
        let output = run_output_with_timeout(&self.ytdlp_bin, args, timeout_secs)
            .await
            .map_err(|e| command_error(stage, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DownloadError::from_stderr(stage, &stderr));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl MediaService for YtDlpCli {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        options: &MediaOptions,
    ) -> Result<MediaMetadata, DownloadError> {
        let args = metadata_args(url, options);
        let stdout = self.run(Stage::Metadata, &args, self.metadata_timeout_secs).await?;
        parse_metadata(&stdout)
    }

    async fn download(
        &self,
        url: &str,
        selection: &FormatSelection,
        options: &MediaOptions,
        output_template: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        let args = download_args(url, selection, options, output_template);
        let stdout = self.run(Stage::Download, &args, self.download_timeout_secs).await?;
        Ok(parse_outcome(&stdout))
    }
}

fn command_error(stage: Stage, err: CommandError) -> DownloadError {
    let detail = err.to_string();
    match stage {
        Stage::Metadata => DownloadError::Extraction(detail),
        Stage::Download => DownloadError::Download(detail),
    }
}

/// Translate the options bag into CLI flags shared by both calls.
pub fn option_args(options: &MediaOptions) -> Vec<String> {
    let mut args = Vec::new();

    for (name, value) in &options.http_headers {
        if name.eq_ignore_ascii_case("user-agent") {
            args.push("--user-agent".to_string());
            args.push(value.clone());
        } else {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }
    }

    if let Some(cookies) = &options.cookie_file {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }

    args.push("--socket-timeout".to_string());
    args.push(options.socket_timeout_secs.to_string());
    args.push("--retries".to_string());
    args.push(options.retries.to_string());
    args.push("--fragment-retries".to_string());
    args.push(options.fragment_retries.to_string());

    if let Some(target) = &options.impersonate {
        args.push("--impersonate".to_string());
        args.push(target.clone());
    }

    for runtime in &options.js_runtimes {
        args.push("--js-runtimes".to_string());
        args.push(runtime.clone());
    }

    for component in &options.remote_components {
        args.push("--remote-components".to_string());
        args.push(component.clone());
    }

    args.push("--concurrent-fragments".to_string());
    args.push(options.concurrent_fragments.max(1).to_string());

    if let Some(limit) = options.max_filesize {
        args.push("--max-filesize".to_string());
        args.push(limit.to_string());
    }

    if options.no_playlist {
        args.push("--no-playlist".to_string());
    }

    args
}

pub fn metadata_args(url: &str, options: &MediaOptions) -> Vec<String> {
    let mut args = vec![
        "--dump-json".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
    ];
    args.extend(option_args(options));
    args.push("--".to_string());
    args.push(url.to_string());
    args
}

pub fn download_args(
    url: &str,
    selection: &FormatSelection,
    options: &MediaOptions,
    output_template: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--no-simulate".to_string(),
        "--print".to_string(),
        "after_move:%()j".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
    ];
    args.extend(option_args(options));

    args.push("-f".to_string());
    args.push(selection.format_spec().to_string());
    if let Some(container) = selection.merge_container() {
        args.push("--merge-output-format".to_string());
        args.push(container.to_string());
    }

    args.push("-o".to_string());
    args.push(output_template.to_string_lossy().into_owned());
    args.push("--".to_string());
    args.push(url.to_string());
    args
}

fn non_none(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty() && *s != "none")
        .map(str::to_string)
}

fn as_bytes(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v > 0.0).map(|v| v.round() as u64))
        .filter(|v| *v > 0)
}

fn parse_format(f: &Value) -> Option<FormatDescriptor> {
    let id = match &f["format_id"] {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    Some(FormatDescriptor {
        id,
        container: f["ext"].as_str().unwrap_or_default().to_string(),
        video_codec: non_none(&f["vcodec"]),
        audio_codec: non_none(&f["acodec"]),
        height: f["height"].as_u64().map(|h| h as u32),
        fps: f["fps"].as_f64(),
        bitrate: f["tbr"].as_f64(),
        audio_bitrate: f["abr"].as_f64(),
        exact_size_bytes: as_bytes(&f["filesize"]),
        approx_size_bytes: as_bytes(&f["filesize_approx"]),
    })
}

/// Parse `--dump-json` output (one JSON document per line).
pub fn parse_metadata(stdout: &[u8]) -> Result<MediaMetadata, DownloadError> {
    let text = String::from_utf8_lossy(stdout);
    let json: Value = text
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str(l).ok())
        .ok_or_else(|| DownloadError::Extraction("no JSON in metadata output".to_string()))?;

    let duration = json["duration"]
        .as_f64()
        .filter(|d| *d >= 0.0)
        .map(|d| d as u64);

    let formats = json["formats"]
        .as_array()
        .map(|list| list.iter().filter_map(parse_format).collect())
        .unwrap_or_default();

    Ok(MediaMetadata { duration, formats })
}

/// Parse the `after_move` print. Missing or garbled output yields an empty
/// outcome and resolution falls back to scanning the folder.
pub fn parse_outcome(stdout: &[u8]) -> DownloadOutcome {
    let text = String::from_utf8_lossy(stdout);
    let json: Option<Value> = text
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str(l).ok());

    let Some(json) = json else {
        warn!("yt-dlp printed no file listing");
        return DownloadOutcome::default();
    };

    let final_path = json["filepath"].as_str().map(PathBuf::from);

    let requested = json["requested_downloads"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let path = item["filepath"].as_str()?;
                    let audio_only = item["vcodec"].as_str().map(|v| v == "none");
                    Some(ProducedFile {
                        path: PathBuf::from(path),
                        audio_only,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let outcome = DownloadOutcome { final_path, requested };
    debug!(?outcome, "yt-dlp reported files");
    outcome
}
