//! Runtime configuration and static tuning tables.
//!
//! Environment-derived settings live in [`Config`]; everything that is a
//! fixed property of the service (job limits, codec/MIME tables, compression
//! presets, temp directory layout) is a constant here so the rest of the
//! code has a single place to look.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root of the temp tree. Every job writes only below this.
pub const TEMP_ROOT: &str = "/var/tmp/yoink";

pub const DISK_SPACE_MIN_GB: f64 = 5.0;
pub const FILE_SIZE_LIMIT: u64 = 8 * 1024 * 1024 * 1024;
pub const FILE_RETENTION: Duration = Duration::from_secs(20 * 60);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_PLAYLIST_VIDEOS: usize = 1000;
pub const MAX_VIDEO_DURATION_SECS: u64 = 4 * 60 * 60;
pub const MAX_JOBS_PER_CLIENT: usize = 5;
pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_SEGMENTS: usize = 20;
pub const MAX_UPLOAD_CHUNKS: usize = 200;
pub const BOT_DOWNLOAD_EXPIRY: Duration = Duration::from_secs(5 * 60);
pub const PLAYLIST_DOWNLOAD_EXP: Duration = Duration::from_secs(12 * 60 * 60);
pub const CHUNK_SIZE: u64 = 50 * 1024 * 1024;
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const ASYNC_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Job types the admission governor tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "download")]
    Download,
    #[serde(rename = "playlist")]
    Playlist,
    #[serde(rename = "convert")]
    Convert,
    #[serde(rename = "compress")]
    Compress,
    #[serde(rename = "transcribe")]
    Transcribe,
    #[serde(rename = "fetchUrl")]
    FetchUrl,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Download,
        JobType::Playlist,
        JobType::Convert,
        JobType::Compress,
        JobType::Transcribe,
        JobType::FetchUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Download => "download",
            JobType::Playlist => "playlist",
            JobType::Convert => "convert",
            JobType::Compress => "compress",
            JobType::Transcribe => "transcribe",
            JobType::FetchUrl => "fetchUrl",
        }
    }

    /// Maximum concurrent jobs of this type.
    pub fn limit(&self) -> usize {
        match self {
            JobType::Download => 6,
            JobType::Playlist => 2,
            JobType::Convert => 2,
            JobType::Compress => 1,
            JobType::Transcribe => 1,
            JobType::FetchUrl => 2,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subdirectories of the temp root, one per job family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempDir {
    Download,
    Convert,
    Compress,
    Playlist,
    Gallery,
    Upload,
    Bot,
    Transcribe,
}

impl TempDir {
    pub const ALL: [TempDir; 8] = [
        TempDir::Download,
        TempDir::Convert,
        TempDir::Compress,
        TempDir::Playlist,
        TempDir::Gallery,
        TempDir::Upload,
        TempDir::Bot,
        TempDir::Transcribe,
    ];

    pub fn path(&self) -> PathBuf {
        let sub = match self {
            TempDir::Download => "downloads",
            TempDir::Convert => "convert",
            TempDir::Compress => "compress",
            TempDir::Playlist => "playlists",
            TempDir::Gallery => "galleries",
            TempDir::Upload => "uploads",
            TempDir::Bot => "bot",
            TempDir::Transcribe => "transcribe",
        };
        PathBuf::from(TEMP_ROOT).join(sub)
    }
}

pub fn quality_height(quality: &str) -> Option<u32> {
    match quality {
        "2160p" => Some(2160),
        "1440p" => Some(1440),
        "1080p" => Some(1080),
        "720p" => Some(720),
        "480p" => Some(480),
        "360p" => Some(360),
        _ => None,
    }
}

pub fn container_mime(ext: &str) -> Option<&'static str> {
    match ext {
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mkv" => Some("video/x-matroska"),
        "mov" => Some("video/quicktime"),
        _ => None,
    }
}

pub fn audio_mime(ext: &str) -> Option<&'static str> {
    match ext {
        "mp3" => Some("audio/mpeg"),
        "m4a" => Some("audio/mp4"),
        "opus" => Some("audio/opus"),
        "wav" => Some("audio/wav"),
        "flac" => Some("audio/flac"),
        _ => None,
    }
}

/// MIME for a produced file, falling back to the sensible default per kind.
pub fn mime_for(ext: &str, is_audio: bool, is_gif: bool) -> &'static str {
    if is_gif {
        return "image/gif";
    }
    if is_audio {
        return audio_mime(ext).unwrap_or("audio/mpeg");
    }
    container_mime(ext).unwrap_or("video/mp4")
}

/// One compression preset: ffmpeg speed preset, CRF per quality tier,
/// default denoise policy and x264 tuning.
pub struct CompressionPreset {
    pub ffmpeg_preset: &'static str,
    pub crf_high: u32,
    pub crf_medium: u32,
    pub crf_low: u32,
    pub denoise: &'static str,
    pub x264_params: &'static str,
}

impl CompressionPreset {
    pub fn crf(&self, quality: &str) -> u32 {
        match quality {
            "high" => self.crf_high,
            "low" => self.crf_low,
            _ => self.crf_medium,
        }
    }
}

pub fn compression_preset(name: &str) -> &'static CompressionPreset {
    match name {
        "fast" => &CompressionPreset {
            ffmpeg_preset: "ultrafast",
            crf_high: 26,
            crf_medium: 28,
            crf_low: 30,
            denoise: "none",
            x264_params: "aq-mode=1",
        },
        "quality" => &CompressionPreset {
            ffmpeg_preset: "slow",
            crf_high: 20,
            crf_medium: 22,
            crf_low: 24,
            denoise: "auto",
            x264_params: "aq-mode=3:aq-strength=0.9:psy-rd=1.0,0.0",
        },
        _ => &CompressionPreset {
            ffmpeg_preset: "medium",
            crf_high: 22,
            crf_medium: 24,
            crf_low: 26,
            denoise: "auto",
            x264_params: "aq-mode=3:aq-strength=0.9:psy-rd=1.0,0.0",
        },
    }
}

pub fn denoise_filter(tier: &str) -> &'static str {
    match tier {
        "light" => "hqdn3d=2:1.5:3:2.25",
        "moderate" => "hqdn3d=4:3:6:4.5",
        "heavy" => "hqdn3d=6:4:9:6",
        _ => "",
    }
}

/// Minimum video bitrate (kbit/s) worth encoding at each output height.
pub fn bitrate_threshold(height: u32) -> u32 {
    match height {
        1080 => 2500,
        720 => 1500,
        480 => 800,
        360 => 400,
        _ => 0,
    }
}

pub const ALLOWED_FORMATS: [&str; 9] = [
    "mp4", "webm", "mkv", "mov", "mp3", "m4a", "opus", "wav", "flac",
];
pub const ALLOWED_MODES: [&str; 2] = ["size", "quality"];
pub const ALLOWED_QUALITIES: [&str; 3] = ["high", "medium", "low"];
pub const ALLOWED_PRESETS: [&str; 3] = ["fast", "balanced", "quality"];
pub const ALLOWED_DENOISE: [&str; 5] = ["auto", "none", "light", "moderate", "heavy"];
pub const ALLOWED_REENCODES: [&str; 3] = ["auto", "always", "never"];
pub const ALLOWED_CROP_RATIOS: [&str; 5] = ["16:9", "9:16", "1:1", "4:3", "4:5"];
pub const ALLOWED_AUDIO_BITRATES: [&str; 6] = ["64", "96", "128", "192", "256", "320"];

pub fn is_audio_format(format: &str) -> bool {
    matches!(format, "mp3" | "m4a" | "opus" | "wav" | "flac")
}

/// Tunnel API endpoints, tried in order.
pub const TUNNEL_ENDPOINTS: [&str; 3] = [
    "https://nuko-c.meowing.de",
    "https://subito-c.meowing.de",
    "https://cessi-c.meowing.de",
];

/// yt-dlp stderr signatures that indicate stale/missing cookies.
pub const BOT_DETECTION_ERRORS: [&str; 5] = [
    "Sign in to confirm you",
    "confirm your age",
    "Sign in to confirm your age",
    "This video is unavailable",
    "Private video",
];

/// Environment-derived settings, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub env_mode: String,
    pub bot_secret: Option<String>,
    pub tunnel_api_key: Option<String>,
    pub transcription_api_key: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: String,
    pub proxy_user_prefix: Option<String>,
    pub proxy_password: Option<String>,
    pub proxy_count: u32,
    pub discord_webhook_url: Option<String>,
    pub discord_ping_user_id: Option<String>,
    pub session_generator_url: String,
    pub session_token_refresh: Duration,
    pub whisper_script: String,
}

impl Config {
    /// Load configuration from the environment, applying defaults.
    pub fn from_env() -> Self {
        let refresh_min = env_or("SESSION_TOKEN_REFRESH_MIN", "15")
            .parse::<u64>()
            .ok()
            .filter(|m| *m >= 1)
            .unwrap_or(15);

        Self {
            port: env_or("PORT", "3001").parse().unwrap_or(3001),
            env_mode: env_or("NODE_ENV", "development"),
            bot_secret: non_empty(std::env::var("BOT_SECRET").ok()),
            tunnel_api_key: non_empty(std::env::var("COBALT_API_KEY").ok()),
            transcription_api_key: non_empty(std::env::var("OPENAI_API_KEY").ok()),
            proxy_host: non_empty(std::env::var("PROXY_HOST").ok()),
            proxy_port: env_or("PROXY_PORT", "80"),
            proxy_user_prefix: non_empty(std::env::var("PROXY_USER_PREFIX").ok()),
            proxy_password: non_empty(std::env::var("PROXY_PASSWORD").ok()),
            proxy_count: env_or("PROXY_COUNT", "0").parse().unwrap_or(0),
            discord_webhook_url: non_empty(std::env::var("DISCORD_WEBHOOK_URL").ok()),
            discord_ping_user_id: non_empty(std::env::var("DISCORD_PING_USER_ID").ok()),
            session_generator_url: env_or("SESSION_GENERATOR_URL", "http://localhost:8080"),
            session_token_refresh: Duration::from_secs(refresh_min * 60),
            whisper_script: env_or("WHISPER_SCRIPT", "whisper.py"),
        }
    }

    pub fn discord_alerts_enabled(&self) -> bool {
        self.discord_webhook_url.is_some()
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_limits_match_service_policy() {
        assert_eq!(JobType::Download.limit(), 6);
        assert_eq!(JobType::Compress.limit(), 1);
        assert_eq!(JobType::Transcribe.limit(), 1);
        assert_eq!(JobType::FetchUrl.limit(), 2);
    }

    #[test]
    fn job_type_serializes_to_wire_names() {
        assert_eq!(serde_json::to_string(&JobType::FetchUrl).unwrap(), "\"fetchUrl\"");
        assert_eq!(serde_json::to_string(&JobType::Download).unwrap(), "\"download\"");
    }

    #[test]
    fn temp_dirs_live_under_root() {
        for dir in TempDir::ALL {
            assert!(dir.path().starts_with(TEMP_ROOT));
        }
        assert_eq!(TempDir::Playlist.path(), PathBuf::from("/var/tmp/yoink/playlists"));
    }

    #[test]
    fn mime_tables() {
        assert_eq!(mime_for("mkv", false, false), "video/x-matroska");
        assert_eq!(mime_for("opus", true, false), "audio/opus");
        assert_eq!(mime_for("anything", false, true), "image/gif");
        assert_eq!(mime_for("xyz", true, false), "audio/mpeg");
    }

    #[test]
    fn preset_crf_table() {
        assert_eq!(compression_preset("fast").crf("high"), 26);
        assert_eq!(compression_preset("balanced").crf("medium"), 24);
        assert_eq!(compression_preset("quality").crf("low"), 24);
        // Unknown preset falls back to balanced.
        assert_eq!(compression_preset("nope").crf("medium"), 24);
    }

    #[test]
    fn audio_format_detection() {
        assert!(is_audio_format("flac"));
        assert!(!is_audio_format("mp4"));
    }
}
