//! Pure parsers for the progress chatter of external tools.
//!
//! ffmpeg reports `time=HH:MM:SS.ms ... speed=1.23x` on stderr; yt-dlp
//! reports percentage lines on stdout (via `--progress-template`) and
//! `[download] ...%` lines on stderr. Everything here is a pure function so
//! the consumer tasks stay trivial.

use std::sync::LazyLock;

use regex::Regex;

static FFMPEG_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d+):(\d+):(\d+\.?\d*)").expect("ffmpeg time regex"));
static FFMPEG_SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*([\d.]+)x").expect("ffmpeg speed regex"));
static YTDLP_PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)%").expect("percent regex"));
static YTDLP_SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"at\s+([\d.]+\s*\w+/s)").expect("speed regex"));
static YTDLP_ETA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"ETA\s+(\S+)").expect("eta regex"));
static YTDLP_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ERROR[:\s]+(.+?)(?:\n|$)").expect("error regex"));

/// Seconds of media already processed, from an ffmpeg stderr chunk.
pub fn parse_ffmpeg_time(chunk: &str) -> Option<f64> {
    let caps = FFMPEG_TIME_RE.captures(chunk)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Encoding speed multiplier from an ffmpeg stderr chunk.
pub fn parse_ffmpeg_speed(chunk: &str) -> Option<f64> {
    FFMPEG_SPEED_RE.captures(chunk)?[1].parse().ok()
}

/// Parsed fields of a yt-dlp progress line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct YtdlpProgress {
    pub percent: f64,
    pub speed: String,
    pub eta: String,
}

pub fn parse_ytdlp_progress(line: &str) -> YtdlpProgress {
    let mut p = YtdlpProgress::default();
    if let Some(caps) = YTDLP_PERCENT_RE.captures(line) {
        p.percent = caps[1].parse().unwrap_or(0.0);
    }
    if let Some(caps) = YTDLP_SPEED_RE.captures(line) {
        p.speed = caps[1].to_string();
    }
    if let Some(caps) = YTDLP_ETA_RE.captures(line) {
        p.eta = caps[1].to_string();
    }
    p
}

/// First `ERROR: ...` line from yt-dlp stderr, if any.
pub fn extract_ytdlp_error(stderr: &str) -> Option<String> {
    YTDLP_ERROR_RE
        .captures(stderr)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffmpeg_time() {
        let chunk = "frame= 300 fps= 29 q=28.0 size=1024kB time=00:01:30.55 bitrate=92.9kbits/s speed=1.2x";
        let t = parse_ffmpeg_time(chunk).unwrap();
        assert!((t - 90.55).abs() < 1e-9);
        assert_eq!(parse_ffmpeg_speed(chunk), Some(1.2));
    }

    #[test]
    fn parses_ffmpeg_time_hours() {
        assert_eq!(parse_ffmpeg_time("time=01:30:00.0"), Some(5400.0));
        assert_eq!(parse_ffmpeg_time("no progress here"), None);
    }

    #[test]
    fn parses_ytdlp_progress_line() {
        let line = "[download]  42.3% of 120.00MiB at  2.31 MiB/s ETA 00:31";
        let p = parse_ytdlp_progress(line);
        assert!((p.percent - 42.3).abs() < 1e-9);
        assert_eq!(p.speed, "2.31 MiB/s");
        assert_eq!(p.eta, "00:31");
    }

    #[test]
    fn parses_bare_percent_template() {
        let p = parse_ytdlp_progress(" 87.1%");
        assert!((p.percent - 87.1).abs() < 1e-9);
        assert!(p.speed.is_empty());
        assert!(p.eta.is_empty());
    }

    #[test]
    fn extracts_first_error_line() {
        let stderr = "WARNING: something\nERROR: Video unavailable\nERROR: second error\n";
        assert_eq!(extract_ytdlp_error(stderr), Some("Video unavailable".to_string()));
        assert_eq!(extract_ytdlp_error("all good"), None);
    }
}
