//! ffprobe wrappers.
//!
//! All probes are tolerant: a broken or unreadable file yields conservative
//! defaults rather than an error, matching how the pipelines use them (the
//! actual encode will fail with a better message if the file is junk).

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

/// Width/height/duration/codec of the primary video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
}

impl Default for VideoProbe {
    fn default() -> Self {
        Self { duration: 60.0, width: 1920, height: 1080, codec: "unknown".to_string() }
    }
}

#[derive(Deserialize)]
struct ProbeJson {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Deserialize, Default)]
struct ProbeStream {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    codec_type: String,
}

#[derive(Deserialize, Default)]
struct ProbeFormat {
    #[serde(default)]
    duration: String,
}

async fn probe_json(args: &[&str]) -> Option<ProbeJson> {
    let output = Command::new("ffprobe").args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

/// Full probe of the primary video stream, with safe defaults on failure.
pub async fn probe_video(path: &Path) -> VideoProbe {
    let path_str = path.to_string_lossy();
    let parsed = probe_json(&[
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height,codec_name:format=duration",
        "-of",
        "json",
        &path_str,
    ])
    .await;

    let Some(parsed) = parsed else { return VideoProbe::default() };

    let mut probe = VideoProbe::default();
    if let Ok(dur) = parsed.format.duration.parse::<f64>() {
        if dur > 0.0 {
            probe.duration = dur;
        }
    }
    if let Some(stream) = parsed.streams.first() {
        if stream.width > 0 {
            probe.width = stream.width;
        }
        if stream.height > 0 {
            probe.height = stream.height;
        }
        if !stream.codec_name.is_empty() {
            probe.codec = stream.codec_name.to_ascii_lowercase();
        }
    }
    probe
}

/// Duration in seconds, 0.0 when unknown.
pub async fn probe_duration(path: &Path) -> f64 {
    let path_str = path.to_string_lossy();
    probe_json(&["-v", "error", "-show_entries", "format=duration", "-of", "json", &path_str])
        .await
        .and_then(|p| p.format.duration.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Duration/width/height without defaults (0 on failure), for metadata
/// responses where guessing would mislead the client.
pub async fn probe_video_info(path: &Path) -> (f64, u32, u32) {
    let path_str = path.to_string_lossy();
    let parsed = probe_json(&[
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height:format=duration",
        "-of",
        "json",
        &path_str,
    ])
    .await;
    let Some(parsed) = parsed else { return (0.0, 0, 0) };
    let dur = parsed.format.duration.parse::<f64>().unwrap_or(0.0);
    let (w, h) = parsed
        .streams
        .first()
        .map(|s| (s.width, s.height))
        .unwrap_or((0, 0));
    (dur, w, h)
}

/// Whether the file has a stream matching the selector (`v:0` / `a:0`).
pub async fn has_stream(path: &Path, selector: &str, codec_type: &str) -> bool {
    let path_str = path.to_string_lossy();
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            selector,
            "-show_entries",
            "stream=codec_type",
            "-of",
            "csv=p=0",
            &path_str,
        ])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => {
            String::from_utf8_lossy(&out.stdout).contains(codec_type)
        }
        _ => false,
    }
}

/// Whether the file contains at least one video stream.
pub async fn is_valid_video(path: &Path) -> bool {
    has_stream(path, "v", "video").await
}

/// Twitter GIF heuristic: soundless and under a minute.
pub async fn probe_for_gif(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    let parsed = probe_json(&[
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
        &path_str,
    ])
    .await;
    let Some(parsed) = parsed else { return false };

    let has_audio = parsed.streams.iter().any(|s| s.codec_type == "audio");
    let duration = parsed.format.duration.parse::<f64>().unwrap_or(999.0);
    !has_audio && duration < 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let probe = probe_video(Path::new("/nonexistent/file.mp4")).await;
        assert_eq!(probe, VideoProbe::default());
        assert_eq!(probe_duration(Path::new("/nonexistent/file.mp4")).await, 0.0);
        assert_eq!(probe_video_info(Path::new("/nonexistent/file.mp4")).await, (0.0, 0, 0));
        assert!(!is_valid_video(Path::new("/nonexistent/file.mp4")).await);
        assert!(!probe_for_gif(Path::new("/nonexistent/file.mp4")).await);
    }

    #[test]
    fn probe_json_shape_parses() {
        let raw = r#"{"streams":[{"width":1280,"height":720,"codec_name":"h264","codec_type":"video"}],"format":{"duration":"12.5"}}"#;
        let parsed: ProbeJson = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.streams[0].width, 1280);
        assert_eq!(parsed.format.duration, "12.5");
    }
}
