//! ffmpeg argument assembly and the encode-planning math.
//!
//! Builders return plain `Vec<String>` argument lists; nothing here touches
//! a process. The planning helpers (resolution ladder, denoise tiers, target
//! bitrate) implement the compression policy tables from `config`.

use std::path::Path;

use crate::config;
use crate::media::probe::VideoProbe;

fn s(v: impl Into<String>) -> String {
    v.into()
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Container remux (stream copy), with faststart for mp4/mov output.
pub fn remux_args(input: &Path, output: &Path, container: &str) -> Vec<String> {
    let mut args = vec![s("-y"), s("-i"), path_arg(input), s("-codec"), s("copy")];
    if container == "mp4" || container == "mov" {
        args.push(s("-movflags"));
        args.push(s("+faststart"));
    }
    args.push(path_arg(output));
    args
}

/// Audio extraction/transcode into the requested audio format.
pub fn audio_extract_args(input: &Path, output: &Path, format: &str, bitrate: &str) -> Vec<String> {
    let mut args = vec![s("-y"), s("-i"), path_arg(input)];
    args.extend(audio_codec_args(format, bitrate));
    args.push(path_arg(output));
    args
}

/// High-quality palette GIF conversion.
pub fn gif_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        s("-y"),
        s("-i"),
        path_arg(input),
        s("-vf"),
        s("fps=15,scale=480:-1:flags=lanczos,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse"),
        s("-loop"),
        s("0"),
        path_arg(output),
    ]
}

/// Audio codec/bitrate arguments per target format.
pub fn audio_codec_args(format: &str, bitrate: &str) -> Vec<String> {
    let bitrate = if bitrate.is_empty() { "320" } else { bitrate };
    match format {
        "mp3" => vec![s("-codec:a"), s("libmp3lame"), s("-b:a"), format!("{bitrate}k")],
        "m4a" => vec![s("-codec:a"), s("aac"), s("-b:a"), format!("{bitrate}k")],
        "opus" => vec![s("-codec:a"), s("libopus"), s("-b:a"), s("128k")],
        "wav" => vec![s("-codec:a"), s("pcm_s16le")],
        "flac" => vec![s("-codec:a"), s("flac")],
        _ => vec![s("-codec:a"), s("aac"), s("-b:a"), s("128k")],
    }
}

/// Video re-encode arguments per target container at the given CRF.
pub fn video_codec_args(format: &str, crf: u32) -> Vec<String> {
    match format {
        "webm" => vec![
            s("-c:v"),
            s("libvpx-vp9"),
            s("-crf"),
            crf.to_string(),
            s("-b:v"),
            s("0"),
            s("-pix_fmt"),
            s("yuv420p"),
            s("-c:a"),
            s("libopus"),
            s("-b:a"),
            s("128k"),
        ],
        _ => vec![
            s("-c:v"),
            s("libx264"),
            s("-preset"),
            s("medium"),
            s("-crf"),
            crf.to_string(),
            s("-pix_fmt"),
            s("yuv420p"),
            s("-c:a"),
            s("aac"),
            s("-b:a"),
            s("128k"),
        ],
    }
}

/// Single-pass CRF compression encode.
pub fn crf_encode_args(
    input: &Path,
    output: &Path,
    crf: u32,
    ffmpeg_preset: &str,
    vf: &str,
    x264_params: &str,
) -> Vec<String> {
    let mut args = vec![s("-y"), s("-i"), path_arg(input), s("-threads"), s("0")];
    if !vf.is_empty() {
        args.push(s("-vf"));
        args.push(s(vf));
    }
    args.extend([
        s("-c:v"),
        s("libx264"),
        s("-preset"),
        s(ffmpeg_preset),
        s("-crf"),
        crf.to_string(),
        s("-pix_fmt"),
        s("yuv420p"),
        s("-profile:v"),
        s("high"),
        s("-level:v"),
        s("4.2"),
        s("-x264-params"),
        s(x264_params),
        s("-c:a"),
        s("aac"),
        s("-b:a"),
        s("128k"),
        s("-movflags"),
        s("+faststart"),
        path_arg(output),
    ]);
    args
}

/// One pass of a two-pass bitrate-targeted encode. Pass 1 is audio-disabled
/// and null-muxed; pass 2 writes the real output.
pub fn two_pass_args(
    pass: u8,
    input: &Path,
    output: &Path,
    pass_log: &Path,
    video_bitrate_k: u32,
    ffmpeg_preset: &str,
    vf: &str,
    x264_params: &str,
) -> Vec<String> {
    let maxrate_k = (video_bitrate_k as f64 * 1.5) as u32;
    let bufsize_k = video_bitrate_k * 2;

    let mut args = vec![s("-y"), s("-i"), path_arg(input), s("-threads"), s("0")];
    if !vf.is_empty() {
        args.push(s("-vf"));
        args.push(s(vf));
    }
    args.extend([
        s("-c:v"),
        s("libx264"),
        s("-preset"),
        s(ffmpeg_preset),
        s("-b:v"),
        format!("{video_bitrate_k}k"),
        s("-maxrate"),
        format!("{maxrate_k}k"),
        s("-bufsize"),
        format!("{bufsize_k}k"),
        s("-pix_fmt"),
        s("yuv420p"),
        s("-profile:v"),
        s("high"),
        s("-level:v"),
        s("4.2"),
        s("-x264-params"),
        s(x264_params),
        s("-pass"),
        pass.to_string(),
        s("-passlogfile"),
        path_arg(pass_log),
    ]);
    if pass == 1 {
        args.extend([s("-an"), s("-f"), s("null"), s("/dev/null")]);
    } else {
        args.extend([
            s("-c:a"),
            s("aac"),
            s("-b:a"),
            s("128k"),
            s("-movflags"),
            s("+faststart"),
            path_arg(output),
        ]);
    }
    args
}

/// Concat-demux join of pre-encoded clips with stream copy.
pub fn concat_args(list_file: &Path, output: &Path, container: &str) -> Vec<String> {
    let mut args = vec![
        s("-y"),
        s("-f"),
        s("concat"),
        s("-safe"),
        s("0"),
        s("-i"),
        path_arg(list_file),
        s("-c"),
        s("copy"),
    ];
    if container == "mp4" || container == "mov" {
        args.push(s("-movflags"));
        args.push(s("+faststart"));
    }
    args.push(path_arg(output));
    args
}

/// 16 kHz mono PCM WAV extraction for the transcription worker.
pub fn wav_extract_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        s("-y"),
        s("-i"),
        path_arg(input),
        s("-vn"),
        s("-acodec"),
        s("pcm_s16le"),
        s("-ar"),
        s("16000"),
        s("-ac"),
        s("1"),
        path_arg(output),
    ]
}

/// Burn an ASS subtitle file into the video.
pub fn caption_burn_args(input: &Path, subtitles: &Path, output: &Path) -> Vec<String> {
    // The ass filter parses its argument, so the path needs escaping.
    let escaped = path_arg(subtitles)
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'");
    vec![
        s("-y"),
        s("-i"),
        path_arg(input),
        s("-vf"),
        format!("ass={escaped}"),
        s("-c:v"),
        s("libx264"),
        s("-preset"),
        s("medium"),
        s("-crf"),
        s("23"),
        s("-pix_fmt"),
        s("yuv420p"),
        s("-c:a"),
        s("aac"),
        s("-b:a"),
        s("128k"),
        s("-movflags"),
        s("+faststart"),
        path_arg(output),
    ]
}

/// Seek-and-trim with stream copy (used after a full download).
pub fn copy_trim_args(input: &Path, output: &Path, start_secs: f64, duration_secs: f64) -> Vec<String> {
    vec![
        s("-ss"),
        format!("{start_secs}"),
        s("-i"),
        path_arg(input),
        s("-t"),
        format!("{duration_secs}"),
        s("-c"),
        s("copy"),
        s("-avoid_negative_ts"),
        s("make_zero"),
        s("-y"),
        path_arg(output),
    ]
}

/// Accurate-seek re-encoding trim directly from a remote stream URL.
pub fn stream_trim_args(stream_url: &str, output: &Path, start_secs: f64, duration_secs: f64) -> Vec<String> {
    vec![
        s("-accurate_seek"),
        s("-ss"),
        format!("{start_secs}"),
        s("-i"),
        s(stream_url),
        s("-t"),
        format!("{duration_secs}"),
        s("-c:v"),
        s("libx264"),
        s("-preset"),
        s("ultrafast"),
        s("-crf"),
        s("18"),
        s("-c:a"),
        s("aac"),
        s("-b:a"),
        s("192k"),
        s("-movflags"),
        s("+faststart"),
        s("-y"),
        path_arg(output),
    ]
}

/// Chosen output resolution for a bitrate-targeted encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub needs_scale: bool,
}

/// Walk the resolution ladder: prefer the largest rung not exceeding the
/// source that the available bitrate can sustain, falling back to whatever
/// the bitrate affords, then to 360p.
pub fn select_resolution(width: u32, height: u32, available_bitrate_k: u32) -> Resolution {
    const LADDER: [(u32, u32); 4] = [(1920, 1080), (1280, 720), (854, 480), (640, 360)];

    for (w, h) in LADDER {
        if width < w && height < h {
            continue;
        }
        if available_bitrate_k >= config::bitrate_threshold(h) {
            return Resolution { width: w, height: h, needs_scale: width > w };
        }
    }
    for (w, h) in LADDER {
        if available_bitrate_k >= config::bitrate_threshold(h) {
            return Resolution { width: w, height: h, needs_scale: width > w };
        }
    }
    Resolution { width: 640, height: 360, needs_scale: width > 640 }
}

/// Resolve the denoise filter string. `auto` compares the source bitrate to
/// the expected bitrate for its height: >2.5x expected is heavy, >1.5x
/// moderate, otherwise light. A preset of `none` disables denoise entirely.
pub fn resolve_denoise_filter(
    denoise: &str,
    source_height: u32,
    source_bitrate_mbps: f64,
    preset_denoise: &str,
) -> &'static str {
    if denoise == "none" || preset_denoise == "none" {
        return "";
    }
    if denoise != "auto" {
        return config::denoise_filter(denoise);
    }
    if preset_denoise != "auto" {
        return config::denoise_filter(preset_denoise);
    }

    const EXPECTED: [(u32, f64); 6] =
        [(360, 1.0), (480, 1.5), (720, 3.0), (1080, 6.0), (1440, 12.0), (2160, 25.0)];

    let (_, expected) = EXPECTED
        .iter()
        .min_by_key(|(h, _)| h.abs_diff(source_height))
        .copied()
        .unwrap_or((1080, 6.0));

    if source_bitrate_mbps > expected * 2.5 {
        config::denoise_filter("heavy")
    } else if source_bitrate_mbps > expected * 1.5 {
        config::denoise_filter("moderate")
    } else {
        config::denoise_filter("light")
    }
}

/// Downscale target width for oversized sources, 0 when no downscale.
pub fn downscale_resolution(source_width: u32, source_height: u32) -> u32 {
    if source_width > 1920 || source_height > 1080 {
        1920
    } else if source_width >= 1920 || source_height >= 1080 {
        1280
    } else if source_width >= 1280 || source_height >= 720 {
        854
    } else {
        0
    }
}

/// Combine scale + denoise into a `-vf` argument, empty when neither apply.
pub fn build_video_filters(denoise_filter: &str, scale_width: u32, source_width: u32) -> String {
    let mut filters = Vec::new();
    if scale_width > 0 && scale_width < source_width {
        filters.push(format!("scale={scale_width}:-2:flags=lanczos"));
    }
    if !denoise_filter.is_empty() {
        filters.push(denoise_filter.to_string());
    }
    filters.join(",")
}

/// Target video bitrate (kbit/s) for a size-targeted encode: 95% of the
/// byte budget minus projected audio, spread over the duration.
pub fn calculate_target_bitrate(target_mb: f64, duration_secs: f64, audio_bitrate_k: u32) -> u32 {
    let target_bytes = target_mb * 1024.0 * 1024.0 * 0.95;
    let audio_bytes = (audio_bitrate_k as f64 * 1000.0 / 8.0) * duration_secs;
    let video_bytes = target_bytes - audio_bytes;
    let kbits = (video_bytes * 8.0 / duration_secs / 1000.0).floor();
    if kbits < 0.0 { 0 } else { kbits as u32 }
}

/// Center-crop filter for an aspect-ratio string or a raw crop box.
/// Returns an empty string when the request cannot be satisfied (out of
/// bounds or degenerate), leaving the video uncropped.
pub fn build_crop_filter(probe: &VideoProbe, ratio: Option<&str>, raw: Option<(u32, u32, u32, u32)>) -> String {
    if let Some((x, y, w, h)) = raw {
        if w == 0 || h == 0 {
            return String::new();
        }
        if x + w > probe.width || y + h > probe.height {
            return String::new();
        }
        return format!("crop={w}:{h}:{x}:{y}");
    }

    let Some(ratio) = ratio else { return String::new() };
    let mut parts = ratio.split(':');
    let (Some(rw), Some(rh)) = (parts.next(), parts.next()) else {
        return String::new();
    };
    let (Ok(rw), Ok(rh)) = (rw.parse::<u32>(), rh.parse::<u32>()) else {
        return String::new();
    };
    if probe.width == 0 || probe.height == 0 || rw == 0 || rh == 0 {
        return String::new();
    }

    let (cw, ch);
    if (probe.width as f64) / (probe.height as f64) > (rw as f64) / (rh as f64) {
        ch = probe.height - (probe.height % 2);
        let w = ((ch as f64) * (rw as f64) / (rh as f64)).floor() as u32;
        cw = w - (w % 2);
    } else {
        cw = probe.width - (probe.width % 2);
        let h = ((cw as f64) * (rh as f64) / (rw as f64)).floor() as u32;
        ch = h - (h % 2);
    }
    let cx = (probe.width - cw) / 2;
    let cy = (probe.height - ch) / 2;
    format!("crop={cw}:{ch}:{cx}:{cy}")
}

/// Compatibility of a video codec with a target container for `reencode=auto`.
pub fn codec_compatible(container: &str, codec: &str) -> bool {
    match container {
        "mp4" => ["h264", "avc", "hevc", "h265"].iter().any(|c| codec.contains(c)),
        "webm" => ["vp8", "vp9", "av1"].iter().any(|c| codec.contains(c)),
        "mkv" => true,
        "mov" => ["h264", "hevc", "prores"].iter().any(|c| codec.contains(c)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(w: u32, h: u32) -> VideoProbe {
        VideoProbe { duration: 60.0, width: w, height: h, codec: "h264".into() }
    }

    #[test]
    fn resolution_ladder_prefers_bitrate_capable_rung() {
        // 1080p source with plenty of bitrate stays 1080p.
        let r = select_resolution(1920, 1080, 5000);
        assert_eq!((r.width, r.height, r.needs_scale), (1920, 1080, false));

        // Starved bitrate walks down to 480p.
        let r = select_resolution(1920, 1080, 900);
        assert_eq!((r.width, r.height), (854, 480));
        assert!(r.needs_scale);

        // Threshold boundaries are inclusive.
        assert_eq!(select_resolution(1920, 1080, 2500).height, 1080);
        assert_eq!(select_resolution(1920, 1080, 2499).height, 720);
    }

    #[test]
    fn resolution_floor_is_360p() {
        let r = select_resolution(640, 360, 100);
        assert_eq!((r.width, r.height), (640, 360));
    }

    #[test]
    fn small_source_skips_larger_rungs() {
        let r = select_resolution(1280, 720, 99999);
        assert_eq!((r.width, r.height), (1280, 720));
    }

    #[test]
    fn denoise_auto_tiers() {
        // 1080p expects ~6 Mbps: 16 > 15 (2.5x) -> heavy, 10 > 9 (1.5x) -> moderate.
        assert_eq!(resolve_denoise_filter("auto", 1080, 16.0, "auto"), config::denoise_filter("heavy"));
        assert_eq!(resolve_denoise_filter("auto", 1080, 10.0, "auto"), config::denoise_filter("moderate"));
        assert_eq!(resolve_denoise_filter("auto", 1080, 5.0, "auto"), config::denoise_filter("light"));
    }

    #[test]
    fn denoise_none_wins() {
        assert_eq!(resolve_denoise_filter("auto", 1080, 50.0, "none"), "");
        assert_eq!(resolve_denoise_filter("none", 1080, 50.0, "auto"), "");
        assert_eq!(resolve_denoise_filter("heavy", 1080, 1.0, "auto"), config::denoise_filter("heavy"));
    }

    #[test]
    fn target_bitrate_math() {
        // 10MB over 60s with 96k audio:
        // (10*1024*1024*0.95 - 96000/8*60) * 8 / 60 / 1000
        let k = calculate_target_bitrate(10.0, 60.0, 96);
        assert_eq!(k, 1232);
        // Absurdly small target floors at zero rather than wrapping.
        assert_eq!(calculate_target_bitrate(0.01, 600.0, 96), 0);
    }

    #[test]
    fn two_pass_arg_shape() {
        let args = two_pass_args(
            1,
            Path::new("/in.mp4"),
            Path::new("/out.mp4"),
            Path::new("/log"),
            1000,
            "medium",
            "",
            "aq-mode=1",
        );
        assert!(args.contains(&"-an".to_string()));
        assert!(args.contains(&"null".to_string()));
        assert!(args.contains(&"1500k".to_string())); // maxrate 1.5x
        assert!(args.contains(&"2000k".to_string())); // bufsize 2x
        assert!(!args.contains(&"/out.mp4".to_string()));

        let args = two_pass_args(
            2,
            Path::new("/in.mp4"),
            Path::new("/out.mp4"),
            Path::new("/log"),
            1000,
            "medium",
            "scale=1280:-2",
            "aq-mode=1",
        );
        assert!(args.contains(&"/out.mp4".to_string()));
        assert!(args.contains(&"+faststart".to_string()));
        assert!(args.contains(&"scale=1280:-2".to_string()));
    }

    #[test]
    fn crop_ratio_is_centered_and_even() {
        // 1920x1080 to 9:16 -> crop width 606 (floored even), full height.
        let f = build_crop_filter(&probe(1920, 1080), Some("9:16"), None);
        assert_eq!(f, "crop=606:1080:657:0");

        // 1:1 on landscape crops width to height.
        let f = build_crop_filter(&probe(1920, 1080), Some("1:1"), None);
        assert_eq!(f, "crop=1080:1080:420:0");
    }

    #[test]
    fn crop_raw_bounds_checked() {
        assert_eq!(build_crop_filter(&probe(1280, 720), None, Some((0, 0, 1280, 720))), "crop=1280:720:0:0");
        assert_eq!(build_crop_filter(&probe(1280, 720), None, Some((100, 0, 1280, 720))), "");
        assert_eq!(build_crop_filter(&probe(1280, 720), None, Some((0, 0, 0, 720))), "");
    }

    #[test]
    fn codec_compat_table() {
        assert!(codec_compatible("mp4", "h264"));
        assert!(codec_compatible("mp4", "hevc"));
        assert!(!codec_compatible("mp4", "vp9"));
        assert!(codec_compatible("webm", "av1"));
        assert!(!codec_compatible("webm", "h264"));
        assert!(codec_compatible("mkv", "anything"));
        assert!(codec_compatible("mov", "prores"));
        assert!(!codec_compatible("mov", "vp8"));
    }

    #[test]
    fn filter_chain_composition() {
        assert_eq!(build_video_filters("", 0, 1920), "");
        assert_eq!(build_video_filters("hqdn3d=2:1.5:3:2.25", 0, 1920), "hqdn3d=2:1.5:3:2.25");
        assert_eq!(
            build_video_filters("hqdn3d=2:1.5:3:2.25", 1280, 1920),
            "scale=1280:-2:flags=lanczos,hqdn3d=2:1.5:3:2.25"
        );
        // No upscale.
        assert_eq!(build_video_filters("", 1920, 1280), "");
    }

    #[test]
    fn caption_path_escaping() {
        let args = caption_burn_args(
            Path::new("/in.mp4"),
            Path::new("/tmp/it's:a.ass"),
            Path::new("/out.mp4"),
        );
        let vf = args.iter().position(|a| a == "-vf").map(|i| &args[i + 1]).unwrap();
        assert_eq!(vf, "ass=/tmp/it\\'s\\:a.ass");
    }
}
