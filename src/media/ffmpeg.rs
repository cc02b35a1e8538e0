use crate::pipeline::collaborators::{Concatenator, SegmentExtractor, VideoProbe};
use crate::pipeline::job::VideoInfo;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

/// Video metadata via `ffprobe -print_format json`.
pub struct FfmpegProbe;

#[derive(Deserialize)]
struct ProbeOutput {
    streams: Vec<ProbeStream>,
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl VideoProbe for FfmpegProbe {
    fn analyze(&self, video: &Path) -> anyhow::Result<VideoInfo> {
        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(video)
            .output()
            .context("failed to launch ffprobe")?;
        if !output.status.success() {
            anyhow::bail!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let probe: ProbeOutput =
            serde_json::from_slice(&output.stdout).context("unparseable ffprobe output")?;
        video_info_from(probe)
    }
}

fn video_info_from(probe: ProbeOutput) -> anyhow::Result<VideoInfo> {
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .context("no video stream found")?;

    let duration: f64 = probe
        .format
        .duration
        .as_deref()
        .context("no duration in ffprobe output")?
        .parse()
        .context("bad duration in ffprobe output")?;

    Ok(VideoInfo {
        duration,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        fps: stream
            .r_frame_rate
            .as_deref()
            .map(parse_frame_rate)
            .unwrap_or(25.0),
        codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".into()),
    })
}

/// `"30000/1001"` style rational frame rates; falls back to 25 fps.
fn parse_frame_rate(rate: &str) -> f64 {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => rate.parse().unwrap_or(0.0),
    };
    if value > 0.0 {
        value
    } else {
        25.0
    }
}

/// Cuts segments into a per-instance temp directory, removed when the
/// extractor is dropped. NVENC is probed once at construction; a failed
/// hardware extraction falls back to the software encoder for that segment.
///
/// One extractor is shared by every job a scheduler runs, so segment paths
/// carry a per-call sequence number: concurrent jobs over identical time
/// ranges must never write to or clean up each other's files.
pub struct FfmpegExtractor {
    temp_dir: TempDir,
    hw_accel: bool,
    next_seq: AtomicU64,
}

impl FfmpegExtractor {
    pub fn new() -> anyhow::Result<Self> {
        let hw_accel = nvenc_available();
        if hw_accel {
            tracing::info!("ffmpeg h264_nvenc encoder available, using hardware extraction");
        }
        Ok(Self {
            temp_dir: TempDir::new().context("failed to create temp directory")?,
            hw_accel,
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn software_only() -> anyhow::Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new().context("failed to create temp directory")?,
            hw_accel: false,
            next_seq: AtomicU64::new(0),
        })
    }

    fn segment_path(&self, start: f64, end: f64) -> PathBuf {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.temp_dir.path().join(format!(
            "segment_{seq}_{}_{}.mp4",
            (start * 1000.0) as u64,
            (end * 1000.0) as u64
        ))
    }

    fn extract_hw(&self, video: &Path, start: f64, end: f64, out: &Path) -> anyhow::Result<()> {
        run_ffmpeg(Command::new("ffmpeg").args(["-y", "-hwaccel", "cuda"]).arg("-i").arg(video).args([
            "-ss",
            &start.to_string(),
            "-t",
            &(end - start).to_string(),
            "-c:v",
            "h264_nvenc",
            "-preset",
            "fast",
            "-c:a",
            "copy",
            "-avoid_negative_ts",
            "make_zero",
        ]).arg(out))
    }

    fn extract_sw(&self, video: &Path, start: f64, end: f64, out: &Path) -> anyhow::Result<()> {
        run_ffmpeg(Command::new("ffmpeg").arg("-y").arg("-i").arg(video).args([
            "-ss",
            &start.to_string(),
            "-t",
            &(end - start).to_string(),
            "-c:v",
            "libx264",
            "-preset",
            "fast",
            "-crf",
            "23",
            "-c:a",
            "copy",
            "-avoid_negative_ts",
            "make_zero",
        ]).arg(out))
    }
}

impl SegmentExtractor for FfmpegExtractor {
    fn extract(&self, video: &Path, start: f64, end: f64) -> anyhow::Result<PathBuf> {
        let out = self.segment_path(start, end);

        if self.hw_accel {
            match self.extract_hw(video, start, end, &out) {
                Ok(()) => return Ok(out),
                Err(e) => tracing::warn!("Hardware extraction failed, using software: {e:#}"),
            }
        }
        self.extract_sw(video, start, end, &out)?;
        Ok(out)
    }
}

/// Joins parts with the concat demuxer. The list file sits next to the output
/// and is removed afterwards.
pub struct FfmpegConcatenator;

impl Concatenator for FfmpegConcatenator {
    fn join(&self, parts: &[PathBuf], output: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(!parts.is_empty(), "no parts to concatenate");

        let list_path = output.with_extension("list");
        std::fs::write(&list_path, concat_list(parts))
            .with_context(|| format!("failed to write {}", list_path.display()))?;

        let result = run_ffmpeg(
            Command::new("ffmpeg")
                .args(["-y", "-f", "concat", "-safe", "0", "-i"])
                .arg(&list_path)
                .args(["-c:v", "libx264", "-preset", "fast", "-crf", "23", "-c:a", "copy"])
                .arg(output),
        );

        if let Err(e) = std::fs::remove_file(&list_path) {
            tracing::warn!("Failed to remove {}: {e}", list_path.display());
        }
        result
    }
}

/// Concat demuxer list body. Backslashes are normalized so the same list
/// works on Windows paths.
fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| format!("file '{}'\n", p.display().to_string().replace('\\', "/")))
        .collect()
}

fn nvenc_available() -> bool {
    Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains("h264_nvenc"))
        .unwrap_or(false)
}

fn run_ffmpeg(cmd: &mut Command) -> anyhow::Result<()> {
    let output = cmd.output().context("failed to launch ffmpeg")?;
    if !output.status.success() {
        anyhow::bail!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rate_parsing() {
        assert_eq!(parse_frame_rate("25/1"), 25.0);
        assert!((parse_frame_rate("30000/1001") - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), 25.0);
        assert_eq!(parse_frame_rate("garbage"), 25.0);
    }

    #[test]
    fn test_probe_output_deserializes() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "h264", "width": 1920,
                 "height": 1080, "r_frame_rate": "30/1"}
            ],
            "format": {"duration": "12.480000"}
        }"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let info = video_info_from(probe).unwrap();

        assert_eq!(info.codec, "h264");
        assert_eq!(info.width, 1920);
        assert_eq!(info.fps, 30.0);
        assert!((info.duration - 12.48).abs() < 1e-9);
    }

    #[test]
    fn test_probe_without_video_stream_errors() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "1.0"}}"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        assert!(video_info_from(probe).is_err());
    }

    #[test]
    fn test_concat_list_format() {
        let parts = vec![PathBuf::from("/tmp/a.mp4"), PathBuf::from("/tmp/b.mp4")];
        assert_eq!(concat_list(&parts), "file '/tmp/a.mp4'\nfile '/tmp/b.mp4'\n");
    }

    #[test]
    fn test_segment_paths_are_distinct_per_range() {
        let extractor = FfmpegExtractor::software_only().unwrap();
        let a = extractor.segment_path(1.5, 4.2);
        let b = extractor.segment_path(5.0, 8.75);
        assert_ne!(a, b);
        assert!(a
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("_1500_4200.mp4"));
    }

    #[test]
    fn test_segment_paths_unique_for_equal_ranges() {
        // Two jobs sharing one extractor can extract the same time range
        // concurrently; each call must get its own file.
        let extractor = FfmpegExtractor::software_only().unwrap();
        let a = extractor.segment_path(1.5, 4.2);
        let b = extractor.segment_path(1.5, 4.2);
        assert_ne!(a, b);
    }
}
