use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Frame count and (when the container reports one) frame rate of a media file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaProbe {
    pub frame_count: u32,
    pub frame_rate: Option<f64>,
}

/// Anything that can tell how many frames a media source holds.
pub trait FrameSource {
    fn probe(&self, path: &Path) -> Result<MediaProbe>;
}

/// Probes files with `ffprobe`, counting packets when the stream header
/// carries no frame count.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfprobeSource;

impl FrameSource for FfprobeSource {
    fn probe(&self, path: &Path) -> Result<MediaProbe> {
        if !path.exists() {
            bail!("media file does not exist: {}", path.display());
        }
        let output = run_ffprobe(path)?;
        media_probe_from_output(&output)
            .with_context(|| format!("failed to determine frame count of {}", path.display()))
    }
}

/// Reports a caller-supplied count, for when the media is not available
/// locally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedFrameSource {
    pub frame_count: u32,
    pub frame_rate: Option<f64>,
}

impl FrameSource for FixedFrameSource {
    fn probe(&self, _path: &Path) -> Result<MediaProbe> {
        Ok(MediaProbe {
            frame_count: self.frame_count,
            frame_rate: self.frame_rate,
        })
    }
}

#[derive(Deserialize, Debug)]
pub struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    nb_read_packets: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    debug!(path = %path.display(), "running ffprobe");
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-count_packets",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON output")
}

pub fn media_probe_from_output(output: &FfprobeOutput) -> Result<MediaProbe> {
    let stream = select_primary_video_stream(&output.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_frame_rate));
    if frame_rate.is_none() {
        warn!(
            stream = stream.index,
            "could not determine frame rate, keeping the workflow's configured rate"
        );
    }

    let frame_count = parse_count(stream.nb_frames.as_deref())
        .or_else(|| parse_count(stream.nb_read_packets.as_deref()))
        .or_else(|| {
            let duration: f64 = stream.duration.as_deref()?.parse().ok()?;
            let frames = (duration * frame_rate?).round();
            (frames > 0.0 && frames <= u32::MAX as f64).then_some(frames as u32)
        })
        .ok_or_else(|| anyhow!("video stream {} reports no frame count", stream.index))?;

    Ok(MediaProbe {
        frame_count,
        frame_rate,
    })
}

fn parse_count(raw: Option<&str>) -> Option<u32> {
    raw?.trim().parse::<u32>().ok().filter(|count| *count > 0)
}

/// Parses `num/den` or a plain number; `None` for non-positive rates.
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num / den
        }
        None => s.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

// Cover art is exposed as a one-frame video stream; prefer real video.
fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}
