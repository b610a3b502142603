//! Window arithmetic and block identities for chained extend blocks.
//!
//! The execution engine handles one window of frames per pass. Longer
//! sequences are covered by appending extend blocks, each producing
//! `size - overlap` new frames after the first window.

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WINDOW_SIZE: u32 = 81;
pub const DEFAULT_OVERLAP: u32 = 5;

/// Base ids used by the hand-authored three-block graphs. Indices past the
/// table continue from the last entry in steps of [`BASE_ID_STRIDE`].
pub const HISTORICAL_BASE_IDS: [u32; 3] = [263, 297, 311];

/// Largest gap between consecutive table entries. Continuing from the last
/// entry with this stride can never revisit a table id.
pub const BASE_ID_STRIDE: u32 = max_gap(&HISTORICAL_BASE_IDS);

const fn max_gap(table: &[u32]) -> u32 {
    assert!(table.len() >= 2, "base id table needs at least two entries");
    let mut widest = 0;
    let mut i = 1;
    while i < table.len() {
        assert!(
            table[i] > table[i - 1],
            "base id table must be strictly increasing"
        );
        let gap = table[i] - table[i - 1];
        if gap > widest {
            widest = gap;
        }
        i += 1;
    }
    widest
}

/// Frames per window and frames shared between consecutive windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSpec {
    pub size: u32,
    pub overlap: u32,
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self {
            size: DEFAULT_WINDOW_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl WindowSpec {
    pub fn new(size: u32, overlap: u32) -> Result<Self> {
        let spec = Self { size, overlap };
        spec.check()?;
        Ok(spec)
    }

    pub fn check(&self) -> Result<()> {
        if self.size == 0 {
            bail!("window size must be positive");
        }
        if self.overlap >= self.size {
            bail!(
                "overlap ({}) must be smaller than the window size ({})",
                self.overlap,
                self.size
            );
        }
        Ok(())
    }

    /// New frames contributed by each extend block.
    pub fn step(&self) -> u32 {
        self.size - self.overlap
    }

    pub fn extend_count(&self, total_frames: u32) -> u32 {
        extend_count(total_frames, self.size, self.overlap)
    }
}

/// Number of extend blocks needed so that `window_size + n * (window_size -
/// overlap) >= total_frames`.
///
/// # Panics
///
/// Panics when `overlap >= window_size`.
pub fn extend_count(total_frames: u32, window_size: u32, overlap: u32) -> u32 {
    assert!(
        window_size > overlap,
        "overlap ({overlap}) must be smaller than the window size ({window_size})"
    );
    if total_frames <= window_size {
        return 0;
    }
    let remaining = total_frames - window_size;
    remaining.div_ceil(window_size - overlap)
}

/// Frames the final batch holds before trimming. Widened to `u64` since the
/// last block may overshoot `u32::MAX` for inputs near the limit.
pub fn planned_output_frames(total_frames: u32, window: WindowSpec) -> u64 {
    match window.extend_count(total_frames) {
        0 => u64::from(total_frames.min(window.size)),
        blocks => u64::from(window.size) + u64::from(blocks) * u64::from(window.step()),
    }
}

/// Base id of the extend block at zero-based `extend_index`.
pub fn block_base_id(extend_index: usize) -> u32 {
    if let Some(&id) = HISTORICAL_BASE_IDS.get(extend_index) {
        return id;
    }
    let last = HISTORICAL_BASE_IDS.len() - 1;
    let steps = u32::try_from(extend_index - last).unwrap_or(u32::MAX);
    HISTORICAL_BASE_IDS[last].saturating_add(steps.saturating_mul(BASE_ID_STRIDE))
}

/// The eight nodes every extend block consists of, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockRole {
    Probe,
    PrefixExtend,
    Encode,
    EmbedExtend,
    PoseEmbed,
    Sampler,
    Decode,
    SuffixMerge,
}

impl BlockRole {
    pub const ALL: [BlockRole; 8] = [
        BlockRole::Probe,
        BlockRole::PrefixExtend,
        BlockRole::Encode,
        BlockRole::EmbedExtend,
        BlockRole::PoseEmbed,
        BlockRole::Sampler,
        BlockRole::Decode,
        BlockRole::SuffixMerge,
    ];

    /// Local suffix of the node id, shared by every block.
    pub fn offset(self) -> u32 {
        match self {
            BlockRole::Probe => 260,
            BlockRole::PrefixExtend => 243,
            BlockRole::Encode => 258,
            BlockRole::EmbedExtend => 261,
            BlockRole::PoseEmbed => 251,
            BlockRole::Sampler => 248,
            BlockRole::Decode => 247,
            BlockRole::SuffixMerge => 249,
        }
    }

    pub fn operation(self) -> &'static str {
        match self {
            BlockRole::Probe => "GetImageSizeAndCount",
            BlockRole::PrefixExtend | BlockRole::SuffixMerge => "ImageBatchExtendWithOverlap",
            BlockRole::Encode => "WanVideoEncode",
            BlockRole::EmbedExtend => "WanVideoAddOneToAllExtendEmbeds",
            BlockRole::PoseEmbed => "WanVideoAddOneToAllPoseEmbeds",
            BlockRole::Sampler => "WanVideoSampler",
            BlockRole::Decode => "WanVideoDecode",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            BlockRole::Probe => "Get Image Size & Count",
            BlockRole::PrefixExtend | BlockRole::SuffixMerge => "Image Batch Extend With Overlap",
            BlockRole::Encode => "WanVideo Encode",
            BlockRole::EmbedExtend => "WanVideo Add OneToAll Extend Embeds",
            BlockRole::PoseEmbed => "WanVideo Add OneToAll Pose Embeds",
            BlockRole::Sampler => "WanVideo Sampler",
            BlockRole::Decode => "WanVideo Decode",
        }
    }
}

impl fmt::Display for BlockRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation())
    }
}

/// Compound id `"{base_id}:{offset}"` of a block node.
pub fn block_node_id(base_id: u32, role: BlockRole) -> String {
    format!("{base_id}:{}", role.offset())
}
