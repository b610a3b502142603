use serde::{Deserialize, Serialize};

use crate::extend::{block_node_id, BlockRole, WindowSpec};
use crate::graph::{WorkflowDocument, WorkflowNode};
use crate::types::{EdgeRef, InputValue};

/// Slot on which the suffix merge node exposes the cumulative batch.
pub const MERGE_OUTPUT_SLOT: u32 = 2;
/// Slot of the base graph output that feeds the first block.
pub const BASE_OUTPUT_SLOT: u32 = 0;

const TILE_SIZE: u32 = 272;
const TILE_STRIDE_X: u32 = 144;
const TILE_STRIDE_Y: u32 = 128;
const SAMPLER_STEPS: u32 = 6;
const SAMPLER_SHIFT: u32 = 7;
const SCHEDULER_SLOT: u32 = 3;
const FRAMES_PROCESSED_SLOT: u32 = 3;
const POSE_PREFIX_SLOT: u32 = 1;

/// Ids of the base-graph nodes every block reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedRefs {
    pub overlap: String,
    pub scheduler: String,
    pub cfg: String,
    pub vae: String,
    pub model: String,
    pub text_embeds: String,
    pub pose_images: String,
    pub pose_prefix: String,
    pub ref_embeds: String,
}

impl Default for SharedRefs {
    fn default() -> Self {
        Self {
            overlap: "169".to_string(),
            scheduler: "231".to_string(),
            cfg: "238".to_string(),
            vae: "38".to_string(),
            model: "80".to_string(),
            text_embeds: "16".to_string(),
            pose_images: "141".to_string(),
            pose_prefix: "141".to_string(),
            ref_embeds: "105".to_string(),
        }
    }
}

impl SharedRefs {
    pub fn node_ids(&self) -> [&str; 9] {
        [
            self.overlap.as_str(),
            self.scheduler.as_str(),
            self.cfg.as_str(),
            self.vae.as_str(),
            self.model.as_str(),
            self.text_embeds.as_str(),
            self.pose_images.as_str(),
            self.pose_prefix.as_str(),
            self.ref_embeds.as_str(),
        ]
    }
}

/// Where a block takes its input frames from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predecessor {
    /// The base graph's designated output node.
    Base(String),
    /// The suffix merge node of the block with this base id.
    Block(u32),
}

impl Predecessor {
    pub fn output(&self) -> EdgeRef {
        match self {
            Predecessor::Base(id) => EdgeRef::new(id.clone(), BASE_OUTPUT_SLOT),
            Predecessor::Block(base_id) => EdgeRef::new(
                block_node_id(*base_id, BlockRole::SuffixMerge),
                MERGE_OUTPUT_SLOT,
            ),
        }
    }
}

/// Stamps the eight nodes of one extend block under `base_id`.
///
/// The only edges leaving the block go to `predecessor` and to `shared`.
/// When `is_first_block` is set, the two overlap-blending nodes carry the
/// window overlap as a literal instead of linking to the shared overlap node.
pub fn stamp_block(
    base_id: u32,
    predecessor: &Predecessor,
    shared: &SharedRefs,
    window: WindowSpec,
    is_first_block: bool,
) -> WorkflowDocument {
    let local = |role: BlockRole, slot: u32| InputValue::link(block_node_id(base_id, role), slot);
    let shared_link = |id: &str, slot: u32| InputValue::link(id, slot);
    let blend_overlap = if is_first_block {
        InputValue::literal(window.overlap)
    } else {
        shared_link(&shared.overlap, 0)
    };

    let node = |role: BlockRole| WorkflowNode::new(role.operation(), role.title());

    let nodes = [
        (
            BlockRole::Probe,
            node(BlockRole::Probe).with_input("image", predecessor.output()),
        ),
        (
            BlockRole::PrefixExtend,
            with_blend_mode(node(BlockRole::PrefixExtend))
                .with_input("overlap", blend_overlap.clone())
                .with_input("source_images", local(BlockRole::Probe, 0)),
        ),
        (
            BlockRole::Encode,
            with_tiling(node(BlockRole::Encode))
                .with_literal("noise_aug_strength", 0)
                .with_literal("latent_strength", 1)
                .with_input("vae", shared_link(&shared.vae, 0))
                .with_input("image", local(BlockRole::PrefixExtend, 1)),
        ),
        (
            BlockRole::EmbedExtend,
            node(BlockRole::EmbedExtend)
                .with_literal("window_size", window.size)
                .with_input("overlap", shared_link(&shared.overlap, 0))
                .with_input(
                    "frames_processed",
                    local(BlockRole::Probe, FRAMES_PROCESSED_SLOT),
                )
                .with_literal("if_not_enough_frames", "pad_with_last")
                .with_input("embeds", shared_link(&shared.ref_embeds, 0))
                .with_input("prev_latents", local(BlockRole::Encode, 0))
                .with_input("pose_images", shared_link(&shared.pose_images, 0)),
        ),
        (
            BlockRole::PoseEmbed,
            node(BlockRole::PoseEmbed)
                .with_literal("strength", 1)
                .with_literal("start_percent", 0)
                .with_literal("end_percent", 1)
                .with_input("embeds", local(BlockRole::EmbedExtend, 0))
                .with_input("pose_images", local(BlockRole::EmbedExtend, 1))
                .with_input(
                    "pose_prefix_image",
                    shared_link(&shared.pose_prefix, POSE_PREFIX_SLOT),
                ),
        ),
        (
            BlockRole::Sampler,
            node(BlockRole::Sampler)
                .with_literal("steps", SAMPLER_STEPS)
                .with_input("cfg", shared_link(&shared.cfg, 0))
                .with_literal("shift", SAMPLER_SHIFT)
                .with_literal("seed", 0)
                .with_literal("force_offload", true)
                .with_input("scheduler", shared_link(&shared.scheduler, SCHEDULER_SLOT))
                .with_literal("riflex_freq_index", 0)
                .with_literal("denoise_strength", 1)
                .with_literal("batched_cfg", false)
                .with_literal("rope_function", "comfy")
                .with_literal("start_step", 0)
                .with_literal("end_step", -1)
                .with_literal("add_noise_to_samples", "")
                .with_input("model", shared_link(&shared.model, 0))
                .with_input("image_embeds", local(BlockRole::PoseEmbed, 0))
                .with_input("text_embeds", shared_link(&shared.text_embeds, 0)),
        ),
        (
            BlockRole::Decode,
            with_tiling(node(BlockRole::Decode))
                .with_literal("normalization", "default")
                .with_input("vae", shared_link(&shared.vae, 0))
                .with_input("samples", local(BlockRole::Sampler, 0)),
        ),
        (
            BlockRole::SuffixMerge,
            with_blend_mode(node(BlockRole::SuffixMerge))
                .with_input("overlap", blend_overlap)
                .with_input("source_images", local(BlockRole::PrefixExtend, 0))
                .with_input("new_images", local(BlockRole::Decode, 0)),
        ),
    ];

    nodes
        .into_iter()
        .map(|(role, node)| (block_node_id(base_id, role), node))
        .collect()
}

fn with_tiling(node: WorkflowNode) -> WorkflowNode {
    node.with_literal("enable_vae_tiling", false)
        .with_literal("tile_x", TILE_SIZE)
        .with_literal("tile_y", TILE_SIZE)
        .with_literal("tile_stride_x", TILE_STRIDE_X)
        .with_literal("tile_stride_y", TILE_STRIDE_Y)
}

fn with_blend_mode(node: WorkflowNode) -> WorkflowNode {
    node.with_literal("overlap_side", "source")
        .with_literal("overlap_mode", "linear_blend")
}
