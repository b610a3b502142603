//! Builds a long-sequence workflow from a single-window base graph.
//!
//! The base graph renders one window. For longer inputs the assembler chains
//! extend blocks onto the base output, then slices the combined batch back to
//! the requested frame count and points the sink at the slice.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::extend::{block_base_id, planned_output_frames, WindowSpec};
use crate::graph::{WorkflowDocument, WorkflowNode};
use crate::template::{stamp_block, Predecessor, SharedRefs};
use crate::types::{EdgeRef, InputValue};

pub const TRIM_OPERATION: &str = "GetImageRangeFromBatch";
pub const SINK_OPERATION: &str = "VHS_VideoCombine";
pub const DEFAULT_SINK_FRAME_RATE: u32 = 16;

/// Node ids in the base graph that assembly reads or edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphLayout {
    /// Video loader whose `frame_load_cap` must cover the whole input.
    pub frame_loader: String,
    /// Nodes whose `num_frames` sets the first window's length.
    pub window_nodes: Vec<String>,
    /// Output of the base window (slot 0).
    pub base_output: String,
    /// Terminal node consuming the final `images`.
    pub sink: String,
    /// Id given to the appended trim node.
    pub trim_node: String,
    pub shared: SharedRefs,
}

impl Default for GraphLayout {
    fn default() -> Self {
        Self {
            frame_loader: "130".to_string(),
            window_nodes: vec!["99".to_string(), "195".to_string()],
            base_output: "28".to_string(),
            sink: "139".to_string(),
            trim_node: "900".to_string(),
            shared: SharedRefs::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssemblyRequest {
    pub total_frames: u32,
    pub window: WindowSpec,
    /// Source frame rate, if the prober could determine one.
    pub frame_rate: Option<f64>,
}

impl AssemblyRequest {
    pub fn new(total_frames: u32) -> Self {
        Self {
            total_frames,
            window: WindowSpec::default(),
            frame_rate: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Assembly {
    pub document: WorkflowDocument,
    pub extend_count: u32,
    pub block_ids: Vec<u32>,
    /// Output the trim node slices from.
    pub trim_source: EdgeRef,
    /// Frames in the batch before trimming.
    pub planned_frames: u64,
}

pub fn assemble(
    base: WorkflowDocument,
    request: &AssemblyRequest,
    layout: &GraphLayout,
) -> Result<Assembly> {
    let AssemblyRequest {
        total_frames,
        window,
        frame_rate,
    } = *request;
    window.check().context("invalid window configuration")?;

    let mut document = base;
    let extend_count = window.extend_count(total_frames);
    info!(
        total_frames,
        window_size = window.size,
        overlap = window.overlap,
        extend_count,
        "Planning extend blocks"
    );

    check_required_nodes(&document, layout, extend_count > 0)?;
    configure_base_window(&mut document, layout, total_frames, window)?;

    let mut predecessor = Predecessor::Base(layout.base_output.clone());
    let mut block_ids = Vec::with_capacity(extend_count as usize);
    for index in 0..extend_count as usize {
        let base_id = block_base_id(index);
        info!(
            block = index + 1,
            of = extend_count,
            base_id,
            "Stamping extend block"
        );
        let block = stamp_block(base_id, &predecessor, &layout.shared, window, index == 0);
        document
            .extend(block)
            .with_context(|| format!("failed to merge extend block {index} (base id {base_id})"))?;
        block_ids.push(base_id);
        predecessor = Predecessor::Block(base_id);
    }

    let trim_source = predecessor.output();
    let trim = WorkflowNode::new(TRIM_OPERATION, "Get Image or Mask Range From Batch")
        .with_literal("start_index", 0)
        .with_literal("num_frames", total_frames)
        .with_input("images", trim_source.clone());
    document
        .insert(layout.trim_node.clone(), trim)
        .context("failed to append trim node")?;
    debug!(trim_node = %layout.trim_node, source = %trim_source, total_frames, "Appended trim node");

    rewire_sink(&mut document, layout, frame_rate)?;

    document
        .validate()
        .context("assembled workflow failed validation")?;

    Ok(Assembly {
        document,
        extend_count,
        block_ids,
        trim_source,
        planned_frames: planned_output_frames(total_frames, window),
    })
}

fn check_required_nodes(
    document: &WorkflowDocument,
    layout: &GraphLayout,
    needs_blocks: bool,
) -> Result<()> {
    if layout.window_nodes.is_empty() {
        bail!("layout names no window-size nodes");
    }

    let mut required: Vec<&str> = vec![layout.frame_loader.as_str(), layout.base_output.as_str()];
    required.extend(layout.window_nodes.iter().map(String::as_str));
    if needs_blocks {
        required.extend(layout.shared.node_ids());
    }

    for id in required {
        document
            .require(id)
            .context("base graph template is incomplete")?;
    }
    Ok(())
}

fn configure_base_window(
    document: &mut WorkflowDocument,
    layout: &GraphLayout,
    total_frames: u32,
    window: WindowSpec,
) -> Result<()> {
    // `frame_load_cap = 0` does not mean "all frames" on every engine.
    let loader = document.require_mut(&layout.frame_loader)?;
    loader
        .inputs
        .insert("frame_load_cap".to_string(), InputValue::literal(total_frames));
    if loader.inputs.contains_key("force_rate") {
        loader
            .inputs
            .insert("force_rate".to_string(), InputValue::literal(0));
    }
    debug!(node = %layout.frame_loader, frame_load_cap = total_frames, "Configured frame loader");

    let first_window = total_frames.min(window.size);
    for id in &layout.window_nodes {
        document.set_literal(id, "num_frames", first_window)?;
        debug!(node = %id, num_frames = first_window, "Configured window node");
    }
    Ok(())
}

fn rewire_sink(
    document: &mut WorkflowDocument,
    layout: &GraphLayout,
    frame_rate: Option<f64>,
) -> Result<()> {
    let images = InputValue::link(layout.trim_node.clone(), 0);
    let rate = frame_rate.filter(|fps| fps.is_finite() && *fps > 0.0);

    if document.contains(&layout.sink) {
        document.set_input(&layout.sink, "images", images)?;
        if let Some(fps) = rate {
            document.set_literal(&layout.sink, "frame_rate", frame_rate_value(fps))?;
        }
        info!(sink = %layout.sink, trim_node = %layout.trim_node, frame_rate = ?rate, "Rewired sink to trim node");
        return Ok(());
    }

    let frame_rate = rate
        .map(frame_rate_value)
        .unwrap_or_else(|| Value::from(DEFAULT_SINK_FRAME_RATE));
    let sink = WorkflowNode::new(SINK_OPERATION, "Video Combine")
        .with_literal("frame_rate", frame_rate)
        .with_literal("loop_count", 0)
        .with_literal("filename_prefix", "WanVideo_OneToAllAnimation")
        .with_literal("format", "video/h264-mp4")
        .with_literal("pix_fmt", "yuv420p")
        .with_literal("crf", 19)
        .with_literal("save_metadata", true)
        .with_literal("trim_to_audio", false)
        .with_literal("pingpong", false)
        .with_literal("save_output", false)
        .with_input("images", images);
    document.insert(layout.sink.clone(), sink)?;
    info!(sink = %layout.sink, "Created missing sink node");
    Ok(())
}

// Whole rates stay integers so the output matches hand-written templates.
fn frame_rate_value(fps: f64) -> Value {
    if fps.fract() == 0.0 && fps <= u32::MAX as f64 {
        Value::from(fps as u32)
    } else {
        Value::from(fps)
    }
}
