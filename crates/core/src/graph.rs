use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{EdgeRef, InputValue};

/// One node of a workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub inputs: BTreeMap<String, InputValue>,
    #[serde(rename = "class_type")]
    pub operation: String,
    #[serde(rename = "_meta", default = "empty_metadata")]
    pub metadata: serde_json::Value,
    /// Node-level keys the document carries beyond the three above
    /// (e.g. `is_changed`); written back unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl WorkflowNode {
    pub fn new(operation: impl Into<String>, title: &str) -> Self {
        Self {
            inputs: BTreeMap::new(),
            operation: operation.into(),
            metadata: serde_json::json!({ "title": title }),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_input(mut self, name: &str, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(name.to_string(), value.into());
        self
    }

    pub fn with_literal(self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.with_input(name, InputValue::literal(value))
    }

    pub fn input(&self, name: &str) -> Option<&InputValue> {
        self.inputs.get(name)
    }

    pub fn links(&self) -> impl Iterator<Item = (&str, &EdgeRef)> {
        self.inputs
            .iter()
            .filter_map(|(name, value)| value.as_link().map(|edge| (name.as_str(), edge)))
    }
}

/// Workflow graph keyed by node id.
///
/// Nodes are append-only: [`insert`](Self::insert) and [`extend`](Self::extend)
/// refuse to overwrite an existing id. The only in-place edits are input
/// assignments on nodes that already exist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowDocument {
    nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse workflow JSON: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory: {}", parent.display())
            })?;
        }
        fs::write(path, self.to_json_pretty()?)
            .with_context(|| format!("failed to write workflow file: {}", path.display()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize workflow JSON")
    }

    /// SHA-256 of the canonical serialization, lowercase hex.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self).context("failed to serialize workflow JSON")?;
        Ok(format!("{:x}", Sha256::digest(&canonical)))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WorkflowNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn require(&self, id: &str) -> Result<&WorkflowNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| anyhow!("missing required node '{id}'"))
    }

    pub fn require_mut(&mut self, id: &str) -> Result<&mut WorkflowNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| anyhow!("missing required node '{id}'"))
    }

    pub fn insert(&mut self, id: impl Into<String>, node: WorkflowNode) -> Result<()> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            bail!("duplicate node id: {id}");
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Moves every node of `other` into `self`. Checks all ids before
    /// inserting any, so a collision leaves `self` untouched.
    pub fn extend(&mut self, other: WorkflowDocument) -> Result<()> {
        if let Some(id) = other.ids().find(|id| self.contains(id)) {
            bail!("duplicate node id: {id}");
        }
        self.nodes.extend(other.nodes);
        Ok(())
    }

    pub fn set_input(&mut self, id: &str, name: &str, value: impl Into<InputValue>) -> Result<()> {
        self.require_mut(id)?
            .inputs
            .insert(name.to_string(), value.into());
        Ok(())
    }

    pub fn set_literal(
        &mut self,
        id: &str,
        name: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<()> {
        self.set_input(id, name, InputValue::literal(value))
    }

    /// Checks that every link points at an existing node and that the links
    /// form a DAG.
    pub fn validate(&self) -> Result<()> {
        let mut graph: DiGraph<&str, &str> = DiGraph::new();
        let indices: HashMap<&str, NodeIndex> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();

        for (id, node) in &self.nodes {
            let target = indices[id.as_str()];
            for (input, edge) in node.links() {
                let source = indices.get(edge.node_id.as_str()).copied().ok_or_else(|| {
                    anyhow!(
                        "node '{id}' input '{input}' links to unknown node '{}'",
                        edge.node_id
                    )
                })?;
                graph.add_edge(source, target, input);
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            anyhow!(
                "cycle detected in workflow graph at node '{}'",
                graph[cycle.node_id()]
            )
        })?;
        Ok(())
    }
}

impl FromIterator<(String, WorkflowNode)> for WorkflowDocument {
    fn from_iter<I: IntoIterator<Item = (String, WorkflowNode)>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for WorkflowDocument {
    type Item = (String, WorkflowNode);
    type IntoIter = std::collections::btree_map::IntoIter<String, WorkflowNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_document() -> WorkflowDocument {
        serde_json::from_value(json!({
            "1": {
                "inputs": {"video": "clip.mp4", "frame_load_cap": 0},
                "class_type": "VHS_LoadVideo",
                "_meta": {"title": "Load Video"}
            },
            "2": {
                "inputs": {"images": ["1", 0], "frame_rate": 16},
                "class_type": "VHS_VideoCombine"
            }
        }))
        .expect("sample workflow should deserialize")
    }

    #[test]
    fn deserializes_links_and_literals() {
        let doc = sample_document();
        let combine = doc.require("2").unwrap();
        assert_eq!(combine.operation, "VHS_VideoCombine");
        assert_eq!(combine.input("images"), Some(&InputValue::link("1", 0)));
        assert_eq!(combine.input("frame_rate").and_then(InputValue::as_u64), Some(16));
        assert_eq!(combine.metadata, json!({}));
    }

    #[test]
    fn serializes_with_wire_keys() {
        let doc = sample_document();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["1"]["class_type"], "VHS_LoadVideo");
        assert_eq!(value["1"]["_meta"]["title"], "Load Video");
        assert_eq!(value["2"]["inputs"]["images"], json!(["1", 0]));
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let mut doc = sample_document();
        let err = doc
            .insert("1", WorkflowNode::new("Other", "Other"))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate node id: 1"));
        assert_eq!(doc.require("1").unwrap().operation, "VHS_LoadVideo");
    }

    #[test]
    fn extend_is_all_or_nothing() {
        let mut doc = sample_document();
        let incoming: WorkflowDocument = [
            ("3".to_string(), WorkflowNode::new("A", "A")),
            ("2".to_string(), WorkflowNode::new("B", "B")),
        ]
        .into_iter()
        .collect();

        assert!(doc.extend(incoming).is_err());
        assert!(!doc.contains("3"));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn require_names_missing_node() {
        let doc = sample_document();
        let err = doc.require("130").unwrap_err();
        assert_eq!(err.to_string(), "missing required node '130'");
    }

    #[test]
    fn set_input_requires_existing_node() {
        let mut doc = sample_document();
        doc.set_literal("1", "frame_load_cap", 320).unwrap();
        assert_eq!(
            doc.require("1").unwrap().input("frame_load_cap").and_then(InputValue::as_u64),
            Some(320)
        );
        assert!(doc.set_literal("99", "num_frames", 81).is_err());
    }

    #[test]
    fn validate_accepts_sample() {
        sample_document().validate().unwrap();
    }

    #[test]
    fn validate_reports_dangling_link() {
        let mut doc = sample_document();
        doc.set_input("2", "images", InputValue::link("missing", 0))
            .unwrap();
        let err = doc.validate().unwrap_err().to_string();
        assert!(err.contains("links to unknown node 'missing'"), "{err}");
    }

    #[test]
    fn validate_reports_cycle() {
        let mut doc = sample_document();
        doc.set_input("1", "video", InputValue::link("2", 0)).unwrap();
        let err = doc.validate().unwrap_err().to_string();
        assert!(err.contains("cycle detected"), "{err}");
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = sample_document();
        let b = sample_document();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("workflow.json");
        let doc = sample_document();
        doc.save(&path).unwrap();
        assert_eq!(WorkflowDocument::load(&path).unwrap(), doc);
    }

    #[test]
    fn unknown_node_keys_survive_roundtrip() {
        let raw = r#"{
            "1": {
                "inputs": {"video": "pose.mp4"},
                "class_type": "VHS_LoadVideo",
                "_meta": {"title": "Load Video"},
                "is_changed": ["a1b2"]
            }
        }"#;
        let doc: WorkflowDocument = serde_json::from_str(raw).unwrap();
        let node = doc.require("1").unwrap();
        assert_eq!(node.extra.get("is_changed"), Some(&serde_json::json!(["a1b2"])));
        assert!(!node.extra.contains_key("inputs"));

        let written: serde_json::Value =
            serde_json::from_str(&doc.to_json_pretty().unwrap()).unwrap();
        assert_eq!(written["1"]["is_changed"], serde_json::json!(["a1b2"]));
        assert_eq!(written["1"]["class_type"], "VHS_LoadVideo");
        assert!(WorkflowNode::new("VHS_VideoCombine", "Video Combine")
            .extra
            .is_empty());
    }
}
