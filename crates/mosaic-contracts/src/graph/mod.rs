//! Node-graph templates in the engine's API format.
//!
//! A graph maps node ids to nodes; each node carries an operation tag
//! (`class_type`) and named inputs that are either literal scalars or
//! references to another node's output slot (`["4", 0]` on the wire).
//! Storage keeps the document order so saved templates round-trip, while
//! every "first node of a kind" lookup walks [`Graph::ordered_ids`].

mod instantiate;
mod roles;
mod summary;

use std::cmp::Ordering;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub use instantiate::{
    instantiate, instantiate_with_rng, GenerationRequest, InstantiatedGraph, SEED_UPPER_BOUND,
};
pub use roles::{infer_roles, GraphIncomplete, MissingRole, NodeRole, RoleMap};
pub use summary::{calculate_size, describe_editable_nodes, summarize, TemplateSummary};

pub type NodeId = String;

/// A data-flow edge: the output `slot` of node `node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub node: NodeId,
    pub slot: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Scalar(Value),
    Reference(NodeRef),
}

impl InputValue {
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn reference(node: impl Into<String>, slot: u64) -> Self {
        Self::Reference(NodeRef {
            node: node.into(),
            slot,
        })
    }

    pub fn as_reference(&self) -> Option<&NodeRef> {
        match self {
            Self::Reference(reference) => Some(reference),
            Self::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::Reference(_) => None,
        }
    }

    fn from_json(raw: Value) -> Self {
        if let Value::Array(items) = &raw {
            if let [Value::String(node), slot] = items.as_slice() {
                if let Some(slot) = slot.as_u64() {
                    return Self::Reference(NodeRef {
                        node: node.clone(),
                        slot,
                    });
                }
            }
        }
        Self::Scalar(raw)
    }
}

impl Serialize for InputValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Scalar(value) => value.serialize(serializer),
            Self::Reference(reference) => (&reference.node, reference.slot).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_json)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "class_type")]
    pub kind: String,
    #[serde(default)]
    pub inputs: IndexMap<String, InputValue>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMeta>,
    /// Node-level keys this crate does not interpret, kept for round-trips.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inputs: IndexMap::new(),
            meta: None,
            extra: IndexMap::new(),
        }
    }

    pub fn with_scalar(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inputs
            .insert(name.to_string(), InputValue::scalar(value));
        self
    }

    pub fn with_reference(mut self, name: &str, node: &str, slot: u64) -> Self {
        self.inputs
            .insert(name.to_string(), InputValue::reference(node, slot));
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.meta
            .get_or_insert_with(NodeMeta::default)
            .title = Some(title.to_string());
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.title.as_deref())
    }

    pub fn input(&self, name: &str) -> Option<&InputValue> {
        self.inputs.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(InputValue::as_scalar)
    }

    pub fn set_scalar(&mut self, name: &str, value: impl Into<Value>) {
        self.inputs
            .insert(name.to_string(), InputValue::scalar(value));
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Graph {
    nodes: IndexMap<NodeId, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("template is not a valid node graph")
    }

    pub fn to_json_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed serializing node graph")
    }

    pub fn insert(&mut self, id: impl Into<String>, node: Node) {
        self.nodes.insert(id.into(), node);
    }

    pub fn with_node(mut self, id: &str, node: Node) -> Self {
        self.insert(id, node);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in the deterministic order used for every tie-break:
    /// numeric ids ascending, then the remaining ids lexicographically.
    pub fn ordered_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_by(|left, right| compare_node_ids(left, right));
        ids
    }

    pub fn ordered_nodes(&self) -> impl Iterator<Item = (&str, &Node)> + '_ {
        self.ordered_ids()
            .into_iter()
            .filter_map(move |id| self.nodes.get(id).map(|node| (id, node)))
    }

    /// Target of `node_id.input` when that input is a reference to a node
    /// that exists in this graph.
    pub fn resolve_reference(&self, node_id: &str, input: &str) -> Option<(&str, &Node)> {
        let reference = self.get(node_id)?.input(input)?.as_reference()?;
        self.nodes
            .get_key_value(reference.node.as_str())
            .map(|(id, node)| (id.as_str(), node))
    }

    pub fn set_input(&mut self, node_id: &str, input: &str, value: Value) -> Result<()> {
        let Some(node) = self.nodes.get_mut(node_id) else {
            bail!("node '{node_id}' not found in template");
        };
        if input.trim().is_empty() {
            bail!("input name must not be empty");
        }
        node.set_scalar(input, value);
        Ok(())
    }
}

pub fn compare_node_ids(left: &str, right: &str) -> Ordering {
    match (left.parse::<u64>(), right.parse::<u64>()) {
        (Ok(left_num), Ok(right_num)) => left_num.cmp(&right_num).then_with(|| left.cmp(right)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => left.cmp(right),
    }
}
