//! Workflow definition wire format and validation
//!
//! A definition is a directed acyclic graph of named, typed nodes. The JSON
//! shape is stable and byte-preserved by the snapshot store:
//!
//! ```json
//! {
//!   "name": "sync-users",
//!   "nodes": {
//!     "fetch": {
//!       "type": "http",
//!       "name": "fetch",
//!       "config": { "url": "https://example.com", "method": "GET" },
//!       "position": { "x": 0, "y": 0 },
//!       "onError": { "strategy": "fallback", "fallbackValue": {} }
//!     }
//!   },
//!   "edges": [{ "id": "e1", "source": "fetch", "target": "store" }],
//!   "entryPoint": "fetch",
//!   "settings": { "maxConcurrentNodes": 4 }
//! }
//! ```

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// Type tags of the built-in node kinds.
pub mod node_types {
    pub const HTTP: &str = "http";
    pub const TRANSFORM: &str = "transform";
    pub const CONDITIONAL: &str = "conditional";
    pub const LOOP: &str = "loop";
    pub const DATABASE_QUERY: &str = "database-query";
    pub const LLM: &str = "llm";
    pub const VARIABLE: &str = "variable";
    pub const USER_INPUT: &str = "user-input";
    pub const DELAY: &str = "delay";
    pub const INTEGRATION_OPERATION: &str = "integration-operation";
}

/// Canvas coordinates, carried for the UI and otherwise ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Per-node handling of executor failure, applied after the retry budget
/// is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Treat the failure as success with a `null` output
    Continue,

    /// Substitute a configured static value as the node output
    Fallback,

    /// Jump to a named node, skipping normal successors
    Goto,

    /// Propagate as execution failure (the default)
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnErrorPolicy {
    pub strategy: ErrorStrategy,

    #[serde(rename = "fallbackValue", skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<serde_json::Value>,

    #[serde(rename = "gotoNode", skip_serializing_if = "Option::is_none")]
    pub goto_node: Option<String>,
}

impl Default for OnErrorPolicy {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::Fail,
            fallback_value: None,
            goto_node: None,
        }
    }
}

/// One step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(rename = "type")]
    pub node_type: String,

    pub name: String,

    /// Type-specific configuration; interpolated against the execution scope
    /// immediately before dispatch.
    #[serde(default)]
    pub config: serde_json::Value,

    #[serde(default)]
    pub position: Position,

    #[serde(rename = "onError", default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnErrorPolicy>,
}

impl NodeDefinition {
    /// The effective error policy (`fail` when none is declared).
    pub fn error_policy(&self) -> OnErrorPolicy {
        self.on_error.clone().unwrap_or_default()
    }
}

/// A directed dependency between two nodes, optionally scoped to a named
/// output handle of the source (`conditional` emits on `true`/`false`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub id: String,
    pub source: String,
    pub target: String,

    #[serde(rename = "sourceHandle", default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Overall execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(
        rename = "maxConcurrentNodes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_concurrent_nodes: Option<usize>,

    #[serde(rename = "enableCache", default, skip_serializing_if = "Option::is_none")]
    pub enable_cache: Option<bool>,
}

/// A complete workflow graph.
///
/// Nodes are keyed by name in a `BTreeMap` so iteration order is
/// deterministic; the engine relies on that for replay stability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    pub nodes: BTreeMap<String, NodeDefinition>,

    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,

    #[serde(rename = "entryPoint")]
    pub entry_point: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<WorkflowSettings>,
}

impl WorkflowDefinition {
    /// Parse a definition from its wire form.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.get(name)
    }

    /// Edges entering `name`.
    pub fn inbound_edges<'a, 'b>(
        &'a self,
        name: &'b str,
    ) -> impl Iterator<Item = &'a EdgeDefinition> + use<'a, 'b> {
        self.edges.iter().filter(move |e| e.target == name)
    }

    /// Edges leaving `name`.
    pub fn outbound_edges<'a, 'b>(
        &'a self,
        name: &'b str,
    ) -> impl Iterator<Item = &'a EdgeDefinition> + use<'a, 'b> {
        self.edges.iter().filter(move |e| e.source == name)
    }

    pub fn max_concurrent_nodes(&self) -> Option<usize> {
        self.settings.as_ref().and_then(|s| s.max_concurrent_nodes)
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        self.settings.as_ref().and_then(|s| s.timeout)
    }

    /// Validate structure: node keys match names, the entry point exists,
    /// edges reference known nodes, edge ids are unique, and the graph is
    /// acyclic.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.nodes.is_empty() {
            return Err(DefinitionError::Empty);
        }

        for (key, node) in &self.nodes {
            if key != &node.name {
                return Err(DefinitionError::NodeNameMismatch {
                    key: key.clone(),
                    name: node.name.clone(),
                });
            }
        }

        if !self.nodes.contains_key(&self.entry_point) {
            return Err(DefinitionError::UnknownEntryPoint(self.entry_point.clone()));
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(DefinitionError::DuplicateEdgeId(edge.id.clone()));
            }
            if edge.source == edge.target {
                return Err(DefinitionError::SelfEdge(edge.id.clone()));
            }
            for endpoint in [&edge.source, &edge.target] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(DefinitionError::UnknownEdgeNode {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm; any node left with a positive in-degree sits on a
    /// cycle.
    fn check_acyclic(&self) -> Result<(), DefinitionError> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.nodes.keys().map(|k| (k.as_str(), 0)).collect();
        for edge in &self.edges {
            if let Some(d) = in_degree.get_mut(edge.target.as_str()) {
                *d += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited = 0usize;

        while let Some(name) = queue.pop_front() {
            visited += 1;
            for edge in self.outbound_edges(name) {
                if let Some(d) = in_degree.get_mut(edge.target.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(edge.target.as_str());
                    }
                }
            }
        }

        if visited == self.nodes.len() {
            Ok(())
        } else {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(k, _)| (*k).to_string())
                .unwrap_or_default();
            Err(DefinitionError::Cycle(stuck))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(name: &str, node_type: &str) -> NodeDefinition {
        NodeDefinition {
            node_type: node_type.to_string(),
            name: name.to_string(),
            config: json!({}),
            position: Position::default(),
            on_error: None,
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> EdgeDefinition {
        EdgeDefinition {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: None,
        }
    }

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "linear".to_string(),
            nodes: BTreeMap::from([
                ("a".to_string(), node("a", node_types::HTTP)),
                ("b".to_string(), node("b", node_types::TRANSFORM)),
            ]),
            edges: vec![edge("e1", "a", "b")],
            entry_point: "a".to_string(),
            settings: None,
        }
    }

    #[test]
    fn test_valid_definition() {
        assert!(linear().validate().is_ok());
    }

    #[test]
    fn test_unknown_entry_point() {
        let mut def = linear();
        def.entry_point = "missing".to_string();
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::UnknownEntryPoint(_))
        ));
    }

    #[test]
    fn test_edge_to_unknown_node() {
        let mut def = linear();
        def.edges.push(edge("e2", "b", "ghost"));
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::UnknownEdgeNode { .. })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let mut def = linear();
        def.edges.push(edge("e2", "b", "a"));
        assert!(matches!(def.validate(), Err(DefinitionError::Cycle(_))));
    }

    #[test]
    fn test_node_name_mismatch() {
        let mut def = linear();
        def.nodes.get_mut("a").unwrap().name = "not-a".to_string();
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::NodeNameMismatch { .. })
        ));
    }

    #[test]
    fn test_wire_format_round_trip() {
        let raw = json!({
            "name": "demo",
            "nodes": {
                "n1": {
                    "type": "http",
                    "name": "n1",
                    "config": {"url": "https://example.com", "method": "GET"},
                    "position": {"x": 10.0, "y": 20.0}
                },
                "n2": {
                    "type": "transform",
                    "name": "n2",
                    "config": {"expression": {"out": "${n1.data}"}},
                    "position": {"x": 30.0, "y": 20.0},
                    "onError": {"strategy": "fallback", "fallbackValue": {"ok": false}}
                }
            },
            "edges": [{"id": "e1", "source": "n1", "target": "n2"}],
            "entryPoint": "n1",
            "settings": {"timeout": 300, "maxConcurrentNodes": 2, "enableCache": false}
        })
        .to_string();

        let def = WorkflowDefinition::from_json(&raw).unwrap();
        assert_eq!(def.entry_point, "n1");
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(
            def.nodes["n2"].error_policy().strategy,
            ErrorStrategy::Fallback
        );
        assert_eq!(def.max_concurrent_nodes(), Some(2));
        assert!(def.validate().is_ok());

        let reparsed = WorkflowDefinition::from_json(&def.to_json().unwrap()).unwrap();
        assert_eq!(def, reparsed);
    }

    #[test]
    fn test_default_error_policy_is_fail() {
        let def = linear();
        assert_eq!(def.nodes["a"].error_policy().strategy, ErrorStrategy::Fail);
    }

    #[test]
    fn test_edge_queries() {
        let def = linear();
        assert_eq!(def.inbound_edges("b").count(), 1);
        assert_eq!(def.outbound_edges("a").count(), 1);
        assert_eq!(def.inbound_edges("a").count(), 0);
    }
}
