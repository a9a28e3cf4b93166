//! Order templates and their expansion into concrete node/edge graphs.
//!
//! An order template is a node/edge skeleton whose nodes and edges refer to
//! action templates by id.  [`TemplateRepository::get_template_with_graph`]
//! resolves those ids into concrete [`Action`]s, each with a fresh action id,
//! so every dispatch of the same template can be told apart in telemetry.
//!
//! # Catalog file
//!
//! [`InMemoryTemplateRepository::load_json`] reads a catalog of the form:
//!
//! ```json
//! {
//!   "actionTemplates": [
//!     { "id": "pick", "actionType": "pick", "blockingType": "HARD",
//!       "parameters": { "stationType": "floor", "height": 0.2 } }
//!   ],
//!   "orderTemplates": [
//!     { "id": "shuttle", "name": "Shuttle A to B",
//!       "nodes": [
//!         { "nodeId": "A", "sequenceId": 0, "actionTemplateIds": ["pick"] },
//!         { "nodeId": "B", "sequenceId": 2 }
//!       ],
//!       "edges": [
//!         { "edgeId": "A-B", "sequenceId": 1, "startNodeId": "A", "endNodeId": "B" }
//!       ] }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleetlink_types::{
    Action, ActionParameter, BlockingType, BridgeError, Edge, Node, NodePosition,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Template model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionTemplate {
    pub id: String,
    pub action_type: String,
    #[serde(default)]
    pub blocking_type: BlockingType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default parameter values.  Ordered so expanded actions serialise
    /// deterministically.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ActionTemplate {
    /// A concrete action with a fresh, unique action id.
    fn instantiate(&self) -> Action {
        Action {
            action_type: self.action_type.clone(),
            action_id: format!("{}-{}", self.id, Uuid::new_v4()),
            action_description: self.description.clone(),
            blocking_type: self.blocking_type,
            action_parameters: self
                .parameters
                .iter()
                .map(|(key, value)| ActionParameter {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    pub node_id: String,
    pub sequence_id: u32,
    #[serde(default = "released_by_default")]
    pub released: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_position: Option<NodePosition>,
    #[serde(default)]
    pub action_template_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeTemplate {
    pub edge_id: String,
    pub sequence_id: u32,
    #[serde(default = "released_by_default")]
    pub released: bool,
    pub start_node_id: String,
    pub end_node_id: String,
    #[serde(default)]
    pub action_template_ids: Vec<String>,
}

fn released_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTemplate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeTemplate>,
    #[serde(default)]
    pub edges: Vec<EdgeTemplate>,
}

/// On-disk catalog of action and order templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateCatalog {
    #[serde(default)]
    pub action_templates: Vec<ActionTemplate>,
    #[serde(default)]
    pub order_templates: Vec<OrderTemplate>,
}

/// A template expanded into concrete nodes and edges.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Repository trait
// ─────────────────────────────────────────────────────────────────────────────

/// Source of order templates for the execution engine.
pub trait TemplateRepository: Send + Sync {
    /// Resolve `template_id` into a concrete graph.
    ///
    /// # Errors
    ///
    /// [`BridgeError::TemplateNotFound`] for an unknown template and
    /// [`BridgeError::ActionTemplateNotFound`] when a node or edge refers to
    /// an unknown action template.  Expansion is all-or-nothing.
    fn get_template_with_graph(&self, template_id: &str) -> Result<OrderGraph, BridgeError>;

    /// Ids of every known order template, sorted.
    fn template_ids(&self) -> Vec<String>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum TemplateLoadError {
    #[error("failed to read template catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse template catalog {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Default)]
struct Catalog {
    actions: HashMap<String, ActionTemplate>,
    orders: HashMap<String, OrderTemplate>,
}

/// Thread-safe template store held entirely in memory.
#[derive(Default)]
pub struct InMemoryTemplateRepository {
    catalog: RwLock<Catalog>,
}

impl InMemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: TemplateCatalog) -> Self {
        let repo = Self::new();
        for action in catalog.action_templates {
            repo.insert_action_template(action);
        }
        for order in catalog.order_templates {
            repo.insert_order_template(order);
        }
        repo
    }

    /// Load a JSON catalog from `path`.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, TemplateLoadError> {
        let path = path.as_ref();
        let location = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| TemplateLoadError::Io {
            path: location.clone(),
            source,
        })?;
        let catalog: TemplateCatalog =
            serde_json::from_str(&raw).map_err(|source| TemplateLoadError::Parse {
                path: location.clone(),
                source,
            })?;
        info!(
            path = %location,
            action_templates = catalog.action_templates.len(),
            order_templates = catalog.order_templates.len(),
            "template catalog loaded"
        );
        Ok(Self::from_catalog(catalog))
    }

    /// Add or replace an action template.
    pub fn insert_action_template(&self, template: ActionTemplate) {
        self.write().actions.insert(template.id.clone(), template);
    }

    /// Add or replace an order template.
    pub fn insert_order_template(&self, template: OrderTemplate) {
        self.write().orders.insert(template.id.clone(), template);
    }

    pub fn order_template(&self, template_id: &str) -> Option<OrderTemplate> {
        self.read().orders.get(template_id).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn expand_actions(
    actions: &HashMap<String, ActionTemplate>,
    ids: &[String],
) -> Result<Vec<Action>, BridgeError> {
    ids.iter()
        .map(|id| {
            actions
                .get(id)
                .map(ActionTemplate::instantiate)
                .ok_or_else(|| BridgeError::ActionTemplateNotFound(id.clone()))
        })
        .collect()
}

impl TemplateRepository for InMemoryTemplateRepository {
    fn get_template_with_graph(&self, template_id: &str) -> Result<OrderGraph, BridgeError> {
        let catalog = self.read();
        let template = catalog
            .orders
            .get(template_id)
            .ok_or_else(|| BridgeError::TemplateNotFound(template_id.to_string()))?;

        let nodes = template
            .nodes
            .iter()
            .map(|n| {
                Ok(Node {
                    node_id: n.node_id.clone(),
                    sequence_id: n.sequence_id,
                    released: n.released,
                    node_position: n.node_position.clone(),
                    actions: expand_actions(&catalog.actions, &n.action_template_ids)?,
                })
            })
            .collect::<Result<Vec<_>, BridgeError>>()?;
        let edges = template
            .edges
            .iter()
            .map(|e| {
                Ok(Edge {
                    edge_id: e.edge_id.clone(),
                    sequence_id: e.sequence_id,
                    released: e.released,
                    start_node_id: e.start_node_id.clone(),
                    end_node_id: e.end_node_id.clone(),
                    actions: expand_actions(&catalog.actions, &e.action_template_ids)?,
                })
            })
            .collect::<Result<Vec<_>, BridgeError>>()?;

        debug!(
            template_id,
            nodes = nodes.len(),
            edges = edges.len(),
            "order template expanded"
        );
        Ok(OrderGraph { nodes, edges })
    }

    fn template_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.read().orders.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::io::Write;

    const CATALOG: &str = r#"{
        "actionTemplates": [
            { "id": "pick", "actionType": "pick", "blockingType": "HARD",
              "parameters": { "stationType": "floor", "height": 0.2 } },
            { "id": "beep", "actionType": "beep" }
        ],
        "orderTemplates": [
            { "id": "shuttle", "name": "Shuttle A to B",
              "nodes": [
                { "nodeId": "A", "sequenceId": 0, "actionTemplateIds": ["pick"] },
                { "nodeId": "B", "sequenceId": 2, "released": false }
              ],
              "edges": [
                { "edgeId": "A-B", "sequenceId": 1, "startNodeId": "A", "endNodeId": "B",
                  "actionTemplateIds": ["beep"] }
              ] },
            { "id": "broken",
              "nodes": [ { "nodeId": "A", "sequenceId": 0, "actionTemplateIds": ["missing"] } ] }
        ]
    }"#;

    fn repo() -> InMemoryTemplateRepository {
        InMemoryTemplateRepository::from_catalog(serde_json::from_str(CATALOG).unwrap())
    }

    #[test]
    fn expands_action_templates_into_nodes_and_edges() {
        let graph = repo().get_template_with_graph("shuttle").unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert!(!graph.nodes[1].released);

        let pick = &graph.nodes[0].actions[0];
        assert_eq!(pick.action_type, "pick");
        assert_eq!(pick.blocking_type, BlockingType::Hard);
        assert!(pick.action_id.starts_with("pick-"));
        assert_eq!(pick.parameter("height"), Some(&json!(0.2)));
        assert_eq!(graph.edges[0].actions[0].blocking_type, BlockingType::None);
    }

    #[test]
    fn each_expansion_mints_fresh_action_ids() {
        let repo = repo();
        let ids: HashSet<String> = (0..5)
            .map(|_| repo.get_template_with_graph("shuttle").unwrap())
            .map(|g| g.nodes[0].actions[0].action_id.clone())
            .collect();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn unknown_template_is_reported() {
        let err = repo().get_template_with_graph("nope").unwrap_err();
        assert!(matches!(err, BridgeError::TemplateNotFound(ref id) if id == "nope"));
    }

    #[test]
    fn unknown_action_template_fails_whole_expansion() {
        let err = repo().get_template_with_graph("broken").unwrap_err();
        assert!(matches!(err, BridgeError::ActionTemplateNotFound(ref id) if id == "missing"));
    }

    #[test]
    fn template_ids_are_sorted() {
        assert_eq!(repo().template_ids(), vec!["broken", "shuttle"]);
    }

    #[test]
    fn load_json_reads_catalog_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();

        let repo = InMemoryTemplateRepository::load_json(file.path()).unwrap();
        assert!(repo.order_template("shuttle").is_some());
    }

    #[test]
    fn load_json_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();

        let err = InMemoryTemplateRepository::load_json(file.path()).err().unwrap();
        assert!(matches!(err, TemplateLoadError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
