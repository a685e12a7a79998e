//! Serialised graph documents and file IO.
//!
//! A [`GraphDoc`] captures a graph as plain data: nodes in sequence order,
//! each carrying the identifier it had when captured. Loading replays the
//! entries through [`Graph::create_node`] with an old-id to new-id remap of
//! the argument trees, so a loaded graph re-validates every construction
//! invariant and receives a fresh runtime identity.

use std::collections::{BTreeMap, HashMap};
use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arg::{Argument, OpKind, Target, TensorType};
use crate::graph::{Graph, GraphError};
use crate::node::NodeId;

/// Frozen document format version enforced on load.
pub const DOC_VERSION: &str = "trir.v1";

fn default_doc_version() -> String {
    DOC_VERSION.to_string()
}

/// Serialised snapshot of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDoc {
    #[serde(default = "default_doc_version")]
    pub doc_version: String,
    pub nodes: Vec<NodeDoc>,
}

/// One node entry; `id` is the identifier the node had when captured and is
/// remapped on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    pub id: NodeId,
    pub name: String,
    pub op: OpKind,
    pub target: Target,
    pub args: Vec<Argument>,
    pub kwargs: BTreeMap<String, Argument>,
    #[serde(default)]
    pub ty: Option<TensorType>,
}

#[derive(Debug, Error)]
pub enum GraphDocError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("document version '{found}' does not match expected '{expected}'")]
    DocVersionMismatch {
        found: String,
        expected: &'static str,
    },
    #[error("document references node {node:?} before it is defined")]
    MissingNodeMapping { node: NodeId },
    #[error(transparent)]
    Construction(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum GraphIoError {
    #[error(transparent)]
    Serialization(#[from] GraphDocError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Graph {
    /// Captures the graph as a document, nodes listed in sequence order.
    pub fn to_doc(&self) -> GraphDoc {
        let nodes = self
            .nodes()
            .map(|id| {
                let record = self.node(id);
                NodeDoc {
                    id,
                    name: record.name().to_string(),
                    op: record.op(),
                    target: record.target().clone(),
                    args: record.args().to_vec(),
                    kwargs: record.kwargs().clone(),
                    ty: record.ty().cloned(),
                }
            })
            .collect();
        GraphDoc {
            doc_version: DOC_VERSION.to_string(),
            nodes,
        }
    }

    /// Rebuilds a graph from a document.
    ///
    /// Entries are replayed in order, so a node's defs must appear before the
    /// node itself; forward references are rejected.
    pub fn from_doc(doc: &GraphDoc) -> Result<Graph, GraphDocError> {
        let mut graph = Graph::new();
        let mut id_map: HashMap<NodeId, NodeId> = HashMap::new();

        for entry in &doc.nodes {
            let mut missing = None;
            let mut remap = |node: NodeId| -> Argument {
                match id_map.get(&node) {
                    Some(mapped) => Argument::Node(*mapped),
                    None => {
                        if missing.is_none() {
                            missing = Some(node);
                        }
                        Argument::Node(node)
                    }
                }
            };
            let args: Vec<Argument> = entry
                .args
                .iter()
                .map(|arg| arg.map_nodes(&mut remap))
                .collect();
            let kwargs: BTreeMap<String, Argument> = entry
                .kwargs
                .iter()
                .map(|(key, value)| (key.clone(), value.map_nodes(&mut remap)))
                .collect();
            if let Some(node) = missing {
                return Err(GraphDocError::MissingNodeMapping { node });
            }

            let new_id = graph.create_node(
                entry.name.clone(),
                entry.op,
                entry.target.clone(),
                args,
                kwargs,
                entry.ty.clone(),
            )?;
            id_map.insert(entry.id, new_id);
        }

        Ok(graph)
    }

    pub fn to_json_string(&self) -> Result<String, GraphDocError> {
        serde_json::to_string_pretty(&self.to_doc()).map_err(GraphDocError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Graph, GraphDocError> {
        let mut doc: GraphDoc = serde_json::from_str(src).map_err(GraphDocError::from)?;
        doc.doc_version = normalize_doc_version(doc.doc_version)?;
        Graph::from_doc(&doc)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, GraphDocError> {
        bincode::serialize(&self.to_doc()).map_err(GraphDocError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Graph, GraphDocError> {
        let mut doc: GraphDoc = bincode::deserialize(bytes).map_err(GraphDocError::from)?;
        doc.doc_version = normalize_doc_version(doc.doc_version)?;
        Graph::from_doc(&doc)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(GraphIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Graph, GraphIoError> {
        let contents = fs::read_to_string(path).map_err(GraphIoError::from)?;
        Graph::from_json_str(&contents).map_err(GraphIoError::from)
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphIoError> {
        let bytes = self.to_bincode_bytes()?;
        fs::write(path, bytes).map_err(GraphIoError::from)
    }

    pub fn load_bincode<P: AsRef<Path>>(path: P) -> Result<Graph, GraphIoError> {
        let bytes = fs::read(path).map_err(GraphIoError::from)?;
        Graph::from_bincode_slice(&bytes).map_err(GraphIoError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_doc_version(version: String) -> Result<String, GraphDocError> {
    if version.is_empty() {
        return Ok(DOC_VERSION.to_string());
    }
    if version == DOC_VERSION {
        Ok(version)
    } else {
        Err(GraphDocError::DocVersionMismatch {
            found: version,
            expected: DOC_VERSION,
        })
    }
}
