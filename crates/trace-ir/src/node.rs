//! Node records and the insertion-ordered user set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::arg::{Argument, OpKind, Target, TensorType};
use crate::graph::GraphId;

/// Stable identifier for a node within its owning graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Insertion-ordered set of node identifiers.
///
/// Iteration yields members in first-insertion order, and removal keeps the
/// order of the survivors. Use replacement snapshots this order before it
/// starts mutating, so it must stay stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    items: SmallVec<[NodeId; 4]>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the id, returning `false` when it was already present.
    pub fn insert(&mut self, node: NodeId) -> bool {
        if self.items.contains(&node) {
            return false;
        }
        self.items.push(node);
        true
    }

    /// Removes the id, returning `false` when it was not a member.
    pub fn remove(&mut self, node: NodeId) -> bool {
        let before = self.items.len();
        self.items.retain(|id| *id != node);
        self.items.len() != before
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.items.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.items.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<NodeId> {
        self.items.to_vec()
    }
}

/// One recorded operation invocation, linked into its graph's node sequence.
///
/// Nodes are owned by their [`Graph`](crate::graph::Graph) and mutated only
/// through it; the record itself exposes read access.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) graph: GraphId,
    pub(crate) name: String,
    pub(crate) op: OpKind,
    pub(crate) target: Target,
    pub(crate) args: Vec<Argument>,
    pub(crate) kwargs: BTreeMap<String, Argument>,
    pub(crate) users: NodeSet,
    pub(crate) ty: Option<TensorType>,
    pub(crate) prev: NodeId,
    pub(crate) next: NodeId,
    pub(crate) erased: bool,
}

impl Node {
    /// Builds an unlinked record: the sequence links point back at the node
    /// itself until the graph splices it in.
    pub(crate) fn new(
        graph: GraphId,
        id: NodeId,
        name: String,
        op: OpKind,
        target: Target,
        ty: Option<TensorType>,
    ) -> Self {
        Node {
            graph,
            name,
            op,
            target,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            users: NodeSet::new(),
            ty,
            prev: id,
            next: id,
            erased: false,
        }
    }

    /// Identity of the owning graph; fixed for the node's lifetime.
    pub fn graph_id(&self) -> GraphId {
        self.graph
    }

    /// Unique name of the value this node produces.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Positional arguments of the recorded invocation.
    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Keyword arguments of the recorded invocation.
    pub fn kwargs(&self) -> &BTreeMap<String, Argument> {
        &self.kwargs
    }

    /// Nodes that reference this node in their argument trees, in first-use
    /// order. A user appears once even when it references this node several
    /// times.
    pub fn users(&self) -> &[NodeId] {
        self.users.as_slice()
    }

    /// Optional type annotation; opaque to the graph core.
    pub fn ty(&self) -> Option<&TensorType> {
        self.ty.as_ref()
    }

    /// Successor in the node sequence (the node itself while unlinked).
    pub fn next(&self) -> NodeId {
        self.next
    }

    /// Predecessor in the node sequence (the node itself while unlinked).
    pub fn prev(&self) -> NodeId {
        self.prev
    }

    /// Tombstone set when the graph erases the node.
    pub fn is_erased(&self) -> bool {
        self.erased
    }

    /// Collects the distinct node leaves of both argument trees, in traversal
    /// order.
    pub(crate) fn collect_defs(&self) -> NodeSet {
        let mut defs = NodeSet::new();
        for arg in &self.args {
            arg.for_each_node(&mut |node| {
                defs.insert(node);
            });
        }
        for value in self.kwargs.values() {
            value.for_each_node(&mut |node| {
                defs.insert(node);
            });
        }
        defs
    }
}
