//! Graph owner: node storage, def/use bookkeeping, and rewrite primitives.
//!
//! All cross-node mutation flows through [`Graph`] so the reverse edges and
//! the intrasequence links stay consistent:
//!
//! - argument reassignment funnels through a single update point that
//!   diff-updates the users sets of the affected defs;
//! - relinking detaches a node from its current position before splicing it
//!   back in;
//! - use replacement snapshots the users set before rewriting, then asserts
//!   the set drained.
//!
//! The graph holds a `root` sentinel node; the node sequence is circular
//! through it and new nodes are spliced in immediately before it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use thiserror::Error;

use crate::arg::{Argument, FuncRef, OpKind, Target, TensorType};
use crate::node::{Node, NodeId};

/// Process-unique identity for a graph instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

static GRAPH_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

impl GraphId {
    fn next() -> Self {
        GraphId(GRAPH_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// Errors surfaced when constructing nodes or reassigning their arguments.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node name `{name}` is already bound in this graph")]
    DuplicateName { name: String },
    #[error("{op} nodes require a plain-name target")]
    TargetNotAName { op: OpKind },
    #[error("argument references node {node:?} which is not a live member of this graph")]
    UnknownNode { node: NodeId },
}

/// Owner of a sequence of operation nodes.
#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    nodes: HashMap<NodeId, Node>,
    names: HashMap<String, NodeId>,
    root: NodeId,
    next_node: u32,
}

impl Graph {
    /// Creates an empty graph holding only the sequence sentinel.
    pub fn new() -> Self {
        let id = GraphId::next();
        let root = NodeId(0);
        let sentinel = Node::new(id, root, String::new(), OpKind::Root, Target::name(""), None);
        let mut nodes = HashMap::new();
        nodes.insert(root, sentinel);
        Graph {
            id,
            nodes,
            names: HashMap::new(),
            root,
            next_node: 1,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Number of live nodes, excluding the sentinel.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Returns `true` when the id names a member that has not been erased.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes
            .get(&node)
            .is_some_and(|record| !record.erased)
    }

    /// Returns the record for the provided identifier, erased or not.
    pub fn node(&self, node: NodeId) -> &Node {
        self.nodes.get(&node).expect("node id must be valid")
    }

    pub fn get(&self, node: NodeId) -> Option<&Node> {
        self.nodes.get(&node)
    }

    /// Looks up a live node by its unique name.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Nodes that reference `node` in their argument trees, in first-use
    /// order.
    pub fn users_of(&self, node: NodeId) -> &[NodeId] {
        self.node(node).users()
    }

    /// Iterates live nodes in sequence order.
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes {
            graph: self,
            cursor: self.nodes[&self.root].next,
        }
    }

    /// Records a new node at the end of the sequence.
    ///
    /// Fails when the name is already bound, when a `call_method` or
    /// `call_module` target is not a plain name, or when an argument tree
    /// references a node that is not a live member of this graph. On success
    /// the new node is registered as a user of every node its argument trees
    /// reference.
    pub fn create_node(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        target: Target,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
        ty: Option<TensorType>,
    ) -> Result<NodeId, GraphError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateName { name });
        }
        if op.requires_name_target() && !target.is_name() {
            return Err(GraphError::TargetNotAName { op });
        }
        self.check_defs(&args, &kwargs)?;

        let id = self.allocate_node();
        let node = Node::new(self.id, id, name.clone(), op, target, ty);
        self.nodes.insert(id, node);
        self.names.insert(name, id);
        self.update_args_kwargs(id, args, kwargs);
        self.splice_before(self.root, id);
        Ok(id)
    }

    /// Records a placeholder standing for a traced function input.
    pub fn placeholder(&mut self, name: &str) -> Result<NodeId, GraphError> {
        self.create_node(
            name,
            OpKind::Placeholder,
            Target::name(name),
            Vec::new(),
            BTreeMap::new(),
            None,
        )
    }

    /// Records a call to a free callable.
    pub fn call_function(
        &mut self,
        name: &str,
        func: FuncRef,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> Result<NodeId, GraphError> {
        self.create_node(
            name,
            OpKind::CallFunction,
            Target::Callable(func),
            args,
            kwargs,
            None,
        )
    }

    /// Records a method call; by convention the receiver is the first
    /// positional argument.
    pub fn call_method(
        &mut self,
        name: &str,
        method: &str,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> Result<NodeId, GraphError> {
        self.create_node(
            name,
            OpKind::CallMethod,
            Target::name(method),
            args,
            kwargs,
            None,
        )
    }

    /// Records an invocation of the submodule at `path`.
    pub fn call_module(
        &mut self,
        name: &str,
        path: &str,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> Result<NodeId, GraphError> {
        self.create_node(
            name,
            OpKind::CallModule,
            Target::name(path),
            args,
            kwargs,
            None,
        )
    }

    /// Records an attribute fetch from the owning module hierarchy.
    pub fn get_attr(&mut self, name: &str, attr: &str) -> Result<NodeId, GraphError> {
        self.create_node(
            name,
            OpKind::GetAttr,
            Target::name(attr),
            Vec::new(),
            BTreeMap::new(),
            None,
        )
    }

    /// Records the graph output; the argument tree is the returned value.
    pub fn output(&mut self, name: &str, value: Argument) -> Result<NodeId, GraphError> {
        self.create_node(
            name,
            OpKind::Output,
            Target::name("output"),
            vec![value],
            BTreeMap::new(),
            None,
        )
    }

    /// Replaces the node's positional arguments, keeping its keyword
    /// arguments, and diff-updates the users sets of the affected defs.
    pub fn set_args(&mut self, node: NodeId, args: Vec<Argument>) -> Result<(), GraphError> {
        assert!(self.contains(node), "node id must be valid");
        let kwargs = self.nodes[&node].kwargs.clone();
        self.check_defs(&args, &kwargs)?;
        self.update_args_kwargs(node, args, kwargs);
        Ok(())
    }

    /// Replaces the node's keyword arguments, keeping its positional
    /// arguments, and diff-updates the users sets of the affected defs.
    pub fn set_kwargs(
        &mut self,
        node: NodeId,
        kwargs: BTreeMap<String, Argument>,
    ) -> Result<(), GraphError> {
        assert!(self.contains(node), "node id must be valid");
        let args = self.nodes[&node].args.clone();
        self.check_defs(&args, &kwargs)?;
        self.update_args_kwargs(node, args, kwargs);
        Ok(())
    }

    /// Moves `x` immediately before `anchor` in the node sequence.
    ///
    /// `x` is detached from wherever it currently sits first. Both nodes must
    /// belong to this graph; moving a node between graphs is a caller error.
    pub fn prepend(&mut self, anchor: NodeId, x: NodeId) {
        assert!(self.contains(anchor), "node id must be valid");
        assert!(
            self.contains(x),
            "attempting to move a node from a different graph"
        );
        debug_assert_eq!(self.nodes[&x].graph, self.id);
        self.splice_before(anchor, x);
    }

    /// Moves `x` immediately after `anchor`; equivalent to prepending onto
    /// the anchor's current successor.
    pub fn append(&mut self, anchor: NodeId, x: NodeId) {
        assert!(self.contains(anchor), "node id must be valid");
        let next = self.nodes[&anchor].next;
        self.prepend(next, x);
    }

    /// Rewrites every user of `node` to reference `replacement` instead,
    /// returning the affected users in their recorded order.
    ///
    /// The users set is snapshotted before the first rewrite: committing a
    /// user's new trees migrates it off `node` mid-loop, so iterating the
    /// live set would be unsound. Afterwards `node` must have no users left.
    pub fn replace_all_uses_with(&mut self, node: NodeId, replacement: NodeId) -> Vec<NodeId> {
        assert!(self.contains(node), "node id must be valid");
        assert!(
            self.contains(replacement),
            "replacement must be a live member of this graph"
        );
        let to_process = self.nodes[&node].users.to_vec();
        for user in &to_process {
            let (new_args, new_kwargs) = {
                let record = &self.nodes[user];
                let mut substitute = |n: NodeId| {
                    if n == node {
                        Argument::Node(replacement)
                    } else {
                        Argument::Node(n)
                    }
                };
                let new_args: Vec<Argument> = record
                    .args
                    .iter()
                    .map(|arg| arg.map_nodes(&mut substitute))
                    .collect();
                let new_kwargs: BTreeMap<String, Argument> = record
                    .kwargs
                    .iter()
                    .map(|(key, value)| (key.clone(), value.map_nodes(&mut substitute)))
                    .collect();
                (new_args, new_kwargs)
            };
            self.update_args_kwargs(*user, new_args, new_kwargs);
        }
        assert!(
            self.nodes[&node].users.is_empty(),
            "users remain after replacing all uses"
        );
        to_process
    }

    /// Removes a node that no longer has users.
    ///
    /// The node is detached from the sequence (its links collapse back to a
    /// self-loop), its argument trees are cleared through the usual update
    /// funnel so it drops out of its defs' users sets, and the tombstone is
    /// set. The record stays readable through [`Graph::get`]; the name is
    /// released.
    pub fn erase_node(&mut self, node: NodeId) {
        assert!(self.contains(node), "node id must be valid");
        assert!(node != self.root, "the sequence sentinel cannot be erased");
        assert!(
            self.nodes[&node].users.is_empty(),
            "attempting to erase a node with live uses"
        );

        let (prev, next) = {
            let record = &self.nodes[&node];
            (record.prev, record.next)
        };
        self.nodes.get_mut(&prev).expect("list link must be valid").next = next;
        self.nodes.get_mut(&next).expect("list link must be valid").prev = prev;

        self.update_args_kwargs(node, Vec::new(), BTreeMap::new());

        let record = self.nodes.get_mut(&node).expect("node id must be valid");
        record.prev = node;
        record.next = node;
        record.erased = true;
        let name = record.name.clone();
        self.names.remove(&name);
    }

    /// Single synchronization point for argument changes: installs the new
    /// trees and diff-updates the users sets of the affected defs. The two
    /// diffed sets are disjoint, so removal and insertion cannot interfere.
    fn update_args_kwargs(
        &mut self,
        node: NodeId,
        new_args: Vec<Argument>,
        new_kwargs: BTreeMap<String, Argument>,
    ) {
        let old_defs = self.nodes[&node].collect_defs();
        {
            let record = self.nodes.get_mut(&node).expect("node id must be valid");
            record.args = new_args;
            record.kwargs = new_kwargs;
        }
        let new_defs = self.nodes[&node].collect_defs();

        for def in old_defs.iter() {
            if !new_defs.contains(def) {
                self.nodes
                    .get_mut(&def)
                    .expect("def must be a graph member")
                    .users
                    .remove(node);
            }
        }
        for def in new_defs.iter() {
            if !old_defs.contains(def) {
                self.nodes
                    .get_mut(&def)
                    .expect("def must be a graph member")
                    .users
                    .insert(node);
            }
        }
    }

    fn check_defs(
        &self,
        args: &[Argument],
        kwargs: &BTreeMap<String, Argument>,
    ) -> Result<(), GraphError> {
        let mut missing = None;
        {
            let mut check = |node: NodeId| {
                if missing.is_none() && !self.contains(node) {
                    missing = Some(node);
                }
            };
            for arg in args {
                arg.for_each_node(&mut check);
            }
            for value in kwargs.values() {
                value.for_each_node(&mut check);
            }
        }
        match missing {
            Some(node) => Err(GraphError::UnknownNode { node }),
            None => Ok(()),
        }
    }

    /// Detaches `x`, then splices it immediately before `anchor`. The pointer
    /// writes happen one at a time in a fixed order so the aliased cases
    /// (singleton detach, already-adjacent move) fall out correctly.
    fn splice_before(&mut self, anchor: NodeId, x: NodeId) {
        let (x_prev, x_next) = {
            let record = &self.nodes[&x];
            (record.prev, record.next)
        };
        self.nodes.get_mut(&x_prev).expect("list link must be valid").next = x_next;
        self.nodes.get_mut(&x_next).expect("list link must be valid").prev = x_prev;

        let anchor_prev = self.nodes[&anchor].prev;
        self.nodes
            .get_mut(&anchor_prev)
            .expect("list link must be valid")
            .next = x;
        self.nodes.get_mut(&x).expect("list link must be valid").prev = anchor_prev;
        self.nodes.get_mut(&x).expect("list link must be valid").next = anchor;
        self.nodes.get_mut(&anchor).expect("list link must be valid").prev = x;
    }

    fn allocate_node(&mut self) -> NodeId {
        let node = NodeId(self.next_node);
        self.next_node += 1;
        node
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

/// Forward iterator over live nodes in sequence order.
pub struct Nodes<'a> {
    graph: &'a Graph,
    cursor: NodeId,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.cursor == self.graph.root {
            return None;
        }
        let current = self.cursor;
        self.cursor = self.graph.nodes[&current].next;
        Some(current)
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, "graph {")?;
        for node in self.nodes() {
            fmt_node(self, &self.nodes[&node], 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_node(graph: &Graph, record: &Node, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut line = format!("%{} = {}[{}]", record.name(), record.op(), record.target());
    let args = record
        .args()
        .iter()
        .map(|arg| format_argument(graph, arg))
        .collect::<Vec<_>>();
    if !args.is_empty() {
        line.push_str(&format!("({})", args.join(", ")));
    }
    if !record.kwargs().is_empty() {
        let kwargs = record
            .kwargs()
            .iter()
            .map(|(key, value)| format!("{key} = {}", format_argument(graph, value)))
            .collect::<Vec<_>>()
            .join(", ");
        line.push_str(&format!(" {{{kwargs}}}"));
    }
    if let Some(ty) = record.ty() {
        line.push_str(&format!(" -> {}", format_tensor_type(ty)));
    }
    write_line(f, indent, &line)
}

fn format_argument(graph: &Graph, arg: &Argument) -> String {
    match arg {
        Argument::None => "none".to_string(),
        Argument::Bool(value) => value.to_string(),
        Argument::Int(value) => value.to_string(),
        Argument::Float(value) => format!("{value:?}"),
        Argument::Str(value) => format!("{value:?}"),
        Argument::Dtype(dtype) => format!("{dtype:?}"),
        Argument::Tensor(literal) => format_tensor_type(&literal.ty),
        Argument::Node(node) => match graph.nodes.get(node) {
            Some(record) => format!("%{}", record.name()),
            None => format!("%{}", node.0),
        },
        Argument::Tuple(items) => {
            let inner = items
                .iter()
                .map(|item| format_argument(graph, item))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({inner})")
        }
        Argument::List(items) => {
            let inner = items
                .iter()
                .map(|item| format_argument(graph, item))
                .collect::<Vec<_>>()
                .join(", ");
            format!("[{inner}]")
        }
        Argument::Dict(entries) => {
            let inner = entries
                .iter()
                .map(|(key, value)| format!("{key}: {}", format_argument(graph, value)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{inner}}}")
        }
        Argument::Slice(slice) => format!(
            "{}:{}:{}",
            format_argument(graph, &slice.start),
            format_argument(graph, &slice.stop),
            format_argument(graph, &slice.step)
        ),
    }
}

fn format_tensor_type(ty: &TensorType) -> String {
    let dims = ty
        .dims
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("x");
    format!("tensor<{:?} x {dims}>", ty.dtype)
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}
