use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};

use crate::node::NodeId;

/// Kind of operation recorded on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Traced function input; the target names the parameter it stands for.
    Placeholder,
    /// Method invocation on the first positional argument.
    CallMethod,
    /// Invocation of a named submodule.
    CallModule,
    /// Invocation of a free callable.
    CallFunction,
    /// Attribute fetch from the owning module hierarchy.
    GetAttr,
    /// Graph result; the first positional argument is the returned value.
    Output,
    /// Sequence sentinel owned by the graph.
    Root,
}

impl OpKind {
    /// Returns `true` when the kind only accepts a plain-name target.
    pub fn requires_name_target(self) -> bool {
        matches!(self, OpKind::CallMethod | OpKind::CallModule)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Placeholder => "placeholder",
            OpKind::CallMethod => "call_method",
            OpKind::CallModule => "call_module",
            OpKind::CallFunction => "call_function",
            OpKind::GetAttr => "get_attr",
            OpKind::Output => "output",
            OpKind::Root => "root",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a callable by its qualified path (e.g. `ops.add`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncRef(Arc<str>);

impl FuncRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(Arc::<str>::from(path.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for FuncRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FuncRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let path = String::deserialize(deserializer)?;
        Ok(FuncRef::new(path))
    }
}

/// Invocation target attached to a node.
///
/// `call_method` and `call_module` nodes only accept the [`Target::Name`]
/// form; the owning graph rejects anything else at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// Callable reference resolved through the runtime registry.
    Callable(FuncRef),
    /// Method, submodule, or attribute name resolved at interpretation time.
    Name(String),
}

impl Target {
    pub fn callable(path: impl Into<String>) -> Self {
        Target::Callable(FuncRef::new(path))
    }

    pub fn name(name: impl Into<String>) -> Self {
        Target::Name(name.into())
    }

    pub fn is_name(&self) -> bool {
        matches!(self, Target::Name(_))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Callable(func) => fmt::Display::fmt(func, f),
            Target::Name(name) => f.write_str(name),
        }
    }
}

/// Scalar element types carried by dtype tags and tensor literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    /// Returns `true` when the dtype is any signed or unsigned integer.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::Si8
                | DType::Ui8
                | DType::Si16
                | DType::Ui16
                | DType::Si32
                | DType::Ui32
                | DType::Si64
                | DType::Ui64
        )
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::Bf16 | DType::F16 | DType::F32 | DType::F64)
    }

    /// Returns the storage size in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::Si8 | DType::Ui8 => 1,
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => 2,
            DType::Si32 | DType::Ui32 | DType::F32 => 4,
            DType::Si64 | DType::Ui64 | DType::F64 => 8,
        }
    }
}

/// Tensor metadata coupling dtype and static shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl TensorType {
    pub fn new(dtype: DType, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            dims: dims.into(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the element count unless it overflows.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(*dim)?;
        }
        Some(count)
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

/// Dense tensor constant embedded directly in an argument tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorLiteral {
    pub ty: TensorType,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(ty: TensorType, bytes: Arc<[u8]>) -> Self {
        Self { ty, bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("ty", &self.ty)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Repr {
            ty: TensorType,
            bytes: Vec<u8>,
        }
        let repr = Repr::deserialize(deserializer)?;
        Ok(TensorLiteral {
            ty: repr.ty,
            bytes: Arc::from(repr.bytes),
        })
    }
}

/// Recursively structured value attached to a node invocation.
///
/// The node leaves reachable in a node's argument trees are exactly that
/// node's defs; the owning graph keeps the reverse edges in sync whenever a
/// tree is replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Dtype(DType),
    Tensor(TensorLiteral),
    Node(NodeId),
    Tuple(Vec<Argument>),
    List(Vec<Argument>),
    Dict(BTreeMap<String, Argument>),
    Slice(Box<SliceArg>),
}

/// Slice triple; each bound may itself be a full argument tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceArg {
    pub start: Argument,
    pub stop: Argument,
    pub step: Argument,
}

impl Argument {
    pub fn slice(start: Argument, stop: Argument, step: Argument) -> Self {
        Argument::Slice(Box::new(SliceArg { start, stop, step }))
    }

    /// Rebuilds the tree with `f` applied to every node leaf.
    ///
    /// Container kinds survive the rebuild (a tuple stays a tuple, a list a
    /// list), and traversal order is fixed: positional for sequences, key
    /// order for mappings, start/stop/step for slices. `f` may return any
    /// argument, not just another node reference.
    pub fn map_nodes(&self, f: &mut dyn FnMut(NodeId) -> Argument) -> Argument {
        match self {
            Argument::Tuple(items) => {
                Argument::Tuple(items.iter().map(|item| item.map_nodes(f)).collect())
            }
            Argument::List(items) => {
                Argument::List(items.iter().map(|item| item.map_nodes(f)).collect())
            }
            Argument::Dict(entries) => Argument::Dict(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.map_nodes(f)))
                    .collect(),
            ),
            Argument::Slice(slice) => Argument::Slice(Box::new(SliceArg {
                start: slice.start.map_nodes(f),
                stop: slice.stop.map_nodes(f),
                step: slice.step.map_nodes(f),
            })),
            Argument::Node(node) => f(*node),
            other => other.clone(),
        }
    }

    /// Visits every node leaf in traversal order without rebuilding the tree.
    pub fn for_each_node(&self, f: &mut dyn FnMut(NodeId)) {
        match self {
            Argument::Tuple(items) | Argument::List(items) => {
                for item in items {
                    item.for_each_node(f);
                }
            }
            Argument::Dict(entries) => {
                for value in entries.values() {
                    value.for_each_node(f);
                }
            }
            Argument::Slice(slice) => {
                slice.start.for_each_node(f);
                slice.stop.for_each_node(f);
                slice.step.for_each_node(f);
            }
            Argument::Node(node) => f(*node),
            _ => {}
        }
    }
}

impl From<NodeId> for Argument {
    fn from(node: NodeId) -> Self {
        Argument::Node(node)
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Argument::Bool(value)
    }
}

impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Argument::Int(value)
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Argument::Float(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Str(value.to_string())
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Argument::Str(value)
    }
}
