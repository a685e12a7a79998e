pub mod arg;
pub mod doc;
pub mod graph;
pub mod node;

pub use arg::{Argument, DType, FuncRef, OpKind, SliceArg, Target, TensorLiteral, TensorType};
pub use doc::{GraphDoc, GraphDocError, GraphIoError, NodeDoc, DOC_VERSION};
pub use graph::{Graph, GraphError, GraphId};
pub use node::{Node, NodeId, NodeSet};
