use std::collections::BTreeMap;
use std::{
    env, fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use trace_ir::{
    Argument, DType, FuncRef, Graph, GraphDoc, GraphDocError, NodeDoc, NodeId, OpKind, Target,
    TensorType, DOC_VERSION,
};

fn sample_graph() -> Graph {
    let mut graph = Graph::new();
    let x = graph.placeholder("x").expect("placeholder");
    let add = graph
        .call_function(
            "add",
            FuncRef::new("ops.add"),
            vec![Argument::Node(x), Argument::Node(x)],
            BTreeMap::new(),
        )
        .expect("call_function");
    graph.output("out", Argument::Node(add)).expect("output");
    graph
}

fn unique_path(ext: &str) -> PathBuf {
    let mut path = env::temp_dir();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    path.push(format!("trace_ir_graph_{timestamp}.{ext}"));
    path
}

#[test]
fn display_renders_nodes_in_sequence_order() {
    let graph = sample_graph();
    let rendered = format!("{graph}");
    assert!(
        rendered.contains("graph {"),
        "rendered graph missing header:\n{rendered}"
    );
    assert!(
        rendered.contains("%x = placeholder[x]"),
        "rendered graph missing placeholder:\n{rendered}"
    );
    assert!(
        rendered.contains("%add = call_function[ops.add](%x, %x)"),
        "rendered graph missing call:\n{rendered}"
    );
    assert!(
        rendered.contains("%out = output[output](%add)"),
        "rendered graph missing output:\n{rendered}"
    );
}

#[test]
fn display_renders_type_annotations() {
    let mut graph = Graph::new();
    graph
        .create_node(
            "x",
            OpKind::Placeholder,
            Target::name("x"),
            Vec::new(),
            BTreeMap::new(),
            Some(TensorType::new(DType::F32, [2, 2])),
        )
        .expect("placeholder with annotation");

    let rendered = format!("{graph}");
    assert!(
        rendered.contains("%x = placeholder[x] -> tensor<F32 x 2x2>"),
        "rendered graph missing annotation:\n{rendered}"
    );
}

#[test]
fn json_roundtrip_preserves_structure_and_edges() {
    let graph = sample_graph();
    let json = graph.to_json_string().expect("json serialization");
    let parsed = Graph::from_json_str(&json).expect("json deserialization");

    assert_eq!(parsed.to_doc(), graph.to_doc());

    let x = parsed.find("x").expect("placeholder survives");
    let add = parsed.find("add").expect("call survives");
    assert_eq!(parsed.users_of(x), &[add], "reverse edges are rebuilt");
}

#[test]
fn bincode_roundtrip_preserves_structure() {
    let graph = sample_graph();
    let bytes = graph.to_bincode_bytes().expect("bincode serialization");
    let parsed = Graph::from_bincode_slice(&bytes).expect("bincode deserialization");
    assert_eq!(parsed.to_doc(), graph.to_doc());
}

#[test]
fn json_missing_doc_version_defaults() {
    let graph = sample_graph();
    let mut value = serde_json::to_value(graph.to_doc()).expect("serialize to json value");
    value
        .as_object_mut()
        .expect("json object")
        .remove("doc_version");
    let json = serde_json::to_string_pretty(&value).expect("encode json");
    let parsed = Graph::from_json_str(&json).expect("parsed without doc version");
    assert_eq!(parsed.to_doc().doc_version, DOC_VERSION);
}

#[test]
fn json_doc_version_mismatch_errors() {
    let graph = sample_graph();
    let mut value = serde_json::to_value(graph.to_doc()).expect("serialize to json value");
    value["doc_version"] = serde_json::Value::String("trir.v999".to_string());
    let json = serde_json::to_string_pretty(&value).expect("encode json");
    let err = Graph::from_json_str(&json).expect_err("expected doc version mismatch");
    match err {
        GraphDocError::DocVersionMismatch { found, expected } => {
            assert_eq!(found, "trir.v999");
            assert_eq!(expected, DOC_VERSION);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn use_before_def_documents_are_rejected() {
    let doc = GraphDoc {
        doc_version: DOC_VERSION.to_string(),
        nodes: vec![NodeDoc {
            id: NodeId(1),
            name: "f".to_string(),
            op: OpKind::CallFunction,
            target: Target::callable("ops.neg"),
            args: vec![Argument::Node(NodeId(2))],
            kwargs: BTreeMap::new(),
            ty: None,
        }],
    };

    let err = Graph::from_doc(&doc).expect_err("forward reference should error");
    match err {
        GraphDocError::MissingNodeMapping { node } => assert_eq!(node, NodeId(2)),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn duplicate_names_in_documents_are_rejected() {
    let entry = NodeDoc {
        id: NodeId(1),
        name: "x".to_string(),
        op: OpKind::Placeholder,
        target: Target::name("x"),
        args: Vec::new(),
        kwargs: BTreeMap::new(),
        ty: None,
    };
    let mut second = entry.clone();
    second.id = NodeId(2);
    let doc = GraphDoc {
        doc_version: DOC_VERSION.to_string(),
        nodes: vec![entry, second],
    };

    let err = Graph::from_doc(&doc).expect_err("duplicate name should error");
    assert!(
        matches!(err, GraphDocError::Construction(_)),
        "unexpected error: {err:?}"
    );
}

#[test]
fn file_roundtrip_json_and_bincode() {
    let graph = sample_graph();
    let json_path = unique_path("json");
    let bin_path = unique_path("bin");

    graph
        .save_json(&json_path)
        .expect("save json to disk succeeds");
    graph
        .save_bincode(&bin_path)
        .expect("save bincode to disk succeeds");

    let from_json = Graph::load_json(&json_path).expect("load json graph");
    let from_bincode = Graph::load_bincode(&bin_path).expect("load bincode graph");

    assert_eq!(from_json.to_doc(), graph.to_doc());
    assert_eq!(from_bincode.to_doc(), graph.to_doc());

    let _ = fs::remove_file(json_path);
    let _ = fs::remove_file(bin_path);
}

#[test]
fn type_annotations_roundtrip() {
    let mut graph = Graph::new();
    graph
        .create_node(
            "x",
            OpKind::Placeholder,
            Target::name("x"),
            Vec::new(),
            BTreeMap::new(),
            Some(TensorType::new(DType::F32, [4])),
        )
        .expect("placeholder with annotation");

    let json = graph.to_json_string().expect("json serialization");
    let parsed = Graph::from_json_str(&json).expect("json deserialization");
    let x = parsed.find("x").expect("placeholder survives");
    assert_eq!(parsed.node(x).ty(), Some(&TensorType::new(DType::F32, [4])));
}
