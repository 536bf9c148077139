//! ONNX export of the trained forward graph.
//!
//! Serializes the model to an opset-11 ONNX file with inputs `country`
//! (int64) and `amount` (float), output `fraud_probability` (float), and a
//! symbolic `batch` dimension on all three. Weights and the normalization
//! constants become graph initializers, so serving needs nothing besides
//! the `.onnx` file.
//!
//! ONNX is protobuf; the handful of messages a static graph needs
//! (ModelProto, GraphProto, NodeProto, AttributeProto, TensorProto,
//! ValueInfoProto) are encoded directly against their onnx.proto field
//! numbers rather than pulling in a protobuf compiler for a fixed,
//! write-only subset.

use std::path::Path;

use anyhow::{Context, Result};

use crate::model::{FraudModel, EMBEDDING_DIM, HIDDEN_DIM};

const IR_VERSION: u64 = 6;
const OPSET_VERSION: u64 = 11;

// TensorProto.DataType
const ELEM_FLOAT: u64 = 1;
const ELEM_INT64: u64 = 7;

// AttributeProto.AttributeType
const ATTR_INT: u64 = 2;
const ATTR_INTS: u64 = 7;

/// Serialize the trained model's forward computation graph to `path`.
pub fn export_model(model: &FraudModel, path: &Path) -> Result<()> {
    let bytes = encode_model(model)?;
    std::fs::write(path, bytes)
        .with_context(|| format!("failed to write model to {}", path.display()))?;
    Ok(())
}

pub(crate) fn encode_model(model: &FraudModel) -> Result<Vec<u8>> {
    let params = model.export_params()?;
    let stats = model.stats();
    let vocab = model.num_countries() as u64;
    let emb = EMBEDDING_DIM as u64;
    let hidden = HIDDEN_DIM as u64;

    let mut graph = ProtoBuf::default();

    // Forward pass in topological order. Gather is the embedding lookup;
    // Add(1) + Log is log1p; Sub/Div apply the baked-in stats.
    let nodes = [
        node(
            "Gather",
            "embedding_lookup",
            &["country_embedding", "country"],
            &["emb"],
            &[attr_int("axis", 0)],
        ),
        node(
            "Unsqueeze",
            "amount_column",
            &["amount"],
            &["amount_col"],
            &[attr_ints("axes", &[1])],
        ),
        node("Add", "amount_plus_one", &["amount_col", "one"], &["amount_p1"], &[]),
        node("Log", "amount_log1p", &["amount_p1"], &["amount_log"], &[]),
        node(
            "Sub",
            "amount_center",
            &["amount_log", "amount_mean"],
            &["amount_centered"],
            &[],
        ),
        node(
            "Div",
            "amount_scale",
            &["amount_centered", "amount_std"],
            &["amount_norm"],
            &[],
        ),
        node(
            "Concat",
            "concat_features",
            &["emb", "amount_norm"],
            &["features"],
            &[attr_int("axis", 1)],
        ),
        node(
            "Gemm",
            "fc1",
            &["features", "fc1_weight", "fc1_bias"],
            &["hidden"],
            &[attr_int("transB", 1)],
        ),
        node("Relu", "fc1_act", &["hidden"], &["hidden_act"], &[]),
        node(
            "Gemm",
            "fc2",
            &["hidden_act", "fc2_weight", "fc2_bias"],
            &["logits"],
            &[attr_int("transB", 1)],
        ),
        node("Sigmoid", "probability", &["logits"], &["fraud_probability"], &[]),
    ];
    for n in &nodes {
        graph.write_msg(1, n);
    }

    graph.write_str(2, "fraud_model");

    let initializers = [
        tensor_f32("country_embedding", &[vocab, emb], &params.embedding),
        tensor_f32("fc1_weight", &[hidden, emb + 1], &params.fc1_weight),
        tensor_f32("fc1_bias", &[hidden], &params.fc1_bias),
        tensor_f32("fc2_weight", &[1, hidden], &params.fc2_weight),
        tensor_f32("fc2_bias", &[1], &params.fc2_bias),
        tensor_f32("one", &[], &[1.0]),
        tensor_f32("amount_mean", &[], &[stats.mean as f32]),
        tensor_f32("amount_std", &[], &[stats.std as f32]),
    ];
    for t in &initializers {
        graph.write_msg(5, t);
    }

    graph.write_msg(11, &value_info("country", ELEM_INT64, &[Dim::Batch]));
    graph.write_msg(11, &value_info("amount", ELEM_FLOAT, &[Dim::Batch]));
    graph.write_msg(
        12,
        &value_info("fraud_probability", ELEM_FLOAT, &[Dim::Batch, Dim::Fixed(1)]),
    );

    let mut opset = ProtoBuf::default();
    opset.write_u64(2, OPSET_VERSION); // default ONNX domain

    let mut m = ProtoBuf::default();
    m.write_u64(1, IR_VERSION);
    m.write_str(2, "fraud_trainer");
    m.write_msg(7, &graph);
    m.write_msg(8, &opset);
    Ok(m.buf)
}

/// Tensor dimension in a value's declared shape.
enum Dim {
    /// Symbolic `dim_param = "batch"`.
    Batch,
    Fixed(u64),
}

fn value_info(name: &str, elem_type: u64, dims: &[Dim]) -> ProtoBuf {
    let mut shape = ProtoBuf::default();
    for d in dims {
        let mut dim = ProtoBuf::default();
        match d {
            Dim::Batch => dim.write_str(2, "batch"),
            Dim::Fixed(v) => dim.write_u64(1, *v),
        }
        shape.write_msg(1, &dim);
    }

    let mut tensor_type = ProtoBuf::default();
    tensor_type.write_u64(1, elem_type);
    tensor_type.write_msg(2, &shape);

    let mut type_proto = ProtoBuf::default();
    type_proto.write_msg(1, &tensor_type);

    let mut vi = ProtoBuf::default();
    vi.write_str(1, name);
    vi.write_msg(2, &type_proto);
    vi
}

fn tensor_f32(name: &str, dims: &[u64], data: &[f32]) -> ProtoBuf {
    let mut t = ProtoBuf::default();
    t.write_packed_u64(1, dims);
    t.write_u64(2, ELEM_FLOAT);
    t.write_str(8, name);
    let mut raw = Vec::with_capacity(data.len() * 4);
    for v in data {
        raw.extend_from_slice(&v.to_le_bytes());
    }
    t.write_bytes(9, &raw);
    t
}

fn attr_int(name: &str, value: u64) -> ProtoBuf {
    let mut a = ProtoBuf::default();
    a.write_str(1, name);
    a.write_u64(3, value);
    a.write_u64(20, ATTR_INT);
    a
}

fn attr_ints(name: &str, values: &[u64]) -> ProtoBuf {
    let mut a = ProtoBuf::default();
    a.write_str(1, name);
    a.write_packed_u64(8, values);
    a.write_u64(20, ATTR_INTS);
    a
}

fn node(
    op_type: &str,
    name: &str,
    inputs: &[&str],
    outputs: &[&str],
    attrs: &[ProtoBuf],
) -> ProtoBuf {
    let mut n = ProtoBuf::default();
    for i in inputs {
        n.write_str(1, i);
    }
    for o in outputs {
        n.write_str(2, o);
    }
    n.write_str(3, name);
    n.write_str(4, op_type);
    for a in attrs {
        n.write_msg(5, a);
    }
    n
}

/// Protobuf wire-format writer. Only the encodings ONNX needs here:
/// varint (wire type 0) and length-delimited (wire type 2), with packed
/// varints for repeated int64 fields.
#[derive(Default)]
struct ProtoBuf {
    buf: Vec<u8>,
}

impl ProtoBuf {
    fn varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.push((v as u8 & 0x7f) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    fn tag(&mut self, field: u32, wire_type: u64) {
        self.varint(u64::from(field) << 3 | wire_type);
    }

    fn write_u64(&mut self, field: u32, v: u64) {
        self.tag(field, 0);
        self.varint(v);
    }

    fn write_bytes(&mut self, field: u32, data: &[u8]) {
        self.tag(field, 2);
        self.varint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    fn write_str(&mut self, field: u32, s: &str) {
        self.write_bytes(field, s.as_bytes());
    }

    fn write_msg(&mut self, field: u32, msg: &ProtoBuf) {
        self.write_bytes(field, &msg.buf);
    }

    fn write_packed_u64(&mut self, field: u32, values: &[u64]) {
        if values.is_empty() {
            return;
        }
        let mut packed = ProtoBuf::default();
        for &v in values {
            packed.varint(v);
        }
        self.write_bytes(field, &packed.buf);
    }
}

/// Minimal wire-format reader for verifying exported artifacts in tests.
#[cfg(test)]
pub(crate) mod decode {
    /// A decoded top-level field: `(field_number, value)`.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Value {
        Varint(u64),
        Bytes(Vec<u8>),
    }

    /// Split a message into its fields. Panics on malformed input, which
    /// is what a test wants.
    pub(crate) fn fields(buf: &[u8]) -> Vec<(u32, Value)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let (key, next) = read_varint(buf, pos);
            pos = next;
            let field = (key >> 3) as u32;
            match key & 7 {
                0 => {
                    let (v, next) = read_varint(buf, pos);
                    pos = next;
                    out.push((field, Value::Varint(v)));
                }
                2 => {
                    let (len, next) = read_varint(buf, pos);
                    pos = next;
                    let end = pos + len as usize;
                    out.push((field, Value::Bytes(buf[pos..end].to_vec())));
                    pos = end;
                }
                5 => {
                    out.push((field, Value::Bytes(buf[pos..pos + 4].to_vec())));
                    pos += 4;
                }
                1 => {
                    out.push((field, Value::Bytes(buf[pos..pos + 8].to_vec())));
                    pos += 8;
                }
                w => panic!("unexpected wire type {w}"),
            }
        }
        out
    }

    /// All length-delimited values of `field` within `buf`.
    pub(crate) fn messages(buf: &[u8], field: u32) -> Vec<Vec<u8>> {
        fields(buf)
            .into_iter()
            .filter_map(|(f, v)| match (f, v) {
                (f2, Value::Bytes(b)) if f2 == field => Some(b),
                _ => None,
            })
            .collect()
    }

    /// First string value of `field` within `buf`.
    pub(crate) fn string(buf: &[u8], field: u32) -> Option<String> {
        messages(buf, field)
            .into_iter()
            .next()
            .map(|b| String::from_utf8(b).unwrap())
    }

    fn read_varint(buf: &[u8], mut pos: usize) -> (u64, usize) {
        let mut v = 0u64;
        let mut shift = 0;
        loop {
            let b = buf[pos];
            pos += 1;
            v |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return (v, pos);
            }
            shift += 7;
        }
    }
}
