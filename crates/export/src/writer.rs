//! Serialise a lowered model to the packed `.qmdl` binary format.
//!
//! # Format (.qmdl)
//!
//! ```text
//! [MAGIC: 4 bytes "QMDL"]
//! [VERSION: u32 LE]
//! [TARGET_DTYPE: u8]
//! [NUM_TENSORS: u32 LE]
//! [NUM_OPS: u32 LE]
//! [META_JSON_LEN: u32 LE]
//! [META_JSON: utf-8]
//! [TENSOR_0: name_len(u32) + name + dtype(u8) + ndims(u32) + dims(u64)*
//!            + n_q(u32) + scales(f32)* + zero_points(i32)* + quant_axis(i32)
//!            + data_len(u64) + data]
//! ...
//! [OP_0: opcode(u8) + n_in(u32) + inputs(u32)* + n_out(u32) + outputs(u32)*
//!        + options_len(u32) + options(i32)*]
//! ...
//! ```
//!
//! All integers are little-endian. `quant_axis` is -1 for per-tensor
//! parameters.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use qat_common::{QatError, QuantBackend, Result, TargetType};

use crate::graph::{LoweredModel, LoweredOp, Opcode, TensorEntry, TensorType};

pub const MAGIC: &[u8; 4] = b"QMDL";
pub const VERSION: u32 = 1;

/// Model-level metadata stored as JSON in the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub backend: QuantBackend,
    pub target: TargetType,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
}

fn target_tag(target: TargetType) -> u8 {
    match target {
        TargetType::Int8 => TensorType::Int8 as u8,
        TargetType::Uint8 => TensorType::Uint8 as u8,
    }
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_tensor<W: Write>(w: &mut W, t: &TensorEntry) -> std::io::Result<()> {
    let name = t.name.as_bytes();
    write_u32(w, name.len() as u32)?;
    w.write_all(name)?;
    w.write_all(&[t.dtype as u8])?;
    write_u32(w, t.shape.len() as u32)?;
    for &d in &t.shape {
        w.write_all(&(d as u64).to_le_bytes())?;
    }
    write_u32(w, t.scales.len() as u32)?;
    for s in &t.scales {
        w.write_all(&s.to_le_bytes())?;
    }
    for z in &t.zero_points {
        w.write_all(&z.to_le_bytes())?;
    }
    let axis = t.quant_axis.map_or(-1, |a| a as i32);
    w.write_all(&axis.to_le_bytes())?;
    w.write_all(&(t.data.len() as u64).to_le_bytes())?;
    w.write_all(&t.data)
}

fn write_op<W: Write>(w: &mut W, op: &LoweredOp) -> std::io::Result<()> {
    w.write_all(&[op.opcode as u8])?;
    write_u32(w, op.inputs.len() as u32)?;
    for &i in &op.inputs {
        write_u32(w, i)?;
    }
    write_u32(w, op.outputs.len() as u32)?;
    for &o in &op.outputs {
        write_u32(w, o)?;
    }
    write_u32(w, op.options.len() as u32)?;
    for v in &op.options {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Encode a lowered model into `.qmdl` bytes.
pub fn encode(model: &LoweredModel, meta: &ModelMeta) -> Result<Vec<u8>> {
    if model.tensors.iter().any(|t| t.scales.len() != t.zero_points.len()) {
        return Err(QatError::conversion("tensor scales and zero points differ in length"));
    }
    let mut out = Vec::new();
    out.write_all(MAGIC)?;
    write_u32(&mut out, VERSION)?;
    out.write_all(&[target_tag(meta.target)])?;
    write_u32(&mut out, model.tensors.len() as u32)?;
    write_u32(&mut out, model.ops.len() as u32)?;

    let meta_json = serde_json::to_string(meta)?;
    write_u32(&mut out, meta_json.len() as u32)?;
    out.write_all(meta_json.as_bytes())?;

    for tensor in &model.tensors {
        write_tensor(&mut out, tensor)?;
    }
    for op in &model.ops {
        write_op(&mut out, op)?;
    }
    Ok(out)
}

// ── Reading ─────────────────────────────────────────────────────────────────

/// A parsed `.qmdl` file.
#[derive(Debug, Clone, PartialEq)]
pub struct QmdlFile {
    pub version: u32,
    pub target: TensorType,
    pub meta: ModelMeta,
    pub tensors: Vec<TensorEntry>,
    pub ops: Vec<LoweredOp>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| QatError::conversion(format!("qmdl truncated at byte {}", self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    fn tensor(&mut self) -> Result<TensorEntry> {
        let name_len = self.len()?;
        let name = String::from_utf8_lossy(self.take(name_len)?).into_owned();
        let tag = self.u8()?;
        let dtype = TensorType::from_u8(tag)
            .ok_or_else(|| QatError::conversion(format!("unknown tensor dtype {tag}")))?;
        let ndims = self.len()?;
        let shape = (0..ndims)
            .map(|_| Ok(self.u64()? as usize))
            .collect::<Result<Vec<_>>>()?;
        let n_q = self.len()?;
        let scales = (0..n_q).map(|_| self.f32()).collect::<Result<Vec<_>>>()?;
        let zero_points = (0..n_q).map(|_| self.i32()).collect::<Result<Vec<_>>>()?;
        let axis = self.i32()?;
        let data_len = self.u64()? as usize;
        let data = self.take(data_len)?.to_vec();
        Ok(TensorEntry {
            name,
            dtype,
            shape,
            scales,
            zero_points,
            quant_axis: usize::try_from(axis).ok(),
            data,
        })
    }

    fn op(&mut self) -> Result<LoweredOp> {
        let code = self.u8()?;
        let opcode =
            Opcode::from_u8(code).ok_or_else(|| QatError::conversion(format!("unknown opcode {code}")))?;
        let n_in = self.len()?;
        let inputs = (0..n_in).map(|_| self.u32()).collect::<Result<Vec<_>>>()?;
        let n_out = self.len()?;
        let outputs = (0..n_out).map(|_| self.u32()).collect::<Result<Vec<_>>>()?;
        let n_opt = self.len()?;
        let options = (0..n_opt).map(|_| self.i32()).collect::<Result<Vec<_>>>()?;
        Ok(LoweredOp {
            opcode,
            inputs,
            outputs,
            options,
        })
    }
}

/// Parse `.qmdl` bytes.
pub fn decode(bytes: &[u8]) -> Result<QmdlFile> {
    let mut cur = Cursor { bytes, pos: 0 };
    if cur.take(4)? != MAGIC {
        return Err(QatError::conversion("not a qmdl file"));
    }
    let version = cur.u32()?;
    if version != VERSION {
        return Err(QatError::conversion(format!("unsupported qmdl version {version}")));
    }
    let tag = cur.u8()?;
    let target =
        TensorType::from_u8(tag).ok_or_else(|| QatError::conversion(format!("unknown target dtype {tag}")))?;
    let num_tensors = cur.len()?;
    let num_ops = cur.len()?;
    let meta_len = cur.len()?;
    let meta: ModelMeta = serde_json::from_slice(cur.take(meta_len)?)?;
    let tensors = (0..num_tensors).map(|_| cur.tensor()).collect::<Result<Vec<_>>>()?;
    let ops = (0..num_ops).map(|_| cur.op()).collect::<Result<Vec<_>>>()?;
    Ok(QmdlFile {
        version,
        target,
        meta,
        tensors,
        ops,
    })
}

/// Read and parse a `.qmdl` file.
pub fn read_qmdl(path: &Path) -> Result<QmdlFile> {
    decode(&std::fs::read(path)?)
}

// ── C array ─────────────────────────────────────────────────────────────────

/// Render bytes as a C header exposing `{symbol}[]` and `{symbol}_len`.
pub fn c_array(bytes: &[u8], symbol: &str) -> String {
    let mut out = String::new();
    out.push_str("// Generated by qatflow. Model in .qmdl format.\n");
    out.push_str("#pragma once\n\n#include <stdint.h>\n\n");
    out.push_str(&format!("static const uint8_t {symbol}[] = {{\n"));
    for chunk in bytes.chunks(12) {
        let line: Vec<String> = chunk.iter().map(|b| format!("0x{b:02x}")).collect();
        out.push_str("  ");
        out.push_str(&line.join(", "));
        out.push_str(",\n");
    }
    out.push_str("};\n");
    out.push_str(&format!("static const uint32_t {symbol}_len = {};\n", bytes.len()));
    out
}

/// C identifier derived from a file stem.
pub fn c_symbol(stem: &str) -> String {
    let mut symbol: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if symbol.is_empty() || symbol.starts_with(|c: char| c.is_ascii_digit()) {
        symbol.insert_str(0, "model_");
    }
    symbol
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LoweringGraph;
    use crate::testing::{frozen_model, mlp_config};

    fn lowered() -> (LoweredModel, ModelMeta) {
        let frozen = frozen_model(&mlp_config(), false);
        let model = LoweringGraph::from_frozen(&frozen).lower(TargetType::Int8).unwrap();
        let meta = ModelMeta {
            name: frozen.name().to_string(),
            input_shape: frozen.input_shape(),
            num_classes: frozen.num_classes(),
            backend: frozen.backend(),
            target: TargetType::Int8,
            inputs: model.inputs.clone(),
            outputs: model.outputs.clone(),
        };
        (model, meta)
    }

    #[test]
    fn header_layout() {
        let (model, meta) = lowered();
        let bytes = encode(&model, &meta).unwrap();
        assert_eq!(&bytes[..4], b"QMDL");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), VERSION);
        assert_eq!(bytes[8], TensorType::Int8 as u8);
        assert_eq!(
            u32::from_le_bytes(bytes[9..13].try_into().unwrap()) as usize,
            model.tensors.len()
        );
        assert_eq!(u32::from_le_bytes(bytes[13..17].try_into().unwrap()) as usize, model.ops.len());
    }

    #[test]
    fn decode_recovers_tables() {
        let (model, meta) = lowered();
        let file = decode(&encode(&model, &meta).unwrap()).unwrap();
        assert_eq!(file.meta, meta);
        assert_eq!(file.tensors, model.tensors);
        assert_eq!(file.ops, model.ops);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let (model, meta) = lowered();
        let bytes = encode(&model, &meta).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), qat_common::ErrorKind::Conversion);
        assert!(decode(b"NOPE").is_err());
    }

    #[test]
    fn c_array_layout() {
        let text = c_array(&[0, 1, 255], "tiny_model");
        assert!(text.contains("static const uint8_t tiny_model[] = {"));
        assert!(text.contains("0x00, 0x01, 0xff,"));
        assert!(text.contains("tiny_model_len = 3;"));
        assert_eq!(c_symbol("7-net.v2"), "model_7_net_v2");
    }
}
