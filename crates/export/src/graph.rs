//! Lowering graph: a frozen model as a petgraph DAG whose edges are
//! activation tensors, plus the rewrite passes and lowering rules.
//!
//! Passes run in this order: [`LoweringGraph::fuse_quant_dequant`],
//! [`LoweringGraph::rewrite_quantizable`],
//! [`LoweringGraph::micro_runtime_rewrite`], then [`LoweringGraph::lower`].

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use qat_common::{QatError, Result, TargetType};
use qat_core::frozen::gelu;
use qat_core::{ConvGeometry, FrozenModel, FrozenOp, QuantParams, QuantizedWeights, Requant};

// ── Nodes and edges ─────────────────────────────────────────────────────────

/// Numeric domain of an activation tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    Float,
    Quant(QuantParams),
}

/// Edge weight: the tensor flowing between two nodes (batch of one).
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub shape: Vec<usize>,
    pub domain: Domain,
}

#[derive(Debug, Clone)]
pub enum Node {
    Input,
    Output,
    Quantize {
        params: QuantParams,
    },
    Dequantize {
        params: QuantParams,
    },
    Conv2d {
        weights: QuantizedWeights,
        bias: Vec<i32>,
        geometry: ConvGeometry,
        requant: Requant,
        fused_relu: bool,
    },
    FullyConnected {
        weights: QuantizedWeights,
        bias: Vec<i32>,
        requant: Requant,
        fused_relu: bool,
    },
    Relu,
    Reshape,
    Gelu,
    /// 256-entry int8 → int8 table indexed by `q + 128`.
    Lut {
        table: Vec<i8>,
    },
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Quantize { .. } => "quantize",
            Self::Dequantize { .. } => "dequantize",
            Self::Conv2d { .. } => "conv2d",
            Self::FullyConnected { .. } => "fully_connected",
            Self::Relu => "relu",
            Self::Reshape => "reshape",
            Self::Gelu => "gelu",
            Self::Lut { .. } => "lut",
        }
    }

    /// Elementwise float function, for ops that compute on float tensors.
    fn float_fn(&self) -> Option<fn(f32) -> f32> {
        match self {
            Self::Gelu => Some(gelu),
            _ => None,
        }
    }
}

// ── Lowered form ────────────────────────────────────────────────────────────

/// Element type of a serialised tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TensorType {
    Float32 = 0,
    Int8 = 1,
    Uint8 = 2,
    Int32 = 3,
}

impl TensorType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Float32),
            1 => Some(Self::Int8),
            2 => Some(Self::Uint8),
            3 => Some(Self::Int32),
            _ => None,
        }
    }

    fn quantized(target: TargetType) -> Self {
        match target {
            TargetType::Int8 => Self::Int8,
            TargetType::Uint8 => Self::Uint8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Quantize = 0,
    Dequantize = 1,
    Conv2d = 2,
    FullyConnected = 3,
    Relu = 4,
    Reshape = 5,
    Lut = 6,
}

impl Opcode {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Quantize,
            1 => Self::Dequantize,
            2 => Self::Conv2d,
            3 => Self::FullyConnected,
            4 => Self::Relu,
            5 => Self::Reshape,
            6 => Self::Lut,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Quantize => "QUANTIZE",
            Self::Dequantize => "DEQUANTIZE",
            Self::Conv2d => "CONV_2D",
            Self::FullyConnected => "FULLY_CONNECTED",
            Self::Relu => "RELU",
            Self::Reshape => "RESHAPE",
            Self::Lut => "LUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: TensorType,
    pub shape: Vec<usize>,
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
    pub quant_axis: Option<usize>,
    /// Little-endian payload; empty for activations.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredOp {
    pub opcode: Opcode,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub options: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredModel {
    pub tensors: Vec<TensorEntry>,
    pub ops: Vec<LoweredOp>,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
}

fn encode_q(q: i8, target: TargetType) -> u8 {
    match target {
        TargetType::Int8 => q as u8,
        TargetType::Uint8 => (q as i16 + 128) as u8,
    }
}

fn activation_entry(name: String, act: &Activation, target: TargetType) -> TensorEntry {
    let (dtype, scales, zero_points) = match &act.domain {
        Domain::Float => (TensorType::Float32, Vec::new(), Vec::new()),
        Domain::Quant(p) => (
            TensorType::quantized(target),
            p.scales.clone(),
            p.zero_points.iter().map(|z| z + target.offset()).collect(),
        ),
    };
    TensorEntry {
        name,
        dtype,
        shape: act.shape.clone(),
        scales,
        zero_points,
        quant_axis: None,
        data: Vec::new(),
    }
}

fn weights_entry(name: String, w: &QuantizedWeights, target: TargetType) -> Result<TensorEntry> {
    if w.params.is_per_channel() && target == TargetType::Uint8 {
        return Err(QatError::conversion(format!(
            "{name}: per-channel weights cannot be exported as uint8"
        )));
    }
    Ok(TensorEntry {
        name,
        dtype: TensorType::quantized(target),
        shape: w.shape.clone(),
        scales: w.params.scales.clone(),
        zero_points: w.params.zero_points.iter().map(|z| z + target.offset()).collect(),
        quant_axis: w.params.axis,
        data: w.data.iter().map(|&q| encode_q(q, target)).collect(),
    })
}

fn bias_entry(name: String, bias: &[i32], w: &QuantizedWeights, input_scale: f32) -> TensorEntry {
    let scales: Vec<f32> = w.params.scales.iter().map(|s| s * input_scale).collect();
    TensorEntry {
        name,
        dtype: TensorType::Int32,
        shape: vec![bias.len()],
        zero_points: vec![0; scales.len()],
        quant_axis: w.params.axis,
        scales,
        data: bias.iter().flat_map(|b| b.to_le_bytes()).collect(),
    }
}

fn requant_options(requant: &Requant, fused_relu: bool, target: TargetType) -> Vec<i32> {
    let mut options = vec![
        fused_relu as i32,
        requant.act_min + target.offset(),
        requant.act_max + target.offset(),
    ];
    for m in &requant.multipliers {
        options.push(m.multiplier);
        options.push(m.shift);
    }
    options
}

// ── Graph ───────────────────────────────────────────────────────────────────

pub struct LoweringGraph {
    graph: StableDiGraph<Node, Activation>,
}

impl LoweringGraph {
    /// Chain graph `input → ops… → output` for a frozen model.
    pub fn from_frozen(model: &FrozenModel) -> Self {
        let [c, h, w] = model.input_shape();
        let mut graph = StableDiGraph::new();
        let mut prev = graph.add_node(Node::Input);
        let mut act = Activation {
            shape: vec![1, c, h, w],
            domain: Domain::Float,
        };
        for op in model.ops() {
            let (node, next) = match op {
                FrozenOp::Quantize { params } => (
                    Node::Quantize {
                        params: params.clone(),
                    },
                    Activation {
                        shape: act.shape.clone(),
                        domain: Domain::Quant(params.clone()),
                    },
                ),
                FrozenOp::Dequantize { params } => (
                    Node::Dequantize {
                        params: params.clone(),
                    },
                    Activation {
                        shape: act.shape.clone(),
                        domain: Domain::Float,
                    },
                ),
                FrozenOp::QConv2d {
                    weights,
                    bias,
                    geometry,
                    output,
                    requant,
                    fused_relu,
                    ..
                } => (
                    Node::Conv2d {
                        weights: weights.clone(),
                        bias: bias.clone(),
                        geometry: *geometry,
                        requant: requant.clone(),
                        fused_relu: *fused_relu,
                    },
                    Activation {
                        shape: vec![1, geometry.out_channels, geometry.out_h(), geometry.out_w()],
                        domain: Domain::Quant(output.clone()),
                    },
                ),
                FrozenOp::QLinear {
                    weights,
                    bias,
                    output,
                    requant,
                    fused_relu,
                    ..
                } => (
                    Node::FullyConnected {
                        weights: weights.clone(),
                        bias: bias.clone(),
                        requant: requant.clone(),
                        fused_relu: *fused_relu,
                    },
                    Activation {
                        shape: vec![1, weights.shape[0]],
                        domain: Domain::Quant(output.clone()),
                    },
                ),
                FrozenOp::QRelu { .. } => (Node::Relu, act.clone()),
                FrozenOp::Flatten => (
                    Node::Reshape,
                    Activation {
                        shape: vec![1, act.shape[1..].iter().product()],
                        domain: act.domain.clone(),
                    },
                ),
                FrozenOp::Gelu => (Node::Gelu, act.clone()),
            };
            let idx = graph.add_node(node);
            graph.add_edge(prev, idx, act);
            prev = idx;
            act = next;
        }
        let output = graph.add_node(Node::Output);
        graph.add_edge(prev, output, act);
        Self { graph }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Node names in topological order.
    pub fn node_names(&self) -> Vec<&'static str> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n].name()).collect())
            .unwrap_or_default()
    }

    fn nodes_where(&self, pred: impl Fn(&Node) -> bool) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&n| pred(&self.graph[n]))
            .collect()
    }

    fn single_successor(&self, n: NodeIndex) -> Option<NodeIndex> {
        let mut it = self.graph.neighbors_directed(n, Direction::Outgoing);
        let first = it.next()?;
        it.next().is_none().then_some(first)
    }

    fn in_edge(&self, n: NodeIndex) -> Option<(NodeIndex, Activation)> {
        let e = self.graph.edges_directed(n, Direction::Incoming).next()?;
        Some((e.source(), e.weight().clone()))
    }

    fn out_edge(&self, n: NodeIndex) -> Option<(NodeIndex, Activation)> {
        let e = self.graph.edges_directed(n, Direction::Outgoing).next()?;
        Some((e.target(), e.weight().clone()))
    }

    /// Replace the path `first … last` by a single edge (or node) between
    /// the predecessor of `first` and the successor of `last`.
    fn splice(
        &mut self,
        remove: &[NodeIndex],
        pred: (NodeIndex, Activation),
        succ: (NodeIndex, Activation),
        replacement: Option<Node>,
    ) {
        for &n in remove {
            self.graph.remove_node(n);
        }
        match replacement {
            Some(node) => {
                let idx = self.graph.add_node(node);
                self.graph.add_edge(pred.0, idx, pred.1);
                self.graph.add_edge(idx, succ.0, succ.1);
            }
            None => {
                self.graph.add_edge(pred.0, succ.0, succ.1);
            }
        }
    }

    /// Collapse `QUANTIZE → DEQUANTIZE` pairs with identical parameters.
    pub fn fuse_quant_dequant(&mut self) -> usize {
        let mut fused = 0;
        for q in self.nodes_where(|n| matches!(n, Node::Quantize { .. })) {
            if !self.graph.contains_node(q) {
                continue;
            }
            let Some(d) = self.single_successor(q) else {
                continue;
            };
            let same = match (&self.graph[q], &self.graph[d]) {
                (Node::Quantize { params: a }, Node::Dequantize { params: b }) => a == b,
                _ => false,
            };
            if !same {
                continue;
            }
            let (Some(pred), Some(succ)) = (self.in_edge(q), self.out_edge(d)) else {
                continue;
            };
            self.splice(&[q, d], pred, succ, None);
            fused += 1;
        }
        if fused > 0 {
            tracing::debug!(fused, "Fused quantize/dequantize pairs");
        }
        fused
    }

    /// Turn `DEQUANTIZE → elementwise float ops → QUANTIZE` chains into one
    /// integer lookup-table op.
    pub fn rewrite_quantizable(&mut self) -> usize {
        let mut rewritten = 0;
        for d in self.nodes_where(|n| matches!(n, Node::Dequantize { .. })) {
            if !self.graph.contains_node(d) {
                continue;
            }
            let Node::Dequantize { params: input } = &self.graph[d] else {
                continue;
            };
            let input = input.clone();

            let mut chain = Vec::new();
            let mut cur = d;
            let closing = loop {
                let Some(next) = self.single_successor(cur) else {
                    break None;
                };
                match &self.graph[next] {
                    Node::Quantize { params } => break Some((next, params.clone())),
                    node if node.float_fn().is_some() => {
                        chain.push(next);
                        cur = next;
                    }
                    _ => break None,
                }
            };
            let Some((q, output)) = closing else {
                continue;
            };
            if chain.is_empty() {
                continue;
            }
            let fns: Vec<fn(f32) -> f32> = chain.iter().filter_map(|&n| self.graph[n].float_fn()).collect();
            let table = (-128..=127)
                .map(|v| {
                    let x = fns.iter().fold(input.dequantize_value(v, 0), |x, f| f(x));
                    output.quantize_value(x, 0) as i8
                })
                .collect();

            let (Some(pred), Some(succ)) = (self.in_edge(d), self.out_edge(q)) else {
                continue;
            };
            let mut remove = vec![d];
            remove.extend(&chain);
            remove.push(q);
            self.splice(&remove, pred, succ, Some(Node::Lut { table }));
            rewritten += 1;
        }
        if rewritten > 0 {
            tracing::debug!(rewritten, "Rewrote float chains to lookup tables");
        }
        rewritten
    }

    /// Drop `RESHAPE` directly feeding `FULLY_CONNECTED` (the kernel
    /// flattens its input) and reject any remaining float compute op.
    pub fn micro_runtime_rewrite(&mut self) -> Result<usize> {
        let mut dropped = 0;
        for r in self.nodes_where(|n| matches!(n, Node::Reshape)) {
            let Some(next) = self.single_successor(r) else {
                continue;
            };
            if !matches!(self.graph[next], Node::FullyConnected { .. }) {
                continue;
            }
            let (Some(pred), Some(succ)) = (self.in_edge(r), self.out_edge(r)) else {
                continue;
            };
            // keep the un-flattened input tensor on the new edge
            let succ = (succ.0, pred.1.clone());
            self.splice(&[r], pred, succ, None);
            dropped += 1;
        }
        if let Some(n) = self
            .graph
            .node_indices()
            .find(|&n| self.graph[n].float_fn().is_some())
        {
            return Err(QatError::conversion(format!(
                "micro runtime cannot execute float op {}",
                self.graph[n].name()
            )));
        }
        Ok(dropped)
    }

    /// Apply lowering rules, producing the serialisable tensor and op tables.
    pub fn lower(&self, target: TargetType) -> Result<LoweredModel> {
        let order = toposort(&self.graph, None)
            .map_err(|_| QatError::conversion("lowering graph contains a cycle"))?;

        let mut tensors = Vec::new();
        let mut edge_tensor: HashMap<EdgeIndex, u32> = HashMap::new();
        for &n in &order {
            for e in self.graph.edges_directed(n, Direction::Outgoing) {
                let id = tensors.len() as u32;
                tensors.push(activation_entry(format!("act{id}"), e.weight(), target));
                edge_tensor.insert(e.id(), id);
            }
        }
        let lookup = |e: EdgeIndex| {
            edge_tensor
                .get(&e)
                .copied()
                .ok_or_else(|| QatError::conversion("edge without a tensor"))
        };

        let mut model = LoweredModel {
            tensors,
            ops: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        for (position, &n) in order.iter().enumerate() {
            let ins = self
                .graph
                .edges_directed(n, Direction::Incoming)
                .map(|e| lookup(e.id()))
                .collect::<Result<Vec<u32>>>()?;
            let outs = self
                .graph
                .edges_directed(n, Direction::Outgoing)
                .map(|e| lookup(e.id()))
                .collect::<Result<Vec<u32>>>()?;
            let input_scale = self
                .in_edge(n)
                .and_then(|(_, act)| match act.domain {
                    Domain::Quant(p) => Some(p.scale()),
                    Domain::Float => None,
                });

            let mut push_const = |entry: TensorEntry| {
                model.tensors.push(entry);
                (model.tensors.len() - 1) as u32
            };
            let (opcode, extra, options) = match &self.graph[n] {
                Node::Input => {
                    model.inputs.extend(outs);
                    continue;
                }
                Node::Output => {
                    model.outputs.extend(ins);
                    continue;
                }
                Node::Quantize { .. } => (Opcode::Quantize, Vec::new(), Vec::new()),
                Node::Dequantize { .. } => (Opcode::Dequantize, Vec::new(), Vec::new()),
                Node::Conv2d {
                    weights,
                    bias,
                    geometry,
                    requant,
                    fused_relu,
                } => {
                    let scale = input_scale
                        .ok_or_else(|| QatError::conversion("conv2d input is not quantized"))?;
                    let w = push_const(weights_entry(format!("op{position}.weight"), weights, target)?);
                    let b = push_const(bias_entry(format!("op{position}.bias"), bias, weights, scale));
                    let mut options = vec![geometry.stride as i32, geometry.padding as i32];
                    options.extend(requant_options(requant, *fused_relu, target));
                    (Opcode::Conv2d, vec![w, b], options)
                }
                Node::FullyConnected {
                    weights,
                    bias,
                    requant,
                    fused_relu,
                } => {
                    let scale = input_scale
                        .ok_or_else(|| QatError::conversion("fully_connected input is not quantized"))?;
                    let w = push_const(weights_entry(format!("op{position}.weight"), weights, target)?);
                    let b = push_const(bias_entry(format!("op{position}.bias"), bias, weights, scale));
                    (Opcode::FullyConnected, vec![w, b], requant_options(requant, *fused_relu, target))
                }
                Node::Relu => (Opcode::Relu, Vec::new(), Vec::new()),
                Node::Reshape => {
                    let shape = self
                        .out_edge(n)
                        .map(|(_, act)| act.shape.iter().map(|&d| d as i32).collect())
                        .unwrap_or_default();
                    (Opcode::Reshape, Vec::new(), shape)
                }
                Node::Lut { table } => {
                    let (scales, zero_points) = match self.out_edge(n).map(|(_, a)| a.domain) {
                        Some(Domain::Quant(p)) => (
                            p.scales.clone(),
                            p.zero_points.iter().map(|z| z + target.offset()).collect(),
                        ),
                        _ => (Vec::new(), Vec::new()),
                    };
                    let t = push_const(TensorEntry {
                        name: format!("op{position}.table"),
                        dtype: TensorType::quantized(target),
                        shape: vec![table.len()],
                        scales,
                        zero_points,
                        quant_axis: None,
                        data: table.iter().map(|&q| encode_q(q, target)).collect(),
                    });
                    (Opcode::Lut, vec![t], Vec::new())
                }
                Node::Gelu => return Err(QatError::conversion("no lowering rule for float op gelu")),
            };
            let mut inputs = ins;
            inputs.extend(extra);
            model.ops.push(LoweredOp {
                opcode,
                inputs,
                outputs: outs,
                options,
            });
        }
        Ok(model)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
