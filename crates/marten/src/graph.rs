// Graph: the validated, executable form of an ONNX model
//
// The loader turns a decoded ModelProto into three tables:
//
//   nodes     - NodeId → operator record (forward fn, config, port names)
//   edges     - port name → consumers, and whether the port may be released
//   constants - port name → tensor materialized from an initializer
//
// plus the declared input/output port lists and the default-ready set (nodes
// with no variable inputs, in load order). Every structural defect is a load
// error; a Graph that exists is one the scheduler can run without lookups
// failing.
//
// LOAD STEPS:
//   1. Materialize initializers as constants (reference backend)
//   2. Declared inputs = graph inputs that are not initializers
//   3. Optionally prune nodes whose every output is dead
//   4. Build each node through the operator registry
//   5. Index producers and consumers; check for unknown/duplicate ports
//   6. Check for dangling ports and unresolvable declared outputs
//   7. Compute releasability and the default-ready set

use std::collections::{HashMap, HashSet};

use marten_core::{DType, Error, Result};

use crate::config::LoadOptions;
use crate::onnx::{onnx_to_dtype, GraphProto, ModelProto, NodeProto, TensorProto};
use crate::ops::{ConvertFn, ForwardFn, NodeContext, OpConfig};
use crate::tensor::AnyTensor;

/// Index of a node in load order.
pub type NodeId = usize;

/// One operator invocation.
#[derive(Debug)]
pub struct Node {
    /// Node name from the model; may be empty.
    pub name: String,
    pub op_type: String,
    /// Input port names; empty marks an absent optional input.
    pub inputs: Vec<String>,
    /// Output port names; empty marks an output nobody wants.
    pub outputs: Vec<String>,
    /// Inputs that come from graph inputs or other nodes (not constants,
    /// not absent). The node is ready when this many have arrived.
    pub variable_inputs: usize,
    pub(crate) config: OpConfig,
    pub(crate) forward: ForwardFn,
    pub(crate) convert: Option<ConvertFn>,
}

impl Node {
    /// The model's name for this node, or `op_type#id` when it has none.
    pub fn display_name(&self, id: NodeId) -> String {
        if self.name.is_empty() {
            format!("{}#{id}", self.op_type)
        } else {
            self.name.clone()
        }
    }
}

/// Consumers of one port.
#[derive(Debug, Clone, Default)]
pub struct Edge {
    /// One entry per consuming input slot; a node reading the port twice
    /// appears twice.
    pub consumers: Vec<NodeId>,
    /// Intermediate ports are released after their last read. Graph inputs
    /// (owned by the caller) and declared outputs (handed to the caller)
    /// are not.
    pub releasable: bool,
}

/// A loaded, validated dataflow graph.
#[derive(Debug)]
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) edges: HashMap<String, Edge>,
    pub(crate) constants: HashMap<String, AnyTensor>,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) default_ready: Vec<NodeId>,
    pub(crate) opset: i64,
}

impl Graph {
    /// Validate and build `model` with the operators in `opts.registry`.
    pub fn build(model: &ModelProto, opts: &LoadOptions) -> Result<Self> {
        let opset = model.opset_version();
        let proto = &model.graph;

        // 1. Constants
        let mut constants = HashMap::with_capacity(proto.initializers.len());
        for init in &proto.initializers {
            let tensor = tensor_from_proto(init, opts.precision)?;
            if constants.insert(init.name.clone(), tensor).is_some() {
                return Err(Error::DuplicatePort {
                    port: init.name.clone(),
                });
            }
        }

        // 2. Declared ports
        let mut inputs: Vec<String> = Vec::with_capacity(proto.inputs.len());
        for v in proto.inputs.iter().filter(|v| !constants.contains_key(&v.name)) {
            if inputs.contains(&v.name) {
                return Err(Error::DuplicatePort { port: v.name.clone() });
            }
            inputs.push(v.name.clone());
        }
        let outputs: Vec<String> = proto.outputs.iter().map(|v| v.name.clone()).collect();

        // 3. Prune
        let node_protos: Vec<&NodeProto> = if opts.prune {
            prune(proto, &outputs)
        } else {
            proto.nodes.iter().collect()
        };

        // 4. Build nodes
        let mut nodes = Vec::with_capacity(node_protos.len());
        for np in &node_protos {
            let def = opts
                .registry
                .get(&np.op_type)
                .ok_or_else(|| Error::UnknownOperator {
                    op_type: np.op_type.clone(),
                })?;
            if !def.supports(opset) {
                return Err(Error::UnsupportedOpset {
                    op_type: np.op_type.clone(),
                    version: opset,
                });
            }
            let config = (def.build)(&NodeContext::new(np, opset, &constants))?;
            nodes.push(Node {
                name: np.name.clone(),
                op_type: np.op_type.clone(),
                inputs: np.inputs.clone(),
                outputs: np.outputs.clone(),
                variable_inputs: 0,
                config,
                forward: def.forward,
                convert: def.convert,
            });
        }

        // 5. Producers and consumers
        let input_set: HashSet<&str> = inputs.iter().map(String::as_str).collect();
        let mut produced: HashSet<&str> = HashSet::new();
        for node in &nodes {
            for out in node.outputs.iter().filter(|o| !o.is_empty()) {
                let clash = input_set.contains(out.as_str()) || constants.contains_key(out);
                if clash || !produced.insert(out.as_str()) {
                    return Err(Error::DuplicatePort { port: out.clone() });
                }
            }
        }

        let mut edges: HashMap<String, Edge> = HashMap::new();
        for name in inputs.iter().map(String::as_str).chain(produced.iter().copied()) {
            edges.insert(name.to_string(), Edge::default());
        }
        let mut variable_inputs = vec![0usize; nodes.len()];
        for (id, node) in nodes.iter().enumerate() {
            for port in &node.inputs {
                if port.is_empty() || constants.contains_key(port) {
                    continue;
                }
                let edge = edges
                    .get_mut(port)
                    .ok_or_else(|| Error::UnknownPort { port: port.clone() })?;
                edge.consumers.push(id);
                variable_inputs[id] += 1;
            }
        }
        for (node, count) in nodes.iter_mut().zip(variable_inputs) {
            node.variable_inputs = count;
        }

        // 6. Dangling ports and declared outputs
        let output_set: HashSet<&str> = outputs.iter().map(String::as_str).collect();
        for node in &nodes {
            for out in node.outputs.iter().filter(|o| !o.is_empty()) {
                let unused = edges.get(out).is_none_or(|e| e.consumers.is_empty());
                if unused && !output_set.contains(out.as_str()) {
                    return Err(Error::DanglingPort { port: out.clone() });
                }
            }
        }
        for out in &outputs {
            if !edges.contains_key(out) && !constants.contains_key(out) {
                return Err(Error::UnknownPort { port: out.clone() });
            }
        }

        // 7. Releasability and readiness
        for (port, edge) in edges.iter_mut() {
            edge.releasable =
                !input_set.contains(port.as_str()) && !output_set.contains(port.as_str());
        }
        let default_ready: Vec<NodeId> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.variable_inputs == 0)
            .map(|(id, _)| id)
            .collect();

        tracing::debug!(
            graph = %proto.name,
            opset,
            nodes = nodes.len(),
            pruned = proto.nodes.len() - nodes.len(),
            constants = constants.len(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            default_ready = default_ready.len(),
            "graph loaded"
        );

        Ok(Graph {
            nodes,
            edges,
            constants,
            inputs,
            outputs,
            default_ready,
            opset,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, port: &str) -> Option<&Edge> {
        self.edges.get(port)
    }

    pub fn constants(&self) -> &HashMap<String, AnyTensor> {
        &self.constants
    }

    pub fn constant(&self, name: &str) -> Option<&AnyTensor> {
        self.constants.get(name)
    }

    /// Declared input ports, in `forward` argument order.
    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    /// Declared output ports, in `forward` result order.
    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    /// Nodes with no variable inputs, in load order.
    pub fn default_ready(&self) -> &[NodeId] {
        &self.default_ready
    }

    pub fn opset(&self) -> i64 {
        self.opset
    }
}

/// Nodes that survive dead-code removal, in file order.
///
/// A node is dead when it has at least one output and none of its outputs is
/// consumed by a live node or declared as a graph output. Removing one node
/// can kill its producers, so this runs to a fixed point.
fn prune<'a>(proto: &'a GraphProto, outputs: &[String]) -> Vec<&'a NodeProto> {
    let mut live: Vec<bool> = vec![true; proto.nodes.len()];
    loop {
        let mut wanted: HashSet<&str> = outputs.iter().map(String::as_str).collect();
        for (node, _) in proto.nodes.iter().zip(&live).filter(|(_, l)| **l) {
            wanted.extend(node.inputs.iter().map(String::as_str));
        }
        let mut changed = false;
        for (node, alive) in proto.nodes.iter().zip(live.iter_mut()) {
            let named: Vec<&String> = node.outputs.iter().filter(|o| !o.is_empty()).collect();
            if *alive && !named.is_empty() && named.iter().all(|o| !wanted.contains(o.as_str())) {
                tracing::trace!(op = %node.op_type, name = %node.name, "pruned dead node");
                *alive = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    proto
        .nodes
        .iter()
        .zip(live)
        .filter(|(_, l)| *l)
        .map(|(n, _)| n)
        .collect()
}

/// Materialize a TensorProto on the reference backend.
///
/// Float tensors are rounded through `precision`; integer tensors keep their
/// own dtype.
pub(crate) fn tensor_from_proto(proto: &TensorProto, precision: DType) -> Result<AnyTensor> {
    let malformed = |reason: String| Error::MalformedShape {
        name: proto.name.clone(),
        reason,
    };
    let count = proto
        .shape_elem_count()
        .ok_or_else(|| malformed(format!("invalid dimensions {:?}", proto.dims)))?;
    let data = proto.to_f32_vec()?;
    if data.len() != count {
        return Err(malformed(format!(
            "dims {:?} need {count} elements, data has {}",
            proto.dims,
            data.len()
        )));
    }
    let dtype = match onnx_to_dtype(proto.data_type)? {
        DType::F32 | DType::F16 if precision == DType::F16 => DType::F16,
        other => other,
    };
    let dims: Vec<usize> = proto.dims.iter().map(|&d| d as usize).collect();
    AnyTensor::from_vec(data, dims, dtype, &crate::tensor::Device::Cpu)
}
