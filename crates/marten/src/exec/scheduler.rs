// Scheduler: one forward pass over a Graph
//
// Pass-local state only; the Graph (and its constant table) is read-only.
//
//   ready   - FIFO of nodes whose variable inputs have all arrived
//   pending - per-node count of variable inputs still missing
//   slots   - port name → live value + how many consumers have read it
//
// Graph inputs enter the slot table borrowed from the caller, kernel results
// enter owned. When a releasable port's read count reaches its consumer
// count it is taken out of the table and handed back to its backend after
// the reading node completes.

use std::collections::{HashMap, VecDeque};

use marten_core::{Error, Result, Shape};

use crate::graph::{Graph, NodeId};
use crate::ops::Inputs;
use crate::tensor::AnyTensor;

/// What happened during one pass, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardTrace {
    /// Node ids in execution order.
    pub executed: Vec<NodeId>,
    /// Intermediate ports in release order.
    pub released: Vec<String>,
}

enum Value<'a> {
    /// Caller-owned graph input.
    Borrowed(&'a AnyTensor),
    /// Produced during this pass.
    Owned(AnyTensor),
}

impl Value<'_> {
    fn get(&self) -> &AnyTensor {
        match self {
            Value::Borrowed(t) => t,
            Value::Owned(t) => t,
        }
    }
}

struct Slot<'a> {
    value: Value<'a>,
    used: usize,
}

struct Pass<'g> {
    graph: &'g Graph,
    ready: VecDeque<NodeId>,
    pending: Vec<usize>,
    slots: HashMap<&'g str, Slot<'g>>,
    trace: Option<ForwardTrace>,
}

impl<'g> Pass<'g> {
    fn new(graph: &'g Graph, traced: bool) -> Self {
        Pass {
            graph,
            ready: graph.default_ready.iter().copied().collect(),
            pending: graph.nodes.iter().map(|n| n.variable_inputs).collect(),
            slots: HashMap::new(),
            trace: traced.then(ForwardTrace::default),
        }
    }

    /// Record `value` under `port` and wake the consumers it completes.
    fn publish(&mut self, port: &'g str, value: Value<'g>) {
        self.slots.insert(port, Slot { value, used: 0 });
        let Some(edge) = self.graph.edges.get(port) else {
            return;
        };
        for &consumer in &edge.consumers {
            self.pending[consumer] -= 1;
            if self.pending[consumer] == 0 {
                tracing::trace!(node = consumer, port, "node ready");
                self.ready.push_back(consumer);
            }
        }
    }

    /// Count one read of every variable input of `id`; returns the ports
    /// whose last read this was and which may be released.
    fn mark_reads(&mut self, id: NodeId) -> Result<Vec<&'g str>> {
        let graph = self.graph;
        let node = &graph.nodes[id];
        let mut done = Vec::new();
        for port in &node.inputs {
            if port.is_empty() || graph.constants.contains_key(port) {
                continue;
            }
            let slot = self
                .slots
                .get_mut(port.as_str())
                .ok_or_else(|| Error::InputNotReady {
                    node: id,
                    port: port.clone(),
                })?;
            slot.used += 1;
            let edge = &graph.edges[port];
            if edge.releasable && slot.used == edge.consumers.len() {
                done.push(port.as_str());
            }
        }
        Ok(done)
    }

    fn run_node(&mut self, id: NodeId) -> Result<()> {
        let graph = self.graph;
        let node = &graph.nodes[id];
        let finished = self.mark_reads(id)?;

        let results = {
            let inputs: Vec<Option<&AnyTensor>> = node
                .inputs
                .iter()
                .map(|port| {
                    if port.is_empty() {
                        None
                    } else {
                        graph
                            .constants
                            .get(port)
                            .or_else(|| self.slots.get(port.as_str()).map(|s| s.value.get()))
                    }
                })
                .collect();
            tracing::trace!(node = id, op = %node.op_type, name = %node.name, "run");
            (node.forward)(&node.config, &Inputs::new(inputs.clone())).map_err(|e| {
                let shapes: Vec<Shape> = inputs.iter().flatten().map(|t| t.shape().clone()).collect();
                e.in_node(id, &node.op_type, shapes)
            })?
        };

        if results.len() != node.outputs.len() {
            return Err(Error::OutputArity {
                op_type: node.op_type.clone(),
                expected: node.outputs.len(),
                got: results.len(),
            });
        }

        for port in finished {
            if let Some(slot) = self.slots.remove(port) {
                if let Value::Owned(t) = slot.value {
                    let recycled = t.release();
                    tracing::trace!(port, recycled, "released");
                }
                if let Some(trace) = &mut self.trace {
                    trace.released.push(port.to_string());
                }
            }
        }

        for (port, value) in node.outputs.iter().zip(results) {
            if port.is_empty() {
                value.release();
            } else {
                self.publish(port.as_str(), Value::Owned(value));
            }
        }
        if let Some(trace) = &mut self.trace {
            trace.executed.push(id);
        }
        Ok(())
    }

    fn collect(&self) -> Result<Vec<AnyTensor>> {
        self.graph
            .outputs
            .iter()
            .map(|port| {
                self.graph
                    .constants
                    .get(port)
                    .or_else(|| self.slots.get(port.as_str()).map(|s| s.value.get()))
                    .cloned()
                    .ok_or_else(|| Error::UnresolvedOutput { port: port.clone() })
            })
            .collect()
    }
}

fn run(graph: &Graph, inputs: &[AnyTensor], traced: bool) -> Result<(Vec<AnyTensor>, ForwardTrace)> {
    if inputs.len() != graph.inputs.len() {
        return Err(Error::InputCountMismatch {
            expected: graph.inputs.len(),
            got: inputs.len(),
        });
    }
    let mut pass = Pass::new(graph, traced);
    for (port, tensor) in graph.inputs.iter().zip(inputs) {
        pass.publish(port.as_str(), Value::Borrowed(tensor));
    }
    while let Some(id) = pass.ready.pop_front() {
        pass.run_node(id)?;
    }
    let outputs = pass.collect()?;
    tracing::debug!(nodes = graph.nodes.len(), outputs = outputs.len(), "forward pass done");
    Ok((outputs, pass.trace.unwrap_or_default()))
}

/// Run one pass. `inputs[i]` feeds the i-th declared input; the result
/// lines up with the declared outputs.
pub fn forward(graph: &Graph, inputs: &[AnyTensor]) -> Result<Vec<AnyTensor>> {
    run(graph, inputs, false).map(|(outputs, _)| outputs)
}

/// Like [`forward`], also reporting execution and release order.
pub fn forward_traced(graph: &Graph, inputs: &[AnyTensor]) -> Result<(Vec<AnyTensor>, ForwardTrace)> {
    run(graph, inputs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadOptions;
    use crate::onnx::{ModelProto, NodeProto, ValueInfo};

    fn graph(nodes: Vec<NodeProto>, inputs: &[&str], outputs: &[&str]) -> Graph {
        let mut m = ModelProto::new(13);
        m.graph.nodes = nodes;
        m.graph.inputs = inputs.iter().map(|n| ValueInfo::new(n, &[2])).collect();
        m.graph.outputs = outputs.iter().map(|n| ValueInfo::new(n, &[2])).collect();
        Graph::build(&m, &LoadOptions::default()).unwrap()
    }

    #[test]
    fn test_fan_out_releases_after_last_reader() {
        // a feeds two nodes; it goes only after both ran
        let g = graph(
            vec![
                NodeProto::new("Exp", &["x"], &["a"]),
                NodeProto::new("Neg", &["a"], &["b"]),
                NodeProto::new("Abs", &["a"], &["c"]),
                NodeProto::new("Add", &["b", "c"], &["y"]),
            ],
            &["x"],
            &["y"],
        );
        let x = AnyTensor::from_slice(&[0.0, 1.0], 2).unwrap();
        let (out, trace) = forward_traced(&g, &[x]).unwrap();
        assert_eq!(out[0].to_vec().unwrap(), vec![0.0, 0.0]);
        assert_eq!(trace.executed, vec![0, 1, 2, 3]);
        assert_eq!(trace.released, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_input_count_mismatch() {
        let g = graph(vec![NodeProto::new("Exp", &["x"], &["y"])], &["x"], &["y"]);
        assert!(matches!(
            forward(&g, &[]).unwrap_err(),
            Error::InputCountMismatch { expected: 1, got: 0 }
        ));
    }

    #[test]
    fn test_kernel_error_names_node() {
        let g = graph(vec![NodeProto::new("Add", &["x", "w"], &["y"])], &["x", "w"], &["y"]);
        let x = AnyTensor::from_slice(&[1.0, 2.0, 3.0], 3).unwrap();
        let w = AnyTensor::from_slice(&[1.0, 2.0], 2).unwrap();
        match forward(&g, &[x, w]).unwrap_err() {
            Error::Node { node, op_type, shapes, source } => {
                assert_eq!(node, 0);
                assert_eq!(op_type, "Add");
                assert_eq!(shapes.len(), 2);
                assert!(matches!(*source, Error::BroadcastIncompatible { .. }));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_constant_node_output_is_released() {
        let g = graph(
            vec![
                NodeProto::new("Constant", &[], &["c"])
                    .with_attr("value_float", crate::onnx::Attribute::Float(2.0)),
                NodeProto::new("Mul", &["x", "c"], &["y"]),
            ],
            &["x"],
            &["y"],
        );
        let x = AnyTensor::from_slice(&[1.0, 3.0], 2).unwrap();
        let (out, trace) = forward_traced(&g, &[x]).unwrap();
        assert_eq!(out[0].to_vec().unwrap(), vec![2.0, 6.0]);
        assert_eq!(trace.executed, vec![0, 1]);
        assert_eq!(trace.released, vec!["c"]);
    }
}
