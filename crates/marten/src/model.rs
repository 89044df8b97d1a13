// Model: the user-facing handle: load, run, move between backends
//
//   let mut model = Model::load_file("mlp.onnx", LoadOptions::default())?;
//   let y = model.forward(&[x])?;
//   model.to_native(&NativeDevice::new())?;
//   let y = model.forward(&[x.to_backend(&model.device())?])?;
//
// A backend switch converts every constant and every node-held tensor,
// except the ones named in `LoadOptions::no_convert_*`. Constants are
// converted into a fresh table that replaces the old one only once all of
// them made it, so a failed switch leaves the constant table untouched.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use marten_core::{BackendKind, Result};
use marten_native::NativeDevice;

#[cfg(feature = "gpu")]
use marten_gpu::GpuDevice;

use crate::config::LoadOptions;
use crate::exec::{self, ForwardTrace};
use crate::graph::Graph;
use crate::onnx::ModelProto;
use crate::tensor::{AnyTensor, Device};

/// A loaded ONNX model bound to one backend.
#[derive(Debug)]
pub struct Model {
    graph: Graph,
    device: Device,
    no_convert_constants: HashSet<String>,
    no_convert_nodes: HashSet<String>,
}

impl Model {
    /// Decode and load a serialized ONNX model.
    pub fn load(bytes: &[u8], options: LoadOptions) -> Result<Self> {
        Self::from_proto(&ModelProto::decode(bytes)?, options)
    }

    /// Read, decode and load an ONNX file.
    pub fn load_file(path: impl AsRef<Path>, options: LoadOptions) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), bytes = bytes.len(), "read model file");
        Self::load(&bytes, options)
    }

    /// Load an already decoded model. Constants start on the reference backend.
    pub fn from_proto(proto: &ModelProto, options: LoadOptions) -> Result<Self> {
        let graph = Graph::build(proto, &options)?;
        Ok(Model {
            graph,
            device: Device::Cpu,
            no_convert_constants: options.no_convert_constants,
            no_convert_nodes: options.no_convert_nodes,
        })
    }

    /// Run one pass; see [`exec::forward`].
    pub fn forward(&self, inputs: &[AnyTensor]) -> Result<Vec<AnyTensor>> {
        exec::forward(&self.graph, inputs)
    }

    /// Run one pass and report execution and release order.
    pub fn forward_traced(&self, inputs: &[AnyTensor]) -> Result<(Vec<AnyTensor>, ForwardTrace)> {
        exec::forward_traced(&self.graph, inputs)
    }

    // Backend switches

    /// Move constants and node state to `device`.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        let mut converted = HashMap::with_capacity(self.graph.constants.len());
        for (name, tensor) in &self.graph.constants {
            let moved = if self.no_convert_constants.contains(name) {
                tensor.clone()
            } else {
                tensor.to_backend(device)?
            };
            converted.insert(name.clone(), moved);
        }

        // Node state is converted in place; an error here leaves the nodes
        // visited so far on the new backend.
        for node in &mut self.graph.nodes {
            if self.no_convert_nodes.contains(&node.name) {
                continue;
            }
            if let Some(convert) = node.convert {
                convert(&mut node.config, device)?;
            }
        }

        let old = std::mem::replace(&mut self.graph.constants, converted);
        let recycled = old.into_values().map(AnyTensor::release).filter(|r| *r).count();
        tracing::debug!(
            from = %self.device.kind(),
            to = %device.kind(),
            constants = self.graph.constants.len(),
            recycled,
            "backend switch"
        );
        self.device = device.clone();
        Ok(())
    }

    /// Move to the scalar reference backend.
    pub fn to_cpu(&mut self) -> Result<()> {
        self.to_device(&Device::Cpu)
    }

    /// Move to the native backend allocating from `device`'s pool.
    pub fn to_native(&mut self, device: &NativeDevice) -> Result<()> {
        self.to_device(&Device::Native(device.clone()))
    }

    /// Move to the GPU backend.
    #[cfg(feature = "gpu")]
    pub fn to_gpu(&mut self, device: &GpuDevice) -> Result<()> {
        self.to_device(&Device::Gpu(device.clone()))
    }

    /// Release every constant and every tensor a node holds (the value of a
    /// `Constant` node).
    pub fn delete(self) {
        let Model { graph, .. } = self;
        let Graph {
            constants, nodes, ..
        } = graph;
        let mut released = 0usize;
        for (_, t) in constants {
            released += usize::from(t.release());
        }
        for node in nodes {
            if let Some(t) = node.config.into_inner::<AnyTensor>() {
                released += usize::from(t.release());
            }
        }
        tracing::debug!(released, "model deleted");
    }

    // Introspection

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn device(&self) -> Device {
        self.device.clone()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.device.kind()
    }

    pub fn input_names(&self) -> &[String] {
        self.graph.input_names()
    }

    pub fn output_names(&self) -> &[String] {
        self.graph.output_names()
    }

    pub fn node_count(&self) -> usize {
        self.graph.nodes().len()
    }
}
