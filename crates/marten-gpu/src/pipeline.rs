// Compute pipeline cache and kernel dispatch
//
// A kernel is one WGSL module with a `main` entry point and a fixed binding
// scheme: params (read), `inputs` read-only operands, one read-write output.
// Pipelines are compiled on first use and cached per kernel for the life of
// the device.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{
    BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, BindingType, Buffer, BufferBindingType, BufferUsages, CommandEncoder,
    ComputePassDescriptor, ComputePipeline, ComputePipelineDescriptor, Device,
    PipelineLayoutDescriptor, ShaderModuleDescriptor, ShaderSource, ShaderStages,
};

use crate::shaders;

pub const WORKGROUP_SIZE: u32 = 256;

/// Per-dimension workgroup limit guaranteed by the default limits.
const MAX_GROUPS_PER_DIM: u32 = 65_535;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Kernel {
    pub name: &'static str,
    pub source: &'static str,
    pub inputs: u32,
}

pub(crate) const MAP: Kernel = Kernel {
    name: "map",
    source: shaders::MAP,
    inputs: 1,
};
pub(crate) const BINARY: Kernel = Kernel {
    name: "binary",
    source: shaders::BINARY,
    inputs: 2,
};
pub(crate) const REDUCE: Kernel = Kernel {
    name: "reduce",
    source: shaders::REDUCE,
    inputs: 1,
};
pub(crate) const MATMUL: Kernel = Kernel {
    name: "matmul",
    source: shaders::MATMUL,
    inputs: 2,
};
pub(crate) const GATHER: Kernel = Kernel {
    name: "gather",
    source: shaders::GATHER,
    inputs: 1,
};
pub(crate) const PLACE: Kernel = Kernel {
    name: "place",
    source: shaders::PLACE,
    inputs: 1,
};

struct Compiled {
    layout: BindGroupLayout,
    pipeline: ComputePipeline,
}

pub(crate) struct PipelineCache {
    compiled: Mutex<HashMap<&'static str, Arc<Compiled>>>,
}

impl PipelineCache {
    pub fn new() -> Self {
        PipelineCache {
            compiled: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.compiled.lock().len()
    }

    fn get(&self, device: &Device, kernel: &Kernel) -> Arc<Compiled> {
        let mut compiled = self.compiled.lock();
        if let Some(c) = compiled.get(kernel.name) {
            return c.clone();
        }
        tracing::debug!(kernel = kernel.name, "compiling pipeline");
        let c = Arc::new(compile(device, kernel));
        compiled.insert(kernel.name, c.clone());
        c
    }

    /// Record one dispatch of `kernel` over `threads` elements into `encoder`.
    pub fn record(
        &self,
        device: &Device,
        encoder: &mut CommandEncoder,
        kernel: &Kernel,
        params: &[u32],
        inputs: &[&Buffer],
        output: &Buffer,
        threads: usize,
    ) {
        debug_assert_eq!(inputs.len(), kernel.inputs as usize);
        let compiled = self.get(device, kernel);
        let params = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("marten_params"),
            contents: bytemuck::cast_slice(params),
            usage: BufferUsages::STORAGE,
        });
        let entries: Vec<BindGroupEntry> = std::iter::once(&params)
            .chain(inputs.iter().copied())
            .chain(std::iter::once(output))
            .enumerate()
            .map(|(i, buffer)| BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some(kernel.name),
            layout: &compiled.layout,
            entries: &entries,
        });

        let (x, y) = grid(threads);
        let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some(kernel.name),
            timestamp_writes: None,
        });
        pass.set_pipeline(&compiled.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }
}

fn compile(device: &Device, kernel: &Kernel) -> Compiled {
    let module = device.create_shader_module(ShaderModuleDescriptor {
        label: Some(kernel.name),
        source: ShaderSource::Wgsl(kernel.source.into()),
    });

    // params and operands are read-only so one buffer may be bound twice
    let entries: Vec<BindGroupLayoutEntry> = (0..kernel.inputs + 2)
        .map(|binding| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: BufferBindingType::Storage {
                    read_only: binding <= kernel.inputs,
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();
    let layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some(kernel.name),
        entries: &entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some(kernel.name),
        bind_group_layouts: &[&layout],
        immediate_size: 0,
    });
    let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
        label: Some(kernel.name),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });
    Compiled { layout, pipeline }
}

/// Workgroup grid `(x, y)` covering `threads` invocations.
pub(crate) fn grid(threads: usize) -> (u32, u32) {
    let groups = threads.div_ceil(WORKGROUP_SIZE as usize).max(1);
    let x = groups.min(MAX_GROUPS_PER_DIM as usize);
    let y = groups.div_ceil(x);
    (x as u32, y as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_small() {
        assert_eq!(grid(1), (1, 1));
        assert_eq!(grid(256), (1, 1));
        assert_eq!(grid(257), (2, 1));
    }

    #[test]
    fn test_grid_wraps_into_y() {
        let threads = 70_000 * WORKGROUP_SIZE as usize;
        let (x, y) = grid(threads);
        assert_eq!(x, MAX_GROUPS_PER_DIM);
        assert_eq!(y, 2);
        assert!(x as usize * y as usize * WORKGROUP_SIZE as usize >= threads);
    }
}
