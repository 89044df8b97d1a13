// Executor: runs a loaded Graph as a dataflow machine
//
// There is no precomputed order. A node becomes ready when its last variable
// input arrives, ready nodes run in FIFO order one at a time, and every
// intermediate is released the moment its last consumer has read it:
//
//   ModelProto → Graph::build → **forward(inputs)** → outputs
//
// USAGE:
//   let graph = Graph::build(&proto, &LoadOptions::default())?;
//   let outputs = exec::forward(&graph, &[x, y])?;
//   let (outputs, trace) = exec::forward_traced(&graph, &[x, y])?;
//   assert!(trace.released.contains(&"z".to_string()));

mod scheduler;

pub use scheduler::{forward, forward_traced, ForwardTrace};
