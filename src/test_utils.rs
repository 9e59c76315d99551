//! Test utilities shared by unit tests and benchmarks.
//!
//! Graph builders and pixel fixtures used across modules, so each test only
//! spells out what it actually checks.

#![cfg(any(test, feature = "benchmark"))]

use crate::error::Result;
use crate::graph::{CalculatorGraph, GraphConfig, NodeConfig};
use crate::texture::FrameDescriptor;

/// Installs a subscriber that writes through the test harness. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("mpbridge=debug").try_init();
}

/// A single `PassThroughCalculator` from `input` to `output`.
pub fn pass_through_config(input: &str, output: &str) -> GraphConfig {
    GraphConfig::new().input_stream(input).output_stream(output).node(NodeConfig::new(
        "PassThroughCalculator",
        input,
        output,
    ))
}

/// Builds the graph for [`pass_through_config`].
pub fn pass_through_graph(input: &str, output: &str) -> Result<CalculatorGraph> {
    CalculatorGraph::new(pass_through_config(input, output))
}

/// Deterministic pixel data for `descriptor`; different seeds give different images.
pub fn gradient_pixels(descriptor: &FrameDescriptor, seed: u8) -> Vec<u8> {
    (0..descriptor.byte_len()).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
