use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Topology of a calculator graph.
///
/// ```yaml
/// input_streams: [input_video]
/// output_streams: [output_video]
/// nodes:
///   - calculator: PassThroughCalculator
///     input_stream: input_video
///     output_stream: output_video
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphConfig {
    #[serde(default)]
    pub input_streams: Vec<String>,
    #[serde(default)]
    pub output_streams: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Bound of the input queue. Zero means unbounded.
    #[serde(default)]
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub calculator: String,
    pub input_stream: String,
    pub output_stream: String,
    /// Asset the calculator loads when the graph starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Side packet the calculator reads when the graph starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_packet: Option<String>,
}

impl NodeConfig {
    pub fn new(calculator: impl Into<String>, input_stream: impl Into<String>, output_stream: impl Into<String>) -> Self {
        Self {
            calculator: calculator.into(),
            input_stream: input_stream.into(),
            output_stream: output_stream.into(),
            resource: None,
            side_packet: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_side_packet(mut self, side_packet: impl Into<String>) -> Self {
        self.side_packet = Some(side_packet.into());
        self
    }
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_stream(mut self, name: impl Into<String>) -> Self {
        self.input_streams.push(name.into());
        self
    }

    pub fn output_stream(mut self, name: impl Into<String>) -> Self {
        self.output_streams.push(name.into());
        self
    }

    pub fn node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    /// Checks that every stream has exactly one producer.
    pub fn validate(&self) -> Result<()> {
        let mut produced = HashSet::new();
        for name in &self.input_streams {
            if name.is_empty() {
                return Err(BridgeError::config("input stream names must not be empty"));
            }
            if !produced.insert(name.as_str()) {
                return Err(BridgeError::config(format!("input stream '{name}' is declared twice")));
            }
        }
        for node in &self.nodes {
            if node.calculator.is_empty() {
                return Err(BridgeError::config("node is missing a calculator"));
            }
            if node.output_stream.is_empty() {
                return Err(BridgeError::config(format!("{} has no output stream", node.calculator)));
            }
            if !produced.insert(node.output_stream.as_str()) {
                return Err(BridgeError::config(format!(
                    "stream '{}' has more than one producer",
                    node.output_stream
                )));
            }
        }
        for node in &self.nodes {
            if !produced.contains(node.input_stream.as_str()) {
                return Err(BridgeError::config(format!(
                    "{} reads stream '{}' that nothing produces",
                    node.calculator, node.input_stream
                )));
            }
        }
        if let Some(name) = self.output_streams.iter().find(|name| !produced.contains(name.as_str())) {
            return Err(BridgeError::config(format!("output stream '{name}' is never produced")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASS_THROUGH: &str = r#"
input_streams: [in]
output_streams: [out]
nodes:
  - calculator: PassThroughCalculator
    input_stream: in
    output_stream: out
"#;

    #[test]
    fn parses_yaml() {
        let config = GraphConfig::from_yaml_str(PASS_THROUGH).unwrap();
        assert_eq!(
            config,
            GraphConfig::new()
                .input_stream("in")
                .output_stream("out")
                .node(NodeConfig::new("PassThroughCalculator", "in", "out"))
        );
        assert_eq!(GraphConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap(), config);
    }

    #[test]
    fn rejects_streams_without_producer() {
        let config = GraphConfig::new().input_stream("in").node(NodeConfig::new("PassThroughCalculator", "x", "out"));
        assert!(matches!(config.validate(), Err(BridgeError::Config { .. })));

        let config = GraphConfig::new().input_stream("in").output_stream("missing");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_producers() {
        let config = GraphConfig::new()
            .input_stream("in")
            .node(NodeConfig::new("PassThroughCalculator", "in", "in"));
        assert!(config.validate().is_err());
        assert!(GraphConfig::new().input_stream("in").input_stream("in").validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(GraphConfig::from_yaml_str("input_streams: [in]\nexecutor: pool\n").is_err());
    }
}
