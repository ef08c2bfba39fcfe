use crate::graph::Node;
use crate::handlers::SharedNodeHandler;
use std::collections::BTreeMap;

const DEFAULT_HANDLER_TYPE: &str = "codergen";

/// Maps handler type strings to handlers. An explicit `type` attribute wins,
/// then the node's `shape`, then the default type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers_by_type: BTreeMap<String, SharedNodeHandler>,
    shape_to_type: BTreeMap<String, String>,
    default_handler_type: String,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers_by_type: BTreeMap::new(),
            shape_to_type: default_shape_mapping(),
            default_handler_type: DEFAULT_HANDLER_TYPE.to_string(),
        }
    }

    pub fn register_type(
        &mut self,
        handler_type: impl Into<String>,
        handler: SharedNodeHandler,
    ) -> Option<SharedNodeHandler> {
        self.handlers_by_type.insert(handler_type.into(), handler)
    }

    pub fn register_shape_mapping(
        &mut self,
        shape: impl Into<String>,
        handler_type: impl Into<String>,
    ) -> Option<String> {
        self.shape_to_type.insert(shape.into(), handler_type.into())
    }

    pub fn set_default_handler_type(&mut self, handler_type: impl Into<String>) {
        self.default_handler_type = handler_type.into();
    }

    pub fn resolve_handler_type(&self, node: &Node) -> String {
        if let Some(node_type) = node.attrs.get_str("type") {
            let trimmed = node_type.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }

        let shape = node.attrs.get_str("shape").unwrap_or("box");
        self.shape_to_type
            .get(shape)
            .cloned()
            .unwrap_or_else(|| self.default_handler_type.clone())
    }

    /// Unknown types fall back to the default handler rather than failing;
    /// authors get a validation warning instead of a dead pipeline.
    pub fn resolve_handler(&self, node: &Node) -> Option<SharedNodeHandler> {
        let handler_type = self.resolve_handler_type(node);
        self.handlers_by_type
            .get(&handler_type)
            .cloned()
            .or_else(|| {
                self.handlers_by_type
                    .get(&self.default_handler_type)
                    .cloned()
            })
    }

    pub fn known_type(&self, handler_type: &str) -> bool {
        self.handlers_by_type.contains_key(handler_type)
    }
}

fn default_shape_mapping() -> BTreeMap<String, String> {
    [
        ("Mdiamond", "start"),
        ("Msquare", "exit"),
        ("box", "codergen"),
        ("diamond", "conditional"),
        ("octagon", "verify"),
        ("tripleoctagon", "parallel.fan_in"),
        ("hexagon", "wait.human"),
    ]
    .into_iter()
    .map(|(shape, handler_type)| (shape.to_string(), handler_type.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::core_registry;
    use crate::parse::parse_dot;

    fn node_with_attrs(attrs: &str) -> Node {
        let graph =
            parse_dot(&format!("digraph G {{ n1 [{attrs}] }}")).expect("graph should parse");
        graph.nodes.get("n1").expect("node should exist").clone()
    }

    #[test]
    fn explicit_type_beats_shape() {
        let registry = HandlerRegistry::new();
        let node = node_with_attrs("shape=diamond, type=\"verify\"");
        assert_eq!(registry.resolve_handler_type(&node), "verify");
    }

    #[test]
    fn shape_mapping_used_when_type_absent() {
        let registry = HandlerRegistry::new();
        assert_eq!(
            registry.resolve_handler_type(&node_with_attrs("shape=octagon")),
            "verify"
        );
        assert_eq!(
            registry.resolve_handler_type(&node_with_attrs("shape=tripleoctagon")),
            "parallel.fan_in"
        );
        assert_eq!(
            registry.resolve_handler_type(&node_with_attrs("shape=Mdiamond")),
            "start"
        );
    }

    #[test]
    fn unknown_shape_falls_back_to_default_type() {
        let registry = HandlerRegistry::new();
        let node = node_with_attrs("shape=cylinder");
        assert_eq!(registry.resolve_handler_type(&node), "codergen");
    }

    #[test]
    fn unregistered_explicit_type_resolves_default_handler() {
        let registry = core_registry();
        let node = node_with_attrs("type=\"custom.handler\"");
        assert!(registry.resolve_handler(&node).is_some());
    }

    #[test]
    fn missing_default_handler_resolves_none() {
        let mut registry = HandlerRegistry::new();
        registry.set_default_handler_type("missing.default");
        let node = node_with_attrs("type=\"custom\"");
        assert!(registry.resolve_handler(&node).is_none());
    }
}
