//! `<reference>` resolution inside block configurations
//!
//! A string config value may embed references such as `<start.input>`,
//! `<fetchdata.body.items>` (by normalized name), `<loop.index>` or
//! `<parallel.currentItem.name>`. A string that is exactly one reference
//! takes the referenced value as-is; otherwise each reference is replaced by
//! its text form. Unknown references resolve to null (empty text).

use crate::graph::WorkflowIndex;
use crate::state::ExecutionState;
use blockcore::identity::scoped_id;
use blockcore::{BlockConfig, BlockError, BlockStatus, ContainerKind, IterationContext, Value};

/// One enclosing container iteration
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: ContainerKind,
    pub container_id: String,
    pub index: usize,
    pub item: Value,
    pub total: usize,
}

impl Frame {
    pub fn to_iteration(&self) -> IterationContext {
        IterationContext {
            kind: self.kind,
            container_id: self.container_id.clone(),
            index: self.index,
            item: self.item.clone(),
            total: self.total,
        }
    }
}

/// `(container, iteration)` pairs used to derive identities
pub fn frame_path(frames: &[Frame]) -> Vec<(String, usize)> {
    frames
        .iter()
        .map(|f| (f.container_id.clone(), f.index))
        .collect()
}

pub struct ReferenceResolver<'a> {
    index: &'a WorkflowIndex,
    state: &'a ExecutionState,
    frames: &'a [Frame],
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(index: &'a WorkflowIndex, state: &'a ExecutionState, frames: &'a [Frame]) -> Self {
        Self { index, state, frames }
    }

    /// Resolve every reference in `config`.
    ///
    /// Typed substitution is tried first; if the result no longer fits the
    /// config shape, references are substituted as text instead.
    pub fn resolve_config(&self, config: &BlockConfig) -> Result<BlockConfig, BlockError> {
        let json = serde_json::to_value(config)
            .map_err(|e| BlockError::Configuration(format!("unserializable config: {}", e)))?;

        match serde_json::from_value(self.resolve_json(json.clone(), true)) {
            Ok(resolved) => Ok(resolved),
            Err(_) => serde_json::from_value(self.resolve_json(json, false))
                .map_err(|e| BlockError::Configuration(format!("resolved config is invalid: {}", e))),
        }
    }

    fn resolve_json(&self, json: serde_json::Value, typed: bool) -> serde_json::Value {
        match json {
            serde_json::Value::String(s) if typed => self.resolve_str(&s).to_json(),
            serde_json::Value::String(s) => serde_json::Value::String(self.interpolate(&s)),
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items.into_iter().map(|v| self.resolve_json(v, typed)).collect(),
            ),
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.resolve_json(v, typed)))
                    .collect(),
            ),
            other => other,
        }
    }

    pub fn resolve_str(&self, text: &str) -> Value {
        match whole_reference(text) {
            Some(reference) => self.lookup(reference).unwrap_or_default(),
            None => Value::String(self.interpolate(text)),
        }
    }

    /// Replace each reference with its text form.
    pub fn interpolate(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('<') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('>') {
                Some(close) if is_reference(&after[..close]) => {
                    if let Some(value) = self.lookup(&after[..close]) {
                        out.push_str(&value.to_text());
                    }
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('<');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn lookup(&self, reference: &str) -> Option<Value> {
        let (head, path) = reference.split_once('.').unwrap_or((reference, ""));

        if let Some(value) = self.iteration_value(head, path) {
            return Some(value);
        }

        let block = self.index.lookup(head)?;
        let full = frame_path(self.frames);
        // Closest instance first: same iteration, then each enclosing scope.
        (0..=full.len()).rev().find_map(|depth| {
            let identity = scoped_id(&block.id, &full[..depth]);
            let record = self.state.record(&identity)?;
            if record.status != BlockStatus::Succeeded && record.outputs.is_empty() {
                return None;
            }
            Value::Object(record.outputs.clone()).get_path(path).cloned()
        })
    }

    fn iteration_value(&self, head: &str, path: &str) -> Option<Value> {
        let frame = self
            .frames
            .iter()
            .rev()
            .find(|f| f.kind.reference_prefix() == head)?;
        let (field, rest) = path.split_once('.').unwrap_or((path, ""));
        match field {
            "index" => Some(Value::from(frame.index)),
            "currentItem" => frame.item.get_path(rest).cloned(),
            "total" => Some(Value::from(frame.total)),
            _ => None,
        }
    }
}

fn whole_reference(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('<')?.strip_suffix('>')?;
    is_reference(inner).then_some(inner)
}

fn is_reference(inner: &str) -> bool {
    !inner.is_empty()
        && inner.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockcore::{BlockDefinition, BlockType, LoopMetadata, Workflow};
    use serde_json::json;
    use std::collections::HashMap;

    fn fixture() -> (WorkflowIndex, ExecutionState) {
        let mut wf = Workflow::new("wf");
        wf.add_block(BlockDefinition::new("start", BlockConfig::Generic(HashMap::new())).with_name("Start Here"));
        wf.add_block(BlockDefinition::new(
            "loop",
            BlockConfig::Loop(LoopMetadata {
                nodes: vec!["add".into()],
                ..Default::default()
            }),
        ));
        wf.add_block(BlockDefinition::new("add", BlockConfig::function("sum")));
        let index = WorkflowIndex::build(&wf).unwrap();

        let mut state = ExecutionState::new();
        state.register("start", "start", BlockType::Generic).unwrap();
        state.start("start").unwrap();
        let outputs = Value::from(json!({"count": 3, "user": {"name": "ada"}}));
        state
            .succeed("start", outputs.as_object().unwrap().clone(), None)
            .unwrap();

        state.register("add_parallel_loop_iteration_1", "add", BlockType::Function).unwrap();
        state.start("add_parallel_loop_iteration_1").unwrap();
        state
            .succeed(
                "add_parallel_loop_iteration_1",
                HashMap::from([("sum".to_string(), Value::from(2.0))]),
                None,
            )
            .unwrap();
        (index, state)
    }

    fn frame(index: usize) -> Frame {
        Frame {
            kind: ContainerKind::Loop,
            container_id: "loop".into(),
            index,
            item: Value::from(json!({"name": "item"})),
            total: 3,
        }
    }

    #[test]
    fn whole_reference_keeps_type() {
        let (index, state) = fixture();
        let resolver = ReferenceResolver::new(&index, &state, &[]);
        assert_eq!(resolver.resolve_str("<start.count>"), Value::from(3.0));
        assert_eq!(resolver.resolve_str("<starthere.user.name>"), Value::from("ada"));
        assert_eq!(resolver.resolve_str("<missing.x>"), Value::Null);
    }

    #[test]
    fn embedded_references_become_text() {
        let (index, state) = fixture();
        let resolver = ReferenceResolver::new(&index, &state, &[]);
        assert_eq!(resolver.interpolate("hi <start.user.name>, n=<start.count>"), "hi ada, n=3");
        assert_eq!(resolver.interpolate("a < b and c > d"), "a < b and c > d");
    }

    #[test]
    fn iteration_references_and_closest_instance() {
        let (index, state) = fixture();
        let frames = [frame(1)];
        let resolver = ReferenceResolver::new(&index, &state, &frames);
        assert_eq!(resolver.resolve_str("<loop.index>"), Value::from(1usize));
        assert_eq!(resolver.resolve_str("<loop.currentItem.name>"), Value::from("item"));
        assert_eq!(resolver.resolve_str("<add.sum>"), Value::from(2.0));
        // outer scope block is still visible from inside the body
        assert_eq!(resolver.resolve_str("<start.count>"), Value::from(3.0));

        let frames = [frame(0)];
        let resolver = ReferenceResolver::new(&index, &state, &frames);
        assert_eq!(resolver.resolve_str("<add.sum>"), Value::Null);
    }

    #[test]
    fn resolves_inside_configs() {
        let (index, state) = fixture();
        let frames = [frame(2)];
        let resolver = ReferenceResolver::new(&index, &state, &frames);
        let config: BlockConfig = serde_json::from_value(json!({
            "type": "function",
            "function": "sum",
            "args": {"values": ["<loop.index>", "<start.count>"]}
        }))
        .unwrap();

        match resolver.resolve_config(&config).unwrap() {
            BlockConfig::Function(f) => {
                assert_eq!(f.args["values"], Value::from(json!([2, 3])));
            }
            other => panic!("unexpected config {other:?}"),
        }
    }
}
