use blockcore::{BlockDefinition, BlockId, Edge, Workflow, WorkflowError};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;

/// Structural view of a workflow, checked once before a run starts
///
/// A scope is either the top level (`None`) or the body of one loop or
/// parallel container. Edges must stay inside one scope, except entry
/// edges from a container to one of its own body members; those only
/// document the layout and never gate readiness.
#[derive(Debug, Clone)]
pub struct WorkflowIndex {
    blocks: HashMap<BlockId, BlockDefinition>,
    parent: HashMap<BlockId, BlockId>,
    scopes: HashMap<Option<BlockId>, Vec<BlockId>>,
    incoming: HashMap<BlockId, Vec<Edge>>,
    outgoing: HashMap<BlockId, Vec<Edge>>,
    names: HashMap<String, BlockId>,
}

impl WorkflowIndex {
    pub fn build(workflow: &Workflow) -> Result<Self, WorkflowError> {
        workflow.validate()?;

        let blocks: HashMap<BlockId, BlockDefinition> = workflow
            .blocks
            .iter()
            .map(|b| (b.id.clone(), b.clone()))
            .collect();

        let mut parent: HashMap<BlockId, BlockId> = HashMap::new();
        for block in &workflow.blocks {
            let Some(spec) = block.config.container() else {
                continue;
            };
            let spec = spec.map_err(|reason| WorkflowError::InvalidContainer {
                block_id: block.id.clone(),
                reason,
            })?;
            for member in &spec.nodes {
                if !blocks.contains_key(member) {
                    return Err(WorkflowError::BlockNotFound(member.clone()));
                }
                if member == &block.id {
                    return Err(WorkflowError::InvalidContainer {
                        block_id: block.id.clone(),
                        reason: "container lists itself as a member".to_string(),
                    });
                }
                if let Some(other) = parent.insert(member.clone(), block.id.clone()) {
                    return Err(WorkflowError::InvalidContainer {
                        block_id: block.id.clone(),
                        reason: format!("'{}' already belongs to '{}'", member, other),
                    });
                }
            }
        }

        // Each block has at most one parent, so a containment cycle shows up
        // as a parent chain longer than the number of blocks.
        for id in parent.keys() {
            let mut current = id;
            let mut steps = 0;
            while let Some(next) = parent.get(current) {
                steps += 1;
                if next == id || steps > blocks.len() {
                    return Err(WorkflowError::InvalidContainer {
                        block_id: id.clone(),
                        reason: "containers are nested in a cycle".to_string(),
                    });
                }
                current = next;
            }
        }

        let mut scopes: HashMap<Option<BlockId>, Vec<BlockId>> = HashMap::new();
        for block in &workflow.blocks {
            scopes
                .entry(parent.get(&block.id).cloned())
                .or_default()
                .push(block.id.clone());
        }

        let mut incoming: HashMap<BlockId, Vec<Edge>> = HashMap::new();
        let mut outgoing: HashMap<BlockId, Vec<Edge>> = HashMap::new();
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, _> = workflow
            .blocks
            .iter()
            .map(|b| (b.id.as_str(), graph.add_node(b.id.as_str())))
            .collect();

        for edge in &workflow.edges {
            let source_scope = parent.get(&edge.source);
            let target_scope = parent.get(&edge.target);
            if source_scope == target_scope {
                graph.add_edge(nodes[edge.source.as_str()], nodes[edge.target.as_str()], ());
                incoming.entry(edge.target.clone()).or_default().push(edge.clone());
                outgoing.entry(edge.source.clone()).or_default().push(edge.clone());
            } else if target_scope == Some(&edge.source) {
                tracing::debug!("Entry edge {} -> {}", edge.source, edge.target);
            } else {
                return Err(WorkflowError::InvalidConnection(format!(
                    "edge {} -> {} crosses a container boundary",
                    edge.source, edge.target
                )));
            }
        }

        if toposort(&graph, None).is_err() {
            return Err(WorkflowError::CyclicDependency);
        }

        let names = workflow
            .blocks
            .iter()
            .filter_map(|b| b.reference_name().map(|n| (n, b.id.clone())))
            .collect();

        Ok(Self {
            blocks,
            parent,
            scopes,
            incoming,
            outgoing,
            names,
        })
    }

    pub fn block(&self, id: &str) -> Option<&BlockDefinition> {
        self.blocks.get(id)
    }

    /// Direct members of a scope, in definition order
    pub fn members(&self, scope: Option<&str>) -> &[BlockId] {
        self.scopes
            .get(&scope.map(str::to_string))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Container whose body holds `id`
    pub fn parent(&self, id: &str) -> Option<&str> {
        self.parent.get(id).map(String::as_str)
    }

    /// In-scope edges ending at `id`
    pub fn incoming(&self, id: &str) -> &[Edge] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// In-scope edges leaving `id`
    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// No in-scope successor
    pub fn is_terminal(&self, id: &str) -> bool {
        self.outgoing(id).is_empty()
    }

    /// Find a block by id, or by its normalized display name.
    pub fn lookup(&self, reference: &str) -> Option<&BlockDefinition> {
        self.blocks.get(reference).or_else(|| {
            self.names
                .get(&reference.to_lowercase())
                .and_then(|id| self.blocks.get(id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockcore::{BlockConfig, LoopMetadata, ParallelMetadata};
    use std::collections::HashMap as Map;

    fn generic(id: &str) -> BlockDefinition {
        BlockDefinition::new(id, BlockConfig::Generic(Map::new()))
    }

    fn looped(id: &str, nodes: &[&str]) -> BlockDefinition {
        BlockDefinition::new(
            id,
            BlockConfig::Loop(LoopMetadata {
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn scopes_split_top_level_and_bodies() {
        let mut wf = Workflow::new("wf");
        wf.add_block(generic("start"));
        wf.add_block(looped("loop", &["a", "b"]));
        wf.add_block(generic("a"));
        wf.add_block(generic("b"));
        wf.add_block(generic("end"));
        wf.connect("start", "loop");
        wf.connect("loop", "a");
        wf.connect("a", "b");
        wf.connect("loop", "end");

        let index = WorkflowIndex::build(&wf).unwrap();
        assert_eq!(index.members(None), ["start", "loop", "end"]);
        assert_eq!(index.members(Some("loop")), ["a", "b"]);
        assert_eq!(index.parent("b"), Some("loop"));
        // the entry edge does not gate `a`
        assert!(index.incoming("a").is_empty());
        assert_eq!(index.incoming("b").len(), 1);
        assert!(index.is_terminal("end"));
    }

    #[test]
    fn edges_may_not_leave_a_body() {
        let mut wf = Workflow::new("wf");
        wf.add_block(looped("loop", &["a"]));
        wf.add_block(generic("a"));
        wf.add_block(generic("end"));
        wf.connect("a", "end");

        assert!(matches!(
            WorkflowIndex::build(&wf),
            Err(WorkflowError::InvalidConnection(_))
        ));
    }

    #[test]
    fn member_of_two_containers_is_rejected() {
        let mut wf = Workflow::new("wf");
        wf.add_block(looped("l1", &["a"]));
        wf.add_block(BlockDefinition::new(
            "p1",
            BlockConfig::Parallel(ParallelMetadata {
                nodes: vec!["a".into()],
                ..Default::default()
            }),
        ));
        wf.add_block(generic("a"));

        assert!(matches!(
            WorkflowIndex::build(&wf),
            Err(WorkflowError::InvalidContainer { .. })
        ));
    }

    #[test]
    fn containment_cycle_is_rejected() {
        let mut wf = Workflow::new("wf");
        wf.add_block(looped("l1", &["l2"]));
        wf.add_block(looped("l2", &["l1"]));

        assert!(matches!(
            WorkflowIndex::build(&wf),
            Err(WorkflowError::InvalidContainer { .. })
        ));
    }

    #[test]
    fn cycles_are_detected() {
        let mut wf = Workflow::new("wf");
        wf.add_block(generic("a"));
        wf.add_block(generic("b"));
        wf.connect("a", "b");
        wf.connect("b", "a");

        assert_eq!(WorkflowIndex::build(&wf).err(), Some(WorkflowError::CyclicDependency));
    }

    #[test]
    fn lookup_by_display_name() {
        let mut wf = Workflow::new("wf");
        wf.add_block(generic("b1").with_name("Fetch Data"));
        let index = WorkflowIndex::build(&wf).unwrap();
        assert_eq!(index.lookup("fetchdata").map(|b| b.id.as_str()), Some("b1"));
        assert_eq!(index.lookup("b1").map(|b| b.id.as_str()), Some("b1"));
    }
}
