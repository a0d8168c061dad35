use blockcore::identity::{self, scoped_id};
use blockcore::*;
use serde_json::json;

fn scenario() -> Workflow {
    serde_json::from_value(json!({
        "id": "6f1c2a9e-1111-4c3b-9c7e-0a0b0c0d0e0f",
        "name": "loop scenario",
        "blocks": [
            {"id": "start", "config": {"type": "trigger"}},
            {"id": "loop", "config": {"type": "loop", "count": 3, "nodes": ["add"]}},
            {"id": "add", "config": {"type": "function", "function": "sum", "args": {"values": ["<loop.index>", 1]}}},
            {"id": "end", "config": {"type": "response", "data": "<loop.results>"}}
        ],
        "edges": [
            {"source": "start", "target": "loop"},
            {"source": "loop", "target": "add"},
            {"source": "loop", "target": "end"}
        ]
    }))
    .unwrap()
}

#[test]
fn workflow_json_loads_and_validates() {
    let wf = scenario();
    assert_eq!(wf.blocks.len(), 4);
    assert!(wf.validate().is_ok());

    let spec = wf.find_block("loop").unwrap().config.container().unwrap().unwrap();
    assert_eq!(spec.count, 3);
    assert_eq!(spec.max_concurrency, 1);
    assert_eq!(spec.nodes, vec!["add".to_string()]);
}

#[test]
fn nested_identities_unwrap_to_definition() {
    let path = vec![("outer".to_string(), 1), ("inner".to_string(), 4)];
    let token = scoped_id("add", &path);

    assert_eq!(token, "add_parallel_inner_iteration_4_parallel_outer_iteration_1");
    assert!(identity::is_virtual(&token));
    assert_eq!(identity::extract_original(&token), "add");

    let outer = identity::decode(&token).unwrap();
    assert_eq!(outer.parallel_id, "outer");
    assert_eq!(outer.iteration, 1);
    assert_eq!(outer.original_id, "add_parallel_inner_iteration_4");
}

#[test]
fn snapshot_state_data_is_camel_case() {
    let snapshot = ExecutionSnapshot {
        id: uuid::Uuid::new_v4(),
        execution_id: uuid::Uuid::new_v4(),
        workflow_id: uuid::Uuid::new_v4(),
        created_at: chrono::Utc::now(),
        status: RunStatus::Succeeded,
        blocks: Default::default(),
    };
    let data = snapshot.state_data();
    assert!(data.get("executionId").is_some());
    assert_eq!(data["status"], json!("succeeded"));
}
