use async_trait::async_trait;
use blockcore::*;
use std::result::Result;
use blockhandlers::{register_with_provider, Completion, CompletionProvider, CompletionRequest};
use blockruntime::{FlowRuntime, HandlerRegistry, RuntimeConfig};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Echoes the prompt back and charges a flat fee
#[derive(Default)]
struct EchoProvider {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl CompletionProvider for EchoProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BlockError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        Ok(Completion {
            content: format!("echo: {}", request.prompt),
            prompt_tokens: 12,
            completion_tokens: 30,
            cost: 0.25,
        })
    }
}

fn runtime_with(provider: Arc<EchoProvider>) -> FlowRuntime {
    let mut registry = HandlerRegistry::new();
    register_with_provider(&mut registry, provider);
    FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default())
}

fn runtime() -> FlowRuntime {
    runtime_with(Arc::new(EchoProvider::default()))
}

fn workflow(value: serde_json::Value) -> Workflow {
    let mut value = value;
    if value.get("id").is_none() {
        value["id"] = json!(uuid::Uuid::new_v4());
    }
    value["name"] = json!("handlers");
    serde_json::from_value(value).unwrap()
}

fn inputs(value: serde_json::Value) -> HashMap<String, Value> {
    match Value::from(value) {
        Value::Object(map) => map,
        _ => HashMap::new(),
    }
}

fn branching() -> Workflow {
    workflow(json!({
        "blocks": [
            {"id": "start", "config": {"type": "trigger", "defaults": {"score": 0}}},
            {"id": "check", "config": {"type": "condition", "conditions": [
                {"id": "high", "expression": "start.score > 5"},
                {"id": "else"}
            ]}},
            {"id": "big", "config": {"type": "response", "data": "<start.score>"}},
            {"id": "small", "config": {"type": "generic", "note": "small score"}}
        ],
        "edges": [
            {"source": "start", "target": "check"},
            {"source": "check", "target": "big", "condition": "high"},
            {"source": "check", "target": "small", "condition": "else"}
        ]
    }))
}

#[tokio::test]
async fn condition_takes_first_matching_branch() {
    let rt = runtime();
    let result = rt.execute(&branching(), inputs(json!({"score": 7}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.block_outputs("check").unwrap()["selectedBranch"], Value::from("high"));
    assert_eq!(result.status_of("big"), Some(BlockStatus::Succeeded));
    assert_eq!(result.status_of("small"), Some(BlockStatus::Skipped));
    assert_eq!(result.final_output["data"], Value::from(7.0));
    assert_eq!(result.final_output["status"], Value::from(200.0));
}

#[tokio::test]
async fn else_branch_catches_the_rest() {
    let rt = runtime();
    let result = rt.execute(&branching(), HashMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.status_of("big"), Some(BlockStatus::Skipped));
    assert_eq!(result.block_outputs("small").unwrap()["note"], Value::from("small score"));
}

#[tokio::test]
async fn router_falls_back_to_default_route() {
    let rt = runtime();
    let wf = workflow(json!({
        "blocks": [
            {"id": "start", "config": {"type": "trigger"}},
            {"id": "route", "config": {"type": "router", "defaultRoute": "general", "routes": [
                {"target": "billing", "expression": "start.topic == 'invoice'"}
            ]}},
            {"id": "billing", "config": {"type": "generic"}},
            {"id": "general", "config": {"type": "generic"}}
        ],
        "edges": [
            {"source": "start", "target": "route"},
            {"source": "route", "target": "billing"},
            {"source": "route", "target": "general"}
        ]
    }));

    let result = rt.execute(&wf, inputs(json!({"topic": "refund"}))).await.unwrap();
    assert_eq!(result.status_of("general"), Some(BlockStatus::Succeeded));
    assert_eq!(result.status_of("billing"), Some(BlockStatus::Skipped));

    let result = rt.execute(&wf, inputs(json!({"topic": "invoice"}))).await.unwrap();
    assert_eq!(result.status_of("billing"), Some(BlockStatus::Succeeded));
    assert_eq!(result.status_of("general"), Some(BlockStatus::Skipped));
}

#[tokio::test]
async fn agent_prompt_is_resolved_and_cost_counted() {
    let provider = Arc::new(EchoProvider::default());
    let rt = runtime_with(provider.clone());
    let wf = workflow(json!({
        "blocks": [
            {"id": "start", "config": {"type": "trigger"}},
            {"id": "writer", "config": {"type": "agent", "model": "gpt-4o-mini", "prompt": "Summarize: <start.text>"}}
        ],
        "edges": [{"source": "start", "target": "writer"}]
    }));

    let result = rt.execute(&wf, inputs(json!({"text": "a long story"}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(provider.prompts.lock().unwrap().as_slice(), ["Summarize: a long story"]);
    let outputs = result.block_outputs("writer").unwrap();
    assert_eq!(outputs["content"], Value::from("echo: Summarize: a long story"));
    assert_eq!(outputs["tokens"].get_path("total"), Some(&Value::from(42.0)));
    assert_eq!(result.cost, 0.25);
}

#[tokio::test]
async fn evaluator_clamps_and_averages() {
    let rt = runtime();
    let wf = workflow(json!({
        "blocks": [
            {"id": "judge", "config": {"type": "evaluator",
                "content": {"accuracy": 14, "tone": "4"},
                "metrics": [
                    {"name": "accuracy", "min": 0, "max": 10},
                    {"name": "tone", "min": 0, "max": 5}
                ]}}
        ]
    }));

    let result = rt.execute(&wf, HashMap::new()).await.unwrap();
    let outputs = result.block_outputs("judge").unwrap();
    assert_eq!(outputs["accuracy"], Value::from(10.0));
    assert_eq!(outputs["tone"], Value::from(4.0));
    assert_eq!(outputs["score"], Value::from(7.0));
}

#[tokio::test]
async fn for_each_loop_with_builtin_handlers() {
    let rt = runtime();
    let wf = workflow(json!({
        "blocks": [
            {"id": "each", "config": {"type": "loop", "loopType": "forEach", "collection": ["red", "blue"], "nodes": ["shout"]}},
            {"id": "shout", "config": {"type": "function", "function": "template",
                "args": {"template": "{{color}}!", "color": "<loop.currentItem>"}}}
        ]
    }));

    let result = rt.execute(&wf, HashMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(
        result.block_outputs("shout_parallel_each_iteration_1").unwrap()["result"],
        Value::from("blue!")
    );
    let each = result.block_outputs("each").unwrap();
    assert_eq!(each["count"], Value::from(2usize));
    assert_eq!(
        each["results"].get_path("0.shout.result"),
        Some(&Value::from("red!"))
    );
}

#[tokio::test]
async fn unknown_function_is_rejected_before_running() {
    let rt = runtime();
    let wf = workflow(json!({
        "blocks": [{"id": "f", "config": {"type": "function", "function": "nope"}}]
    }));

    let err = rt.execute(&wf, HashMap::new()).await.unwrap_err();
    assert!(err.is_configuration(), "{}", err);
}

#[tokio::test]
async fn nested_workflow_returns_child_output() {
    let rt = runtime();
    let child = workflow(json!({
        "blocks": [
            {"id": "start", "config": {"type": "trigger"}},
            {"id": "done", "config": {"type": "response", "data": {"doubled": "<start.x> <start.x>"}}}
        ],
        "edges": [{"source": "start", "target": "done"}]
    }));
    let child_id = child.id;
    rt.register_workflow(child).await.unwrap();

    let parent = workflow(json!({
        "blocks": [
            {"id": "start", "config": {"type": "trigger"}},
            {"id": "sub", "config": {"type": "workflow", "workflowId": child_id, "input": {"x": "<start.word>"}}}
        ],
        "edges": [{"source": "start", "target": "sub"}]
    }));

    let result = rt.execute(&parent, inputs(json!({"word": "hey"}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    let sub = result.block_outputs("sub").unwrap();
    assert_eq!(sub["result"].get_path("data.doubled"), Some(&Value::from("hey hey")));
    assert_eq!(rt.executions_for(child_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn self_recursive_workflow_stops_at_depth_limit() {
    let rt = runtime();
    let id = uuid::Uuid::new_v4();
    let wf = workflow(json!({
        "id": id,
        "blocks": [{"id": "again", "config": {"type": "workflow", "workflowId": id}}]
    }));
    rt.register_workflow(wf).await.unwrap();

    let result = rt
        .execute_workflow(id, HashMap::new(), TriggerKind::Manual)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status_of("again"), Some(BlockStatus::Failed));
}
