use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpRequest, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use blockcore::{AccessPolicy, AllowAll, FlowError, TriggerKind, Value, Workflow, WorkflowError};
use blockruntime::{ExecutionResult, FlowRuntime, HandlerRegistry, RuntimeConfig};
use blockscheduler::{
    entries_for_workflow, DispatchStrategy, IggyTaskQueue, InMemoryScheduleStore, ScheduleDispatcher,
    ScheduleRunner, ScheduleStore, SchedulerConfig, WorkerPool,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Header naming the caller for permission checks
const ACTOR_HEADER: &str = "x-actor-id";

/// Application state shared across handlers
struct AppState {
    runtime: FlowRuntime,
    schedules: Arc<dyn ScheduleStore>,
    dispatcher: ScheduleDispatcher,
    access: Arc<dyn AccessPolicy>,
}

/// Request body for workflow execution
#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    inputs: HashMap<String, Value>,
}

/// Response for workflow registration
#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: Uuid,
    message: String,
    schedules: usize,
}

/// Response for workflow execution
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionResponse {
    execution_id: Uuid,
    status: blockcore::RunStatus,
    output: HashMap<String, Value>,
    completed_blocks: usize,
    total_blocks: usize,
    duration_ms: u64,
    cost: f64,
}

impl From<ExecutionResult> for ExecutionResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            execution_id: result.execution_id,
            status: result.status,
            completed_blocks: result.completed_blocks(),
            total_blocks: result.total_blocks(),
            duration_ms: result.duration_ms,
            cost: result.cost,
            output: result.final_output,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(e: &FlowError) -> HttpResponse {
    let body = ErrorResponse { error: e.to_string() };
    match e {
        FlowError::Workflow(WorkflowError::NotFound(_)) | FlowError::Workflow(WorkflowError::NotDeployed(_)) => {
            HttpResponse::NotFound().json(body)
        }
        e if e.is_configuration() => HttpResponse::BadRequest().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// `Some(403 response)` when the caller may not touch `workflow_id`
async fn forbidden(req: &HttpRequest, data: &AppState, workflow_id: Uuid) -> Option<HttpResponse> {
    let actor = req
        .headers()
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous");

    if data.access.check(actor, workflow_id).await.is_allowed() {
        None
    } else {
        warn!("Actor {} denied access to workflow {}", actor, workflow_id);
        Some(HttpResponse::Forbidden().json(ErrorResponse {
            error: format!("{} may not access workflow {}", actor, workflow_id),
        }))
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "blockflow"
    }))
}

/// List all workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let workflow_list: Vec<_> = data
        .runtime
        .list_workflows()
        .await
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "description": w.description,
                "blocks": w.blocks.len(),
                "edges": w.edges.len(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(workflow_list))
}

/// Register a workflow and the schedules of its trigger blocks
#[post("/api/workflows")]
async fn create_workflow(data: web::Data<AppState>, workflow: web::Json<Workflow>) -> ActixResult<impl Responder> {
    let workflow = workflow.into_inner();
    let workflow_id = workflow.id;

    if let Err(e) = data.runtime.registry().validate_workflow(&workflow) {
        return Ok(error_response(&FlowError::from(e)));
    }
    let entries = match entries_for_workflow(&workflow, chrono::Utc::now()) {
        Ok(entries) => entries,
        Err(e) => {
            return Ok(HttpResponse::BadRequest().json(ErrorResponse { error: e.to_string() }));
        }
    };

    info!("Creating workflow: {} ({})", workflow.name, workflow_id);
    if let Err(e) = data.runtime.register_workflow(workflow).await {
        return Ok(error_response(&e));
    }

    let schedules = entries.len();
    for entry in entries {
        if let Err(e) = data.schedules.upsert(entry).await {
            error!("Failed to store schedule for workflow {}: {}", workflow_id, e);
        }
    }

    Ok(HttpResponse::Created().json(WorkflowResponse {
        id: workflow_id,
        message: "Workflow created successfully".to_string(),
        schedules,
    }))
}

/// Get a specific workflow
#[get("/api/workflows/{id}")]
async fn get_workflow(req: HttpRequest, data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    if let Some(denied) = forbidden(&req, &data, workflow_id).await {
        return Ok(denied);
    }

    match data.runtime.get_workflow(workflow_id).await {
        Some(workflow) => Ok(HttpResponse::Ok().json(workflow)),
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        })),
    }
}

/// Delete a workflow
#[actix_web::delete("/api/workflows/{id}")]
async fn delete_workflow(req: HttpRequest, data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    if let Some(denied) = forbidden(&req, &data, workflow_id).await {
        return Ok(denied);
    }

    match data.runtime.remove_workflow(workflow_id).await {
        Some(_) => {
            info!("Deleted workflow: {}", workflow_id);
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "message": "Workflow deleted successfully"
            })))
        }
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        })),
    }
}

/// Execute the registered draft of a workflow
#[post("/api/workflows/{id}/execute")]
async fn execute_workflow(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<ExecuteRequest>>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    if let Some(denied) = forbidden(&req, &data, workflow_id).await {
        return Ok(denied);
    }
    let inputs = body.map(|b| b.into_inner().inputs).unwrap_or_default();

    info!("Executing workflow: {}", workflow_id);
    match data.runtime.execute_workflow(workflow_id, inputs, TriggerKind::Api).await {
        Ok(result) => {
            info!(
                "Workflow {} finished {:?}: {}/{} blocks",
                workflow_id,
                result.status,
                result.completed_blocks(),
                result.total_blocks()
            );
            Ok(HttpResponse::Ok().json(ExecutionResponse::from(result)))
        }
        Err(e) => {
            error!("Workflow {} execution failed: {}", workflow_id, e);
            Ok(error_response(&e))
        }
    }
}

/// Publish the current draft as the active deployment
#[post("/api/workflows/{id}/deploy")]
async fn deploy_workflow(req: HttpRequest, data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    if let Some(denied) = forbidden(&req, &data, workflow_id).await {
        return Ok(denied);
    }

    match data.runtime.deploy(workflow_id).await {
        Ok(version) => Ok(HttpResponse::Created().json(version)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// State of the active deployed version
#[get("/api/workflows/{id}/deployed")]
async fn deployed_state(req: HttpRequest, data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    if let Some(denied) = forbidden(&req, &data, workflow_id).await {
        return Ok(denied);
    }

    match data.runtime.deployed_state(workflow_id).await {
        Ok(Some(state)) => Ok(HttpResponse::Ok().json(state)),
        Ok(None) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("No deployed version for workflow {}", workflow_id),
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Execute the active deployed version
#[post("/api/workflows/{id}/deployed/execute")]
async fn execute_deployed(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<ExecuteRequest>>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    if let Some(denied) = forbidden(&req, &data, workflow_id).await {
        return Ok(denied);
    }
    let inputs = body.map(|b| b.into_inner().inputs).unwrap_or_default();

    match data.runtime.execute_deployed(workflow_id, inputs, TriggerKind::Api).await {
        Ok(result) => Ok(HttpResponse::Ok().json(ExecutionResponse::from(result))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Executions still in flight
#[get("/api/executions")]
async fn running_executions(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    Ok(HttpResponse::Ok().json(data.runtime.running_executions().await))
}

/// What happened in a finished execution
#[get("/api/executions/{id}")]
async fn lookup_execution(req: HttpRequest, data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let execution_id = path.into_inner();

    match data.runtime.lookup_execution(execution_id).await {
        Ok(Some(lookup)) => {
            if let Some(denied) = forbidden(&req, &data, lookup.workflow_id).await {
                return Ok(denied);
            }
            Ok(HttpResponse::Ok().json(lookup))
        }
        Ok(None) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Execution {} not found", execution_id),
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Cancel a running execution
#[post("/api/executions/{id}/cancel")]
async fn cancel_execution(data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let execution_id = path.into_inner();
    if data.runtime.cancel(execution_id).await {
        Ok(HttpResponse::Accepted().json(serde_json::json!({ "cancelled": execution_id })))
    } else {
        Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Execution {} is not running", execution_id),
        }))
    }
}

/// Dispatch every schedule due now
#[post("/api/schedules/execute")]
async fn dispatch_schedules(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    match data.dispatcher.dispatch(chrono::Utc::now()).await {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => {
            error!("Dispatch tick failed: {}", e);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse { error: e.to_string() }))
        }
    }
}

#[get("/api/schedules")]
async fn list_schedules(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    match data.schedules.list().await {
        Ok(entries) => Ok(HttpResponse::Ok().json(entries)),
        Err(e) => Ok(HttpResponse::InternalServerError().json(ErrorResponse { error: e.to_string() })),
    }
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(req: HttpRequest, stream: web::Payload, data: web::Data<AppState>) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");
    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagging, skipped {} events", skipped);
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List available block types
#[get("/api/blocks")]
async fn list_block_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();
    let blocks: Vec<_> = registry
        .list_block_types()
        .into_iter()
        .map(|block_type| {
            let metadata = registry.get_metadata(block_type);
            serde_json::json!({
                "type": block_type,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(blocks))
}

async fn build_dispatcher(
    config: &SchedulerConfig,
    runtime: &FlowRuntime,
    schedules: Arc<dyn ScheduleStore>,
) -> anyhow::Result<ScheduleDispatcher> {
    Ok(match &config.strategy {
        DispatchStrategy::Queue { task_name } => {
            let queue = IggyTaskQueue::connect(config.iggy.clone()).await?;
            ScheduleDispatcher::queued(schedules, Arc::new(queue), task_name.clone())
        }
        DispatchStrategy::Direct => {
            let runner = Arc::new(ScheduleRunner::new(Arc::new(runtime.clone()), schedules.clone()));
            let pool = Arc::new(WorkerPool::new(runner, config.max_concurrent_runs));
            ScheduleDispatcher::direct(schedules, pool)
        }
    })
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting blockflow server");

    let mut registry = HandlerRegistry::new();
    blockhandlers::register_all(&mut registry);
    let runtime = FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::from_env());

    let scheduler_config = SchedulerConfig::from_env();
    let schedules: Arc<dyn ScheduleStore> = Arc::new(InMemoryScheduleStore::new());
    let dispatcher = build_dispatcher(&scheduler_config, &runtime, schedules.clone()).await?;
    info!("Runtime ready, dispatch strategy {:?}", dispatcher.strategy());

    let app_state = web::Data::new(AppState {
        runtime,
        schedules,
        dispatcher,
        access: Arc::new(AllowAll),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_workflows)
            .service(create_workflow)
            .service(get_workflow)
            .service(delete_workflow)
            .service(execute_workflow)
            .service(deploy_workflow)
            .service(deployed_state)
            .service(execute_deployed)
            .service(running_executions)
            .service(lookup_execution)
            .service(cancel_execution)
            .service(dispatch_schedules)
            .service(list_schedules)
            .service(websocket_events)
            .service(list_block_types)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
