//! Stub ARM-style provider and extension endpoint for tests
//!
//! Serves resources under `/resourceGroups/{group}/providers/{namespace}/{kind}/{name}`,
//! long-running operations under `/operations/{id}` and extension hooks under
//! `/hooks/{name}`. Behavior is scripted through [`ProviderState`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

type Shared = Arc<Mutex<ProviderState>>;
type ResourcePath = Path<(String, String, String, String)>;

/// How the stub answers a PUT
#[derive(Debug, Clone)]
pub enum PutBehavior {
    /// 201 with an Azure-AsyncOperation header
    Async,
    /// 200 with the finished resource
    Sync,
    Reject { code: String, message: String },
    Throttle { retry_after: u64 },
}

enum Change {
    Put { name: String, body: Value },
    Delete { name: String },
}

struct Operation {
    remaining: usize,
    change: Option<Change>,
}

pub struct ProviderState {
    base_url: String,
    /// Resources by name
    pub resources: HashMap<String, Value>,
    /// Polls answered with InProgress before an operation finishes
    pub in_progress_polls: usize,
    pub put_behavior: PutBehavior,
    /// Finish operations as Failed with this code and message
    pub fail_with: Option<(String, String)>,
    /// Answer operation polls with this raw body instead of a status
    pub raw_poll_body: Option<String>,
    /// Hook responses by extension name, Success when absent
    pub hook_responses: HashMap<String, Value>,
    pub puts: usize,
    pub deletes: usize,
    pub polls: usize,
    pub hook_calls: usize,
    /// Hook request bodies in arrival order
    pub hook_requests: Vec<Value>,
    operations: HashMap<String, Operation>,
    next_operation: usize,
}

impl ProviderState {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            resources: HashMap::new(),
            in_progress_polls: 0,
            put_behavior: PutBehavior::Async,
            fail_with: None,
            raw_poll_body: None,
            hook_responses: HashMap::new(),
            puts: 0,
            deletes: 0,
            polls: 0,
            hook_calls: 0,
            hook_requests: Vec::new(),
            operations: HashMap::new(),
            next_operation: 0,
        }
    }

    /// Seed a finished resource.
    pub fn insert_resource(&mut self, name: &str, body: Value) {
        self.materialize(name, body);
    }

    fn materialize(&mut self, name: &str, mut body: Value) -> Value {
        body["id"] = json!(format!("/resources/{}", name));
        body["name"] = json!(name);
        body["properties"]["provisioningState"] = json!("Succeeded");
        self.resources.insert(name.to_string(), body.clone());
        body
    }

    fn start_operation(&mut self, change: Change) -> String {
        self.next_operation += 1;
        let id = format!("op-{}", self.next_operation);
        self.operations.insert(
            id.clone(),
            Operation {
                remaining: self.in_progress_polls,
                change: Some(change),
            },
        );
        format!("{}/operations/{}", self.base_url, id)
    }
}

pub struct StubProvider {
    pub url: String,
    state: Shared,
}

impl StubProvider {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(ProviderState::new(&url)));

        let app = Router::new()
            .route(
                "/resourceGroups/{group}/providers/{namespace}/{kind}/{name}",
                get(get_resource).put(put_resource).delete(delete_resource),
            )
            .route("/operations/{id}", get(get_operation))
            .route("/hooks/{name}", post(call_hook))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, state }
    }

    pub fn state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap()
    }

    pub fn hook_url(&self, name: &str) -> String {
        format!("{}/hooks/{}", self.url, name)
    }
}

fn error_body(code: &str, message: &str) -> Json<Value> {
    Json(json!({ "error": { "code": code, "message": message } }))
}

async fn get_resource(
    State(state): State<Shared>,
    Path((_, _, _, name)): ResourcePath,
) -> Response {
    let state = state.lock().unwrap();
    match state.resources.get(&name) {
        Some(resource) => Json(resource.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            error_body("ResourceNotFound", &format!("{} not found", name)),
        )
            .into_response(),
    }
}

async fn put_resource(
    State(state): State<Shared>,
    Path((_, _, _, name)): ResourcePath,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.puts += 1;

    match state.put_behavior.clone() {
        PutBehavior::Reject { code, message } => {
            (StatusCode::BAD_REQUEST, error_body(&code, &message)).into_response()
        }
        PutBehavior::Throttle { retry_after } => (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", retry_after.to_string())],
            error_body("TooManyRequests", "slow down"),
        )
            .into_response(),
        PutBehavior::Sync => Json(state.materialize(&name, body)).into_response(),
        PutBehavior::Async => {
            let mut accepted = body.clone();
            accepted["properties"]["provisioningState"] = json!("Creating");
            let url = state.start_operation(Change::Put { name, body });
            (
                StatusCode::CREATED,
                [("azure-asyncoperation", url)],
                Json(accepted),
            )
                .into_response()
        }
    }
}

async fn delete_resource(
    State(state): State<Shared>,
    Path((_, _, _, name)): ResourcePath,
) -> Response {
    let mut state = state.lock().unwrap();
    state.deletes += 1;

    if !state.resources.contains_key(&name) {
        return StatusCode::NO_CONTENT.into_response();
    }
    let url = state.start_operation(Change::Delete { name });
    (StatusCode::ACCEPTED, [("location", url)]).into_response()
}

async fn get_operation(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    state.polls += 1;

    if let Some(body) = state.raw_poll_body.clone() {
        return (StatusCode::OK, [(header::CONTENT_TYPE, "text/html")], body).into_response();
    }

    let change = match state.operations.get_mut(&id) {
        None => {
            return (
                StatusCode::NOT_FOUND,
                error_body("OperationNotFound", &id),
            )
                .into_response();
        }
        Some(op) if op.remaining > 0 => {
            op.remaining -= 1;
            return Json(json!({ "status": "InProgress" })).into_response();
        }
        Some(op) => op.change.take(),
    };

    if let Some((code, message)) = state.fail_with.clone() {
        return Json(json!({
            "status": "Failed",
            "error": { "code": code, "message": message }
        }))
        .into_response();
    }

    match change {
        Some(Change::Put { name, body }) => {
            state.materialize(&name, body);
        }
        Some(Change::Delete { name }) => {
            state.resources.remove(&name);
        }
        None => {}
    }
    Json(json!({ "status": "Succeeded" })).into_response()
}

async fn call_hook(
    State(state): State<Shared>,
    Path(name): Path<String>,
    Json(request): Json<Value>,
) -> Json<Value> {
    let mut state = state.lock().unwrap();
    state.hook_calls += 1;
    state.hook_requests.push(request);
    Json(
        state
            .hook_responses
            .get(&name)
            .cloned()
            .unwrap_or_else(|| json!({ "status": "Success" })),
    )
}
