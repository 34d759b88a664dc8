//! Sample web host: an in-memory todo API with a bearer-token middleware.
//!
//! Reads `./config.yaml` when present; `SERVER_PORT=9000` or
//! `--server.port 9000` override the port.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, Request};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hostkit_core::{BackgroundService, CancellationToken, HostEnvironment};
use hostkit_server::builder::{HEALTH_PATH, OPENAPI_PATH, SWAGGER_PATH};
use hostkit_server::{ApiError, ApiResponse, Middleware, SkipPaths, WebHostBuilder, WebHostOptions};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::openapi::{InfoBuilder, OpenApi, OpenApiBuilder};

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct Todo {
    id: u64,
    title: String,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct NewTodo {
    title: String,
}

trait TodoRepository: Send + Sync {
    fn list(&self) -> Vec<Todo>;
    fn get(&self, id: u64) -> Option<Todo>;
    fn insert(&self, title: String) -> Todo;
    fn complete(&self, id: u64) -> Option<Todo>;
    fn remove(&self, id: u64) -> bool;
}

#[derive(Default)]
struct InMemoryTodos {
    next_id: AtomicU64,
    items: RwLock<BTreeMap<u64, Todo>>,
}

impl TodoRepository for InMemoryTodos {
    fn list(&self) -> Vec<Todo> {
        self.items.read().values().cloned().collect()
    }

    fn get(&self, id: u64) -> Option<Todo> {
        self.items.read().get(&id).cloned()
    }

    fn insert(&self, title: String) -> Todo {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let todo = Todo { id, title, done: false };
        self.items.write().insert(id, todo.clone());
        todo
    }

    fn complete(&self, id: u64) -> Option<Todo> {
        let mut items = self.items.write();
        let todo = items.get_mut(&id)?;
        todo.done = true;
        Some(todo.clone())
    }

    fn remove(&self, id: u64) -> bool {
        self.items.write().remove(&id).is_some()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_todos(_req: Request, repo: Arc<dyn TodoRepository>) -> ApiResponse<Vec<Todo>> {
    ApiResponse::ok(repo.list())
}

async fn get_todo(Path(id): Path<u64>, repo: Arc<dyn TodoRepository>) -> Result<ApiResponse<Todo>, ApiError> {
    repo.get(id)
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::not_found(format!("todo {id} not found")))
}

async fn create_todo(Json(body): Json<NewTodo>, repo: Arc<dyn TodoRepository>) -> Result<ApiResponse<Todo>, ApiError> {
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("title is empty"));
    }
    Ok(ApiResponse::created(repo.insert(title.to_string())))
}

async fn complete_todo(Path(id): Path<u64>, repo: Arc<dyn TodoRepository>) -> Result<ApiResponse<Todo>, ApiError> {
    repo.complete(id)
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::not_found(format!("todo {id} not found")))
}

async fn delete_todo(Path(id): Path<u64>, repo: Arc<dyn TodoRepository>) -> Response {
    if repo.remove(id) {
        ApiResponse::ok(id).with_message("deleted").into_response()
    } else {
        ApiError::not_found(format!("todo {id} not found")).into_response()
    }
}

async fn hello(_req: Request, env: Arc<HostEnvironment>) -> ApiResponse<String> {
    ApiResponse::ok(format!("hello from {}", env.name()))
}

// ---------------------------------------------------------------------------
// Middleware and background service
// ---------------------------------------------------------------------------

/// The Swagger UI is a subtree, so it is exempted by prefix.
const SWAGGER_UI_PREFIX: &str = "/swagger/";

/// Requires `Authorization: Bearer <token>` except on public paths.
struct BearerAuth {
    token: String,
    public: SkipPaths,
}

impl BearerAuth {
    fn new(token: String) -> Self {
        Self {
            token,
            public: SkipPaths::new(["/hello", "/ping", HEALTH_PATH, OPENAPI_PATH]),
        }
    }
}

#[async_trait]
impl Middleware for BearerAuth {
    async fn handle(&self, request: Request, next: Next) -> Response {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented == Some(self.token.as_str()) {
            next.run(request).await
        } else {
            ApiError::unauthorized("missing or invalid bearer token").into_response()
        }
    }

    fn should_skip(&self, path: &str) -> bool {
        self.public.contains(path) || path == SWAGGER_PATH || path.starts_with(SWAGGER_UI_PREFIX)
    }
}

/// Logs the number of stored todos at start and stop.
struct TodoReporter {
    repo: Arc<dyn TodoRepository>,
}

#[async_trait]
impl BackgroundService for TodoReporter {
    fn name(&self) -> &str {
        "todo-reporter"
    }

    async fn start(&self, _ctx: &CancellationToken) -> anyhow::Result<()> {
        info!(todos = self.repo.list().len(), "todo reporter started");
        Ok(())
    }

    async fn stop(&self, _ctx: &CancellationToken) -> anyhow::Result<()> {
        info!(todos = self.repo.list().len(), "todo reporter stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn openapi() -> OpenApi {
    OpenApiBuilder::new()
        .info(InfoBuilder::new().title("todo demo").version(env!("CARGO_PKG_VERSION")))
        .build()
}

#[tokio::main]
async fn main() {
    let token = match std::env::var("AUTH_TOKEN") {
        Ok(token) if !token.is_empty() => token,
        _ => "dev-token".to_string(),
    };

    let built = WebHostBuilder::new()
        .configure(|host| {
            host.configure_app_configuration(|config| {
                config.add_yaml_file("./config.yaml");
            })
        })
        .configure_web_server(WebHostOptions::default())
        .configure_services(|services| {
            services
                .add_singleton::<dyn TodoRepository>(Arc::new(InMemoryTodos::default()))
                .add_background_service(|resolver| {
                    Ok(Arc::new(TodoReporter {
                        repo: resolver.require::<dyn TodoRepository>()?,
                    }))
                });
        })
        .use_middleware(BearerAuth::new(token))
        .use_health_check()
        .use_swagger(openapi())
        .use_cors(Vec::<String>::new())
        .map_get("/hello", hello)
        .map_get("/ping", || async { Json(serde_json::json!({ "message": "hello world" })) })
        .group("/todos", |todos| {
            todos
                .map_get("/", list_todos)
                .map_post("/", create_todo)
                .map_get("/:id", get_todo)
                .map_put("/:id/complete", complete_todo)
                .map_delete("/:id", delete_todo);
        })
        .build();

    let app = match built {
        Ok(app) => app,
        Err(err) => {
            eprintln!("failed to build application: {err}");
            std::process::exit(1);
        }
    };
    app.application().logger().try_init_global();

    if let Err(err) = app.run().await {
        eprintln!("application error: {err}");
        std::process::exit(1);
    }
}
