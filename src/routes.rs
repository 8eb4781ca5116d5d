//! Route definitions and router setup
//!
//! Read-only status API over tasks and synced schemas.

mod database;
mod task;

use crate::config::CorsConfig;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, cors: &CorsConfig) -> Router {
    let cors = build_cors_layer(cors);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))
        .route("/api/tasks/{id}", get(task::get_task))
        .route("/api/databases/{id}/schema", get(database::get_schema))
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    let origins: Vec<_> = cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Runner is up.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverRegistry;
    use crate::models::{
        ConnectionConfig, DatabaseCreate, InstanceCreate, TaskCreate, TaskType, DEFAULT_PROJECT_ID, SYSTEM_BOT_ID,
    };
    use crate::schema::SchemaSnapshot;
    use crate::state::AppState;
    use crate::store::{MemoryStore, Store};
    use crate::task::scheduler::SchedulerConfig;
    use crate::task::{ExecutorContext, ExecutorRegistry, Scheduler};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(store: Arc<MemoryStore>) -> Router {
        let ctx = ExecutorContext {
            store: store.clone(),
            drivers: Arc::new(DriverRegistry::new()),
            release_version: "2.0.0".to_string(),
            require_issue_lineage: false,
            pending_migration_timeout: Duration::from_secs(60),
        };
        let scheduler = Scheduler::new(
            Arc::new(ctx),
            Arc::new(ExecutorRegistry::with_builtins()),
            SchedulerConfig {
                interval: Duration::from_millis(10),
                max_concurrent_tasks: 1,
                task_poll_interval: Duration::from_millis(10),
            },
        );
        let state = Arc::new(AppState::new(store, scheduler));
        create_router(state, &CorsConfig { allowed_origins: vec![] })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        assert!(response.headers().contains_key("x-request-id"));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, body) = get_json(app(Arc::new(MemoryStore::new())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_task_status() {
        let store = Arc::new(MemoryStore::new());
        let instance = store
            .create_instance(&InstanceCreate {
                name: "prod-pg".to_string(),
                environment_id: 1,
                environment_name: "prod".to_string(),
                connection: ConnectionConfig::from_url("postgres://u@db").unwrap(),
            })
            .await
            .unwrap();
        let task = store
            .create_task(&TaskCreate {
                pipeline_id: 3,
                instance_id: instance.id,
                database_id: None,
                name: "Create app".to_string(),
                task_type: TaskType::DatabaseCreate,
                payload: "{}".to_string(),
                creator_id: SYSTEM_BOT_ID,
            })
            .await
            .unwrap();

        let (status, body) = get_json(app(store.clone()), &format!("/api/tasks/{}", task.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task"]["id"], task.id);
        assert_eq!(body["completed"], false);
        assert_eq!(body["progress"]["totalUnit"], 0);

        let (status, body) = get_json(app(store), "/api/tasks/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_schema_requires_a_sync() {
        let store = Arc::new(MemoryStore::new());
        let instance = store
            .create_instance(&InstanceCreate {
                name: "prod-pg".to_string(),
                environment_id: 1,
                environment_name: "prod".to_string(),
                connection: ConnectionConfig::from_url("postgres://u@db").unwrap(),
            })
            .await
            .unwrap();
        let db = store
            .create_database(&DatabaseCreate {
                creator_id: SYSTEM_BOT_ID,
                project_id: DEFAULT_PROJECT_ID,
                instance_id: instance.id,
                environment_id: 1,
                name: "app".to_string(),
                character_set: "UTF8".to_string(),
                collation: "C".to_string(),
                schema_version: String::new(),
            })
            .await
            .unwrap();
        let uri = format!("/api/databases/{}/schema", db.id);

        let (status, _) = get_json(app(store.clone()), &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let snapshot = SchemaSnapshot::new("app", "UTF8", "C", vec![], vec![], vec![]);
        store.save_schema(db.id, &snapshot).await.unwrap();
        let (status, body) = get_json(app(store), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"]["name"], "app");
        assert_eq!(body["schema"]["checksum"], snapshot.checksum.as_str());
    }
}
