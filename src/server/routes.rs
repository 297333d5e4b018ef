use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use super::AppState;
use super::middleware;
use crate::error::ProviderError;
use crate::types::{InitializeRequest, ProjectRequest, WorkspaceRequest};

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async {
            Json(json!({
                "status": "ok",
            }))
        }),
    );

    let workspace_routes = Router::new()
        .route("/create", post(create_workspace))
        .route("/start", post(start_workspace))
        .route("/stop", post(stop_workspace))
        .route("/destroy", post(destroy_workspace))
        .route("/info", post(workspace_info));

    let project_routes = Router::new()
        .route("/create", post(create_project))
        .route("/start", post(start_project))
        .route("/stop", post(stop_project))
        .route("/destroy", post(destroy_project))
        .route("/info", post(project_info));

    Router::new()
        .nest("/health", health_routes)
        .route("/initialize", post(initialize))
        .route("/info", get(info))
        .route("/target-manifest", get(target_manifest))
        .route("/default-targets", get(default_targets))
        .nest("/workspaces", workspace_routes)
        .nest("/projects", project_routes)
        .fallback(not_found)
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(middleware::request_span))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

pub(crate) fn status_for(err: &ProviderError) -> StatusCode {
    match err {
        ProviderError::NotInitialized => StatusCode::PRECONDITION_FAILED,
        e if e.is_configuration() => StatusCode::BAD_REQUEST,
        ProviderError::NotFound(_) => StatusCode::NOT_FOUND,
        ProviderError::DialTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: ProviderError) -> (StatusCode, Json<Value>) {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "provider call failed");
    }
    (status, Json(json!({ "error": err.to_string() })))
}

fn done(result: Result<(), ProviderError>) -> ApiResult {
    result.map_err(error_response)?;
    Ok(Json(json!({ "ok": true })))
}

// --- Provider ---

async fn initialize(State(state): State<AppState>, Json(req): Json<InitializeRequest>) -> ApiResult {
    done(state.provider.initialize(req).await)
}

async fn info(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.provider.info()))
}

async fn target_manifest(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.provider.target_manifest()))
}

async fn default_targets(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.provider.default_targets()))
}

// --- Workspaces ---

#[tracing::instrument(skip_all, fields(workspace_id = %req.workspace.id))]
async fn create_workspace(State(state): State<AppState>, Json(req): Json<WorkspaceRequest>) -> ApiResult {
    done(state.provider.create_workspace(&req).await)
}

#[tracing::instrument(skip_all, fields(workspace_id = %req.workspace.id))]
async fn start_workspace(State(state): State<AppState>, Json(req): Json<WorkspaceRequest>) -> ApiResult {
    done(state.provider.start_workspace(&req).await)
}

#[tracing::instrument(skip_all, fields(workspace_id = %req.workspace.id))]
async fn stop_workspace(State(state): State<AppState>, Json(req): Json<WorkspaceRequest>) -> ApiResult {
    done(state.provider.stop_workspace(&req).await)
}

#[tracing::instrument(skip_all, fields(workspace_id = %req.workspace.id))]
async fn destroy_workspace(State(state): State<AppState>, Json(req): Json<WorkspaceRequest>) -> ApiResult {
    done(state.provider.destroy_workspace(&req).await)
}

#[tracing::instrument(skip_all, fields(workspace_id = %req.workspace.id))]
async fn workspace_info(State(state): State<AppState>, Json(req): Json<WorkspaceRequest>) -> ApiResult {
    let info = state
        .provider
        .get_workspace_info(&req)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(info)))
}

// --- Projects ---

#[tracing::instrument(skip_all, fields(project = %req.project.name))]
async fn create_project(State(state): State<AppState>, Json(req): Json<ProjectRequest>) -> ApiResult {
    done(state.provider.create_project(&req).await)
}

#[tracing::instrument(skip_all, fields(project = %req.project.name))]
async fn start_project(State(state): State<AppState>, Json(req): Json<ProjectRequest>) -> ApiResult {
    done(state.provider.start_project(&req).await)
}

#[tracing::instrument(skip_all, fields(project = %req.project.name))]
async fn stop_project(State(state): State<AppState>, Json(req): Json<ProjectRequest>) -> ApiResult {
    done(state.provider.stop_project(&req).await)
}

#[tracing::instrument(skip_all, fields(project = %req.project.name))]
async fn destroy_project(State(state): State<AppState>, Json(req): Json<ProjectRequest>) -> ApiResult {
    done(state.provider.destroy_project(&req).await)
}

#[tracing::instrument(skip_all, fields(project = %req.project.name))]
async fn project_info(State(state): State<AppState>, Json(req): Json<ProjectRequest>) -> ApiResult {
    let info = state
        .provider
        .get_project_info(&req)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(info)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use crate::compute::Instance;
    use crate::provider::{Collaborators, EnvLookup, GcpProvider};
    use crate::testing::{FakeCompute, FakeConnector, FakeRuntime, FakeRuntimeFactory, FakeSessions, FakeTunnel};
    use crate::tunnel::DialWaitPolicy;

    fn provider(env: EnvLookup) -> GcpProvider {
        let collaborators = Collaborators {
            compute: Arc::new(FakeCompute {
                instance: Instance {
                    id: 42,
                    name: "daytona-ws1".into(),
                    zone: "projects/p/zones/europe-west1-b".into(),
                    ..Default::default()
                },
                ..Default::default()
            }),
            connector: Arc::new(FakeConnector::new(Arc::new(FakeTunnel::new(true)))),
            runtimes: Arc::new(FakeRuntimeFactory::new(Arc::new(FakeRuntime::default()))),
            sessions: Arc::new(FakeSessions::default()),
            dial_policy: DialWaitPolicy::new(
                std::time::Duration::from_millis(10),
                std::time::Duration::from_millis(100),
            ),
        };
        GcpProvider::new(collaborators).with_env(env)
    }

    fn with_credentials() -> EnvLookup {
        Arc::new(|key: &str| match key {
            "GCP_CREDENTIAL_FILE" => Some("/secrets/sa.json".to_string()),
            "GCP_PROJECT_ID" => Some("my-project".to_string()),
            _ => None,
        })
    }

    async fn serve(provider: GcpProvider) -> String {
        let app = build_router(AppState {
            provider: Arc::new(provider),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn workspace_body() -> Value {
        json!({
            "targetOptions": r#"{"Zone": "europe-west1-b"}"#,
            "workspace": { "id": "ws1", "name": "demo" }
        })
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(status_for(&ProviderError::NotInitialized), StatusCode::PRECONDITION_FAILED);
        assert_eq!(status_for(&ProviderError::MissingProjectId), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&ProviderError::MissingCredentialFile), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&ProviderError::InvalidTargetOptions("eof".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ProviderError::InvalidEnvVar("1BAD".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&ProviderError::NotFound("vm".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ProviderError::DialTimeout { minutes: 10.0 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&ProviderError::Compute("quota".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn health_and_info() {
        let base = serve(provider(with_credentials())).await;
        let client = reqwest::Client::new();

        let health: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "ok");

        let info: Value = client.get(format!("{base}/info")).send().await.unwrap().json().await.unwrap();
        assert_eq!(info["name"], "gcp-provider");

        let manifest: Value = client
            .get(format!("{base}/target-manifest"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(manifest["Zone"]["defaultValue"], "us-central1-a");
        assert_eq!(manifest["Project Id"]["inputMasked"], true);

        let targets: Value = client
            .get(format!("{base}/default-targets"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(targets, json!([]));
    }

    #[tokio::test]
    async fn lifecycle_before_initialize_is_precondition_failed() {
        let base = serve(provider(with_credentials())).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/workspaces/create"))
            .json(&workspace_body())
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(
            body["error"],
            "download URL not set. Did you forget to call initialize?"
        );
    }

    #[tokio::test]
    async fn missing_credentials_is_bad_request() {
        let base = serve(provider(Arc::new(|_: &str| None))).await;
        let client = reqwest::Client::new();
        client
            .post(format!("{base}/initialize"))
            .json(&json!({ "downloadUrl": "https://download.example/get-agent.sh" }))
            .send()
            .await
            .unwrap();

        let resp = client
            .post(format!("{base}/workspaces/create"))
            .json(&workspace_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "credential file not set in env/target options");
    }

    #[tokio::test]
    async fn create_then_info_over_http() {
        let base = serve(provider(with_credentials())).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/initialize"))
            .json(&json!({ "downloadUrl": "https://download.example/get-agent.sh", "networkKey": "tskey" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = client
            .post(format!("{base}/workspaces/create"))
            .json(&workspace_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let info: Value = client
            .post(format!("{base}/workspaces/info"))
            .json(&workspace_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["name"], "demo");
        let metadata: Value = serde_json::from_str(info["providerMetadata"].as_str().unwrap()).unwrap();
        assert_eq!(metadata["location"], "europe-west1-b");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let base = serve(provider(with_credentials())).await;
        let resp = reqwest::get(format!("{base}/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trailing_slash_redirects() {
        let base = serve(provider(with_credentials())).await;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        let resp = client.get(format!("{base}/info/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(resp.headers()["location"], "/info");
    }
}
