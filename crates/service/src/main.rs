use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use guideline_core::{
    AppConfig, Chunk, DocumentRecord, FinalResponse, GuidelineStore, LlmClient, LlmProvider,
    Settings, Workflow, WorkflowConfig,
};

const DEFAULT_TOP_K: usize = 3;
const MAX_TOP_K: usize = 20;

struct AppState {
    store: GuidelineStore,
    oracle: LlmClient,
    settings: Settings,
    workflow: WorkflowConfig,
}

// The blocking LLM client must be built and dropped outside the async runtime, so the
// runtime is created by hand after the state exists.
fn main() -> Result<(), anyhow::Error> {
    init_tracing();
    let config = AppConfig::load(None)?;
    let store = GuidelineStore::open(&config.settings.db_path)?;
    let oracle = build_oracle(&config.settings)?;
    let state = Arc::new(AppState {
        store,
        oracle,
        settings: config.settings,
        workflow: config.workflow,
    });
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(router(state), addr))
}

fn build_oracle(settings: &Settings) -> Result<LlmClient, anyhow::Error> {
    let oracle = settings.build_oracle().with_context(|| {
        format!(
            "refusing to start: llm provider {} is not configured (set GUIDELINE_PROVIDER=local to run offline)",
            settings.provider.as_str()
        )
    })?;
    if oracle.provider() == LlmProvider::Local {
        warn!("serving with the offline local responder");
    }
    info!(provider = oracle.provider().as_str(), model = oracle.model(), "llm provider ready");
    Ok(oracle)
}

async fn serve(app: Router, addr: SocketAddr) -> Result<(), anyhow::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/health/deep", get(handle_health_deep))
        .route("/document/:id", get(handle_document))
        .route("/search", post(handle_search))
        .route("/query", post(handle_query))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    top_k: Option<usize>,
    document_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<Chunk>,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    document_id: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct HealthChecks {
    env: &'static str,
    store: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    checks: HealthChecks,
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_health_deep(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let state = state.clone();
    let report = task::spawn_blocking(move || deep_health(&state))
        .await
        .unwrap_or_else(|_| HealthReport {
            status: "error",
            checks: HealthChecks {
                env: "unknown",
                store: "failed",
            },
        });
    Json(report)
}

async fn handle_document(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<DocumentRecord>, AppError> {
    let state = state.clone();
    let document = task::spawn_blocking(move || read_document(&state, &id))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(document))
}

async fn handle_search(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let state = state.clone();
    let response = task::spawn_blocking(move || run_search(&state, body))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(response))
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryRequest>,
) -> Result<Json<FinalResponse>, AppError> {
    let state = state.clone();
    let response = task::spawn_blocking(move || answer_query(&state, body))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(response))
}

fn deep_health(state: &AppState) -> HealthReport {
    let env = if state.settings.has_api_key() {
        "ok"
    } else {
        "missing_or_invalid"
    };
    let store = if state.settings.has_store() && state.store.ping() {
        "ok"
    } else {
        "failed"
    };
    let status = if env == "ok" && store == "ok" {
        "ok"
    } else {
        "error"
    };
    HealthReport {
        status,
        checks: HealthChecks { env, store },
    }
}

fn read_document(state: &AppState, id: &str) -> Result<DocumentRecord, AppError> {
    state
        .store
        .get_document(id)
        .map_err(AppError::internal)?
        .ok_or(AppError::NotFound("Document not found"))
}

fn run_search(state: &AppState, body: SearchRequest) -> Result<SearchResponse, AppError> {
    if body.query.is_empty() {
        return Err(AppError::unprocessable("query must not be empty"));
    }
    let top_k = body.top_k.unwrap_or(DEFAULT_TOP_K);
    if !(1..=MAX_TOP_K).contains(&top_k) {
        return Err(AppError::unprocessable(format!(
            "top_k must be between 1 and {MAX_TOP_K}"
        )));
    }
    let results = state
        .store
        .search_chunks(&body.query, top_k, body.document_id.as_deref())
        .map_err(AppError::internal)?;
    Ok(SearchResponse {
        query: body.query,
        results,
    })
}

fn answer_query(state: &AppState, body: QueryRequest) -> Result<FinalResponse, AppError> {
    if body.query.trim().is_empty() {
        return Err(AppError::unprocessable("query must not be empty"));
    }
    let workflow = Workflow::with_config(&state.store, &state.oracle, state.workflow);
    Ok(workflow.run(&body.query, body.document_id.as_deref()))
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    NotFound(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn unprocessable<E: ToString>(msg: E) -> Self {
        Self::Unprocessable(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match self {
            AppError::Unprocessable(msg) => msg,
            AppError::NotFound(msg) => msg.to_string(),
            AppError::Internal(err) => {
                error!("internal_error" = %format!("{err:#}"));
                "Internal server error".to_string()
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guideline_core::config::DEFAULT_DB;
    use guideline_core::{ChunkInsert, DocumentInsert};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn local_state() -> (TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let store = GuidelineStore::open(dir.path().join(DEFAULT_DB)).unwrap();
        store
            .upsert_document(&DocumentInsert {
                id: "doc_t2d".into(),
                title: Some("t2d.txt".into()),
                source: Some("documents/t2d.txt".into()),
            })
            .unwrap();
        for (position, (heading, content)) in [
            ("Diagnosis", "Diagnose with an HbA1c of 48 mmol/mol."),
            ("Treatment", "Offer metformin as first-line treatment."),
        ]
        .into_iter()
        .enumerate()
        {
            store
                .add_chunk(&ChunkInsert {
                    document_id: "doc_t2d".into(),
                    section_heading: heading.into(),
                    content: content.into(),
                    summary: None,
                    position_in_doc: position as u32,
                })
                .unwrap();
        }
        let settings = Settings {
            openai_api_key: None,
            anthropic_api_key: None,
            provider: LlmProvider::Local,
            model: "local".into(),
            db_path: store.path().to_path_buf(),
            env: "test".into(),
            llm_timeout: Duration::from_secs(1),
            llm_max_retries: 0,
        };
        let state = AppState {
            oracle: LlmClient::new(LlmProvider::Local, "local").unwrap(),
            store,
            settings,
            workflow: WorkflowConfig::default(),
        };
        (dir, state)
    }

    #[test]
    fn deep_health_reports_each_check() {
        let (_dir, mut state) = local_state();
        let report = deep_health(&state);
        assert_eq!(report.status, "ok");

        state.settings.provider = LlmProvider::OpenAi;
        state.settings.db_path = PathBuf::new();
        let report = deep_health(&state);
        assert_eq!(report.status, "error");
        assert_eq!(
            report.checks,
            HealthChecks {
                env: "missing_or_invalid",
                store: "failed"
            }
        );
    }

    #[test]
    fn unknown_document_is_not_found() {
        let (_dir, state) = local_state();
        assert_eq!(read_document(&state, "doc_t2d").unwrap().title.as_deref(), Some("t2d.txt"));
        let err = read_document(&state, "doc_missing").unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn search_validates_its_request() {
        let (_dir, state) = local_state();
        let request = |query: &str, top_k: Option<usize>| SearchRequest {
            query: query.to_string(),
            top_k,
            document_id: None,
        };
        let err = run_search(&state, request("", None)).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        for top_k in [0, 21] {
            let err = run_search(&state, request("metformin", Some(top_k))).unwrap_err();
            assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        }
        let hits = run_search(&state, request("METFORMIN", None)).unwrap();
        assert_eq!(hits.query, "METFORMIN");
        assert_eq!(hits.results.len(), 1);
        assert_eq!(hits.results[0].section_heading, "Treatment");
    }

    #[test]
    fn query_runs_the_workflow() {
        let (_dir, state) = local_state();
        let err = answer_query(
            &state,
            QueryRequest {
                query: "  ".into(),
                document_id: None,
            },
        )
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = answer_query(
            &state,
            QueryRequest {
                query: "first-line treatment for Type 2 diabetes".into(),
                document_id: Some("doc_t2d".into()),
            },
        )
        .unwrap();
        assert!(!response.is_insufficient());
        assert!(!response.citations.is_empty());
    }

    #[test]
    fn missing_credentials_block_startup() {
        let (_dir, mut state) = local_state();
        assert_eq!(
            build_oracle(&state.settings).unwrap().provider(),
            LlmProvider::Local
        );
        state.settings.provider = LlmProvider::OpenAi;
        let Err(err) = build_oracle(&state.settings) else {
            panic!("expected build_oracle to fail without credentials");
        };
        assert!(format!("{err:#}").contains("refusing to start"));
        state.settings.provider = LlmProvider::Anthropic;
        assert!(build_oracle(&state.settings).is_err());
    }

    #[test]
    fn unsupported_query_gets_the_fallback() {
        let (_dir, state) = local_state();
        let response = answer_query(
            &state,
            QueryRequest {
                query: "paediatric insulin pump settings for ketoacidosis".into(),
                document_id: Some("doc_t2d".into()),
            },
        )
        .unwrap();
        assert!(response.is_insufficient());
        assert!(response.citations.is_empty());
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let response = AppError::internal(anyhow::anyhow!("disk I/O error at /var/db")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
