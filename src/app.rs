use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use humantime::format_duration;
use serde::Deserialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tower_http::services::ServeDir;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::config::Config;
use crate::config::ConfigError;
use crate::config::ProxySettings;
use crate::error::ProxyError;
use crate::metadata::MemoryMetadataStore;
use crate::metadata::MetadataStore;
use crate::pipe;
use crate::range::RangePlanner;
use crate::range::RangeRequest;
use crate::upstream::MediaId;
use crate::upstream::Upstream;

#[derive(Clone)]
pub struct ServerState {
    upstream: Arc<dyn Upstream>,
    metadata: Arc<dyn MetadataStore>,
    planner: RangePlanner,
    settings: ProxySettings,
}

impl ServerState {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        metadata: Arc<dyn MetadataStore>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            upstream,
            metadata,
            planner: RangePlanner::new(settings.open_ended_window),
            settings,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.upstream()?,
            Arc::new(MemoryMetadataStore::default()),
            config.proxy_settings(),
        ))
    }
}

pub fn app(state: ServerState, static_dir: Option<&FsPath>) -> Router {
    let router = Router::new()
        .route("/media/{*id}", get(serve_media).head(serve_media))
        .route("/api/raw/{*id}", get(serve_media).head(serve_media))
        .route("/api/metadata", post(save_metadata))
        .route("/api/metadata/{*filename}", get(load_metadata));

    let router = match static_dir {
        Some(static_dir) => router.fallback_service(ServeDir::new(static_dir)),
        None => router,
    };

    router
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    tracing::info_span!(
                        "req",
                        status = tracing::field::Empty,
                        path = &tracing::field::display(request.uri()),
                        latency = tracing::field::Empty,
                    )
                })
                .on_request(|_request: &Request<_>, _span: &Span| {
                    tracing::debug!("Incoming request");
                })
                .on_response(|response: &Response, latency: Duration, span: &Span| {
                    span.record("status", &tracing::field::display(response.status()));
                    span.record("latency", format_duration(latency).to_string());

                    tracing::info!("Finished request");
                }),
        )
        // streams are bounded by the per-chunk read timeout instead of a response timeout
        .layer(RequestBodyTimeoutLayer::new(Duration::from_secs(5)))
}

async fn serve_media(
    State(state): State<ServerState>,
    method: Method,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let id = MediaId::parse(&id)?;
    let range = RangeRequest::from_headers(&headers);

    let upstream_timeout = state.settings.upstream_timeout;
    let descriptor = tokio::time::timeout(upstream_timeout, state.upstream.describe(&id))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout(upstream_timeout))??;

    if !descriptor.exists {
        return Err(ProxyError::NotFound);
    }

    let plan = state.planner.plan(&range, descriptor.size)?;

    tracing::debug!(
        "Planned {} for {id} (range {:?}, size {:?})",
        plan.status(),
        range.raw(),
        descriptor.size
    );

    if method == Method::HEAD {
        return Ok(pipe::head(&plan, &descriptor));
    }

    pipe::open(
        state.upstream.as_ref(),
        &id,
        &descriptor,
        &plan,
        &state.settings,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct SaveMetadata {
    #[serde(default)]
    filename: Option<String>,

    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

async fn save_metadata(
    State(state): State<ServerState>,
    Json(payload): Json<SaveMetadata>,
) -> Response {
    let filename = payload.filename.filter(|filename| !filename.is_empty());
    let metadata = payload.metadata.filter(|metadata| !metadata.is_empty());

    let (Some(filename), Some(metadata)) = (filename, metadata) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "Missing filename or metadata" })),
        )
            .into_response();
    };

    state.metadata.put(filename.clone(), metadata).await;

    Json(json!({ "status": "success", "filename": filename })).into_response()
}

async fn load_metadata(
    State(state): State<ServerState>,
    Path(filename): Path<String>,
) -> Json<Map<String, Value>> {
    Json(state.metadata.get(&filename).await.unwrap_or_default())
}
