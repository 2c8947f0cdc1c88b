use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Query, Request, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    cache::{CacheStats, MetadataCache},
    config::{Config, DownloadPolicy},
    download::{DownloadError, DownloadOrchestrator, DownloadRequest, Payload},
    error::ApiError,
    filename::{build_content_disposition, download_filename},
    identifier::extract_video_id,
    metadata::{LookupError, MediaKind, MetadataFetcher, MetadataRecord},
    rate_limit::RateLimiter,
    tools::{ToolProbe, ToolStatus},
};

const INVALID_URL_MESSAGE: &str = "URL invalida. Usa un enlace de YouTube.";
const INVALID_BODY_MESSAGE: &str = "Solicitud invalida. Envia un JSON con el campo url.";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<MetadataCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub fetcher: MetadataFetcher,
    pub orchestrator: Arc<DownloadOrchestrator>,
    pub tools: Arc<ToolProbe>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, http_client: reqwest::Client) -> Self {
        let tools = Arc::new(ToolProbe::new(
            config.yt_dlp_path.clone(),
            config.ffmpeg_path.clone(),
        ));

        Self {
            cache: Arc::new(MetadataCache::new()),
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit_window,
                config.rate_limit_max,
            )),
            fetcher: MetadataFetcher::new(http_client, &config, Arc::clone(&tools)),
            orchestrator: Arc::new(DownloadOrchestrator::new(&config)),
            tools,
            started_at: Instant::now(),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config.allowed_origins)?;

    let api = Router::new()
        .route("/video-info", post(video_info))
        .route("/download", get(download))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ))
        .route("/health", get(health));

    Ok(Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

#[derive(Debug, Deserialize)]
pub struct VideoInfoRequest {
    #[serde(default)]
    url: String,
}

pub async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<VideoInfoRequest>, JsonRejection>,
) -> Result<Json<MetadataRecord>, ApiError> {
    let Json(payload) = payload.map_err(|rejection| {
        debug!("Cuerpo de /api/video-info rechazado: {}", rejection.body_text());
        ApiError::bad_request(INVALID_BODY_MESSAGE)
    })?;
    let url = payload.url.trim();
    let video_id = extract_video_id(url).ok_or_else(|| ApiError::bad_request(INVALID_URL_MESSAGE))?;

    if let Some(record) = state.cache.get(&video_id) {
        debug!("Metadatos servidos desde cache para {video_id}");
        let mut record = (*record).clone();
        record.cached = true;
        return Ok(Json(record));
    }

    let record = state.fetcher.fetch(url).await.map_err(|error| match error {
        LookupError::InvalidUrl => ApiError::bad_request(INVALID_URL_MESSAGE),
        other => ApiError::internal(format!("No se pudo obtener informacion del video: {other}")),
    })?;

    state
        .cache
        .put(video_id, record.clone(), state.config.cache_ttl);
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    url: Option<String>,
    itag: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let url = query.url.as_deref().unwrap_or_default().trim().to_string();
    let video_id = extract_video_id(&url).ok_or_else(|| ApiError::bad_request(INVALID_URL_MESSAGE))?;
    let kind = MediaKind::from_query(query.kind.as_deref());

    let title = match state.cache.get(&video_id) {
        Some(record) => record.title.clone(),
        None => state.fetcher.title_for(&video_id).await,
    };

    let request = DownloadRequest {
        url,
        itag: query.itag.unwrap_or_default(),
        kind,
        title,
        video_id,
    };
    info!(
        "Descarga solicitada: id={} itag={:?} tipo={:?}",
        request.video_id, request.itag, request.kind
    );

    let prepared = state
        .orchestrator
        .prepare(&request)
        .await
        .map_err(|error| match error {
            DownloadError::RealDownloadFailed(attempt) => {
                ApiError::bad_gateway(format!("No se pudo descargar el video: {attempt}"))
            }
        })?;

    let filename = download_filename(&request.title, &request.video_id, kind);
    let method = prepared.result.method;
    let byte_count = prepared.result.byte_count;
    if let Some(path) = &prepared.result.path {
        debug!("Archivo preparado en {:?}", path);
    }

    let body = match prepared.payload {
        Payload::Staged(staged) => staged.into_body().await.map_err(|error| {
            ApiError::internal(format!("No se pudo leer el archivo temporal: {error}"))
        })?,
        Payload::Buffer(bytes) => Body::from(bytes),
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(kind.content_type()));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(byte_count));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        HeaderName::from_static("x-download-filename"),
        HeaderValue::from_str(&filename)
            .map_err(|_| ApiError::internal("No se pudo crear el nombre del archivo."))?,
    );
    headers.insert(
        HeaderName::from_static("x-download-method"),
        HeaderValue::from_static(method.as_str()),
    );

    info!(
        "Enviando {filename} ({byte_count} bytes, metodo {})",
        method.as_str()
    );
    Ok((headers, body).into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    rss_bytes: u64,
    virtual_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    status: &'static str,
    timestamp: String,
    uptime_seconds: u64,
    memory: MemoryUsage,
    cache: CacheStats,
    tools: ToolStatus,
    policy: DownloadPolicy,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        memory: process_memory(),
        cache: state.cache.stats(),
        tools: state.tools.status().await,
        policy: state.config.policy,
    })
}

fn process_memory() -> MemoryUsage {
    let mut system = sysinfo::System::new();
    let Ok(pid) = sysinfo::get_current_pid() else {
        return MemoryUsage {
            rss_bytes: 0,
            virtual_bytes: 0,
        };
    };

    system.refresh_process(pid);
    system
        .process(pid)
        .map(|process| MemoryUsage {
            rss_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
        })
        .unwrap_or(MemoryUsage {
            rss_bytes: 0,
            virtual_bytes: 0,
        })
}

async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client_ip = client_ip_for_request(&state, &request);

    let admission = state.rate_limiter.check(&client_ip).map_err(|rejection| {
        warn!("Limite de solicitudes alcanzado para {client_ip}");
        ApiError::rate_limited(
            state.rate_limiter.window().as_secs().div_ceil(60),
            rejection.retry_after_seconds(),
        )
    })?;

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("ratelimit-limit"),
        HeaderValue::from(admission.limit),
    );
    headers.insert(
        HeaderName::from_static("ratelimit-remaining"),
        HeaderValue::from(admission.remaining),
    );
    headers.insert(
        HeaderName::from_static("ratelimit-reset"),
        HeaderValue::from(admission.reset_after.as_secs()),
    );
    Ok(response)
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(state: &AppState, request: &Request) -> String {
    let socket_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if state.config.trust_proxy_headers {
        extract_client_ip(request.headers()).unwrap_or(socket_ip)
    } else {
        socket_ip
    }
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static("x-download-filename"),
            HeaderName::from_static("x-download-method"),
        ]);

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS no esta configurado. Se aceptaran solicitudes de cualquier origen.");
        return Ok(layer.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list cargada con {} origen(es): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    Ok(layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        },
    )))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port().filter(|port| *port != default_port) {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}
