use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ConfigResolver;
use crate::device::PlotterDriver;
use crate::gate::DeviceGate;
use crate::messages::StatusReport;
use crate::plotter::{JobError, PlotJob};
use crate::probe::StatusProbe;
use crate::settings::Settings;

/// Shared handler state. The gate, driver, and resolver are process-wide
/// singletons, constructed once in `main` and injected here.
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<dyn PlotterDriver>,
    pub gate: DeviceGate,
    pub resolver: Arc<ConfigResolver>,
    pub probe: Arc<StatusProbe>,
    pub settings: Arc<Settings>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/plot/{file}", get(plot_file))
        .route("/plot", post(plot_upload))
        .route("/status", get(status_text))
        .route("/status.json", get(status_json))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PlotQuery {
    #[serde(default)]
    layer: u32,
}

/// Lists the plottable files in the artwork root.
async fn index(State(state): State<AppState>) -> Response {
    match list_art_files(&state.settings.art_dir).await {
        Ok(files) => Json(files).into_response(),
        Err(e) => {
            tracing::error!("Failed to list artwork directory: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Artwork directory unavailable",
            )
                .into_response()
        }
    }
}

async fn plot_file(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
    Query(query): Query<PlotQuery>,
) -> Response {
    let Some(name) = sanitize_file_name(&file) else {
        return (StatusCode::BAD_REQUEST, "Invalid file name").into_response();
    };
    let source = state.settings.art_dir.join(name);
    if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
        return (StatusCode::NOT_FOUND, "File Not Found").into_response();
    }
    run_plot(&state, source, query.layer).await
}

async fn plot_upload(
    State(state): State<AppState>,
    Query(query): Query<PlotQuery>,
    mut multipart: Multipart,
) -> Response {
    let mut saved: Option<PathBuf> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("Malformed upload: {}", e))
                    .into_response()
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let Some(file_name) = field
            .file_name()
            .map(str::to_owned)
            .filter(|name| !name.is_empty())
        else {
            return (StatusCode::BAD_REQUEST, "No selected file").into_response();
        };
        let Some(name) = sanitize_file_name(&file_name).map(str::to_owned) else {
            return (StatusCode::BAD_REQUEST, "Invalid file name").into_response();
        };

        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("Malformed upload: {}", e))
                    .into_response()
            }
        };

        let path = state.settings.upload_dir.join(name);
        if let Err(e) = save_upload(&path, &bytes).await {
            tracing::error!("Failed to save upload {}: {}", path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload").into_response();
        }
        tracing::info!("Stored upload at {}", path.display());
        saved = Some(path);
        break;
    }

    let Some(source) = saved else {
        return (StatusCode::BAD_REQUEST, "No file part").into_response();
    };
    run_plot(&state, source, query.layer).await
}

async fn status_text(State(state): State<AppState>) -> Response {
    let response = match run_probe(&state).await {
        Some(report) => (StatusCode::OK, report.status.as_str()).into_response(),
        None => busy_response(),
    };
    no_cache(response)
}

async fn status_json(State(state): State<AppState>) -> Response {
    let response = match run_probe(&state).await {
        Some(report) => Json(report).into_response(),
        None => busy_response(),
    };
    no_cache(response)
}

/// Execute one plot request under the device gate.
///
/// The job runs in a task detached from the connection: a client disconnect
/// must not interrupt device motion mid-plot, and the gate pass travels with
/// the job so it is released when the job finishes, not when the request
/// future is dropped.
async fn run_plot(state: &AppState, source: PathBuf, layer: u32) -> Response {
    let Some(pass) = state.gate.acquire(state.settings.gate_wait).await else {
        return busy_response();
    };

    let profile = state.resolver.resolve(state.settings.default_model).await;
    let driver = state.driver.clone();
    let handle = tokio::spawn(async move {
        let _pass = pass;
        let mut job = PlotJob::new(source, layer, profile);
        job.execute(driver.as_ref()).await
    });

    match handle.await {
        Ok(Ok(layer)) => (StatusCode::OK, format!("Done: {}", layer)).into_response(),
        Ok(Err(JobError::SourceMissing(_))) => {
            (StatusCode::NOT_FOUND, "File Not Found").into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("Plot job failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Plot failed: {}", e),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Plot task panicked: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Plot failed").into_response()
        }
    }
}

/// Probe under the gate, detached from the connection for the same reason as
/// plots: the probe must always get to close the session it opened. `None`
/// means the gate stayed busy.
async fn run_probe(state: &AppState) -> Option<StatusReport> {
    let pass = state.gate.acquire(state.settings.gate_wait).await?;
    let probe = state.probe.clone();
    let handle = tokio::spawn(async move {
        let _pass = pass;
        probe.probe().await
    });
    Some(handle.await.unwrap_or_else(|e| {
        tracing::error!("Status probe task panicked: {}", e);
        StatusReport::off()
    }))
}

fn busy_response() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Busy").into_response()
}

/// Power state is physical and changes behind the server's back; forbid any
/// caching of status responses.
fn no_cache(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, public, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

/// Reduce a client-supplied name to a single plain file name. Anything that
/// could escape the artwork or upload root is rejected.
fn sanitize_file_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.contains('\\') {
        return None;
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(name),
        _ => None,
    }
}

async fn list_art_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

async fn save_upload(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDriver;
    use std::collections::HashMap;
    use tokio::time::Duration;

    fn test_state(driver: FakeDriver, art_dir: &Path) -> (AppState, Arc<FakeDriver>) {
        let driver = Arc::new(driver);
        let resolver = Arc::new(ConfigResolver::new(HashMap::new()));
        let settings = Arc::new(Settings {
            art_dir: art_dir.to_path_buf(),
            upload_dir: art_dir.join("uploads"),
            default_model: 1,
            model_configs: HashMap::new(),
            device_port: None,
            bind: "127.0.0.1:0".parse().unwrap(),
            gate_wait: Duration::from_millis(50),
        });
        let probe = Arc::new(StatusProbe::new(
            driver.clone(),
            resolver.clone(),
            settings.default_model,
        ));
        (
            AppState {
                driver: driver.clone(),
                gate: DeviceGate::new(),
                resolver,
                probe,
                settings,
            },
            driver,
        )
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn sanitize_accepts_plain_names_only() {
        assert_eq!(sanitize_file_name("drawing.svg"), Some("drawing.svg"));
        assert_eq!(sanitize_file_name("a b.plot"), Some("a b.plot"));
        assert_eq!(sanitize_file_name(""), None);
        assert_eq!(sanitize_file_name("../secrets"), None);
        assert_eq!(sanitize_file_name("nested/drawing.svg"), None);
        assert_eq!(sanitize_file_name("/etc/passwd"), None);
        assert_eq!(sanitize_file_name("..\\windows"), None);
        assert_eq!(sanitize_file_name("."), None);
    }

    #[test]
    fn no_cache_sets_the_full_header_set() {
        let response = no_cache((StatusCode::OK, "off").into_response());
        let headers = response.headers();
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "no-store, no-cache, must-revalidate, public, max-age=0"
        );
        assert_eq!(headers.get(header::PRAGMA).unwrap(), "no-cache");
        assert_eq!(headers.get(header::EXPIRES).unwrap(), "0");
    }

    #[tokio::test]
    async fn plot_request_succeeds_and_reports_layer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("drawing.svg"), "SP,1\n").unwrap();
        let (state, driver) = test_state(FakeDriver::default(), dir.path());

        let response = plot_file(
            State(state),
            UrlPath("drawing.svg".to_string()),
            Query(PlotQuery { layer: 2 }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Done: 2");
        assert!(driver.calls().contains(&"plot layer=2".to_string()));
    }

    #[tokio::test]
    async fn plot_request_for_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (state, driver) = test_state(FakeDriver::default(), dir.path());

        let response = plot_file(
            State(state),
            UrlPath("missing.svg".to_string()),
            Query(PlotQuery { layer: 0 }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn plot_request_while_gate_held_is_busy_and_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("drawing.svg"), "SP,1\n").unwrap();
        let (state, driver) = test_state(FakeDriver::default(), dir.path());

        let held = state.gate.acquire(Duration::from_millis(10)).await.unwrap();
        let response = plot_file(
            State(state.clone()),
            UrlPath("drawing.svg".to_string()),
            Query(PlotQuery { layer: 2 }),
        )
        .await;
        drop(held);

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "Busy");
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn status_while_gate_held_is_busy_with_no_cache_headers() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _driver) = test_state(FakeDriver::default(), dir.path());

        let held = state.gate.acquire(Duration::from_millis(10)).await.unwrap();
        let response = status_text(State(state.clone())).await;
        drop(held);

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::CACHE_CONTROL));
    }

    #[tokio::test]
    async fn status_json_with_no_device_reports_off() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _driver) = test_state(FakeDriver::default(), dir.path());

        let response = status_json(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::CACHE_CONTROL));

        let value: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["status"], "off");
        assert_eq!(value["machine"], "none");
        assert!(value["model_number"].is_null());
        assert_eq!(value["config"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn status_text_reports_power_state() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _driver) = test_state(
            FakeDriver {
                devices: vec!["v3-desk".to_string()],
                query_reply: Some("0100,0280".to_string()),
                ..Default::default()
            },
            dir.path(),
        );

        let response = status_text(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "on");
    }

    #[tokio::test]
    async fn index_lists_artwork() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.svg"), "").unwrap();
        std::fs::write(dir.path().join("a.svg"), "").unwrap();
        let (state, _driver) = test_state(FakeDriver::default(), dir.path());

        let response = index(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value, serde_json::json!(["a.svg", "b.svg"]));
    }

    #[tokio::test]
    async fn save_upload_creates_the_upload_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uploads").join("drawing.svg");
        save_upload(&path, b"SP,1\n").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"SP,1\n");
    }
}
