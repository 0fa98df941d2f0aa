use std::convert::Infallible;
use std::sync::Arc;

use base64::Engine;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use tokio::sync::watch;

use crate::config::{self, validate_output_url, IngestCfg, SrtSettings};
use crate::errors::{ErrorHandler, RelayError};
use crate::metrics::RelayMetrics;
use crate::registry::Registry;

/// Request bodies are capped the way the original capped them.
const MAX_BODY: usize = 1024 * 1024;

/// HTTP control plane: ingest/output CRUD, status, settings. Optional
/// Basic auth covers every /api route.
pub struct ApiServer {
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct OutputRef {
    name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct UpdateOutputsRequest {
    name: String,
    outputs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    #[serde(default)]
    srt_settings: Option<SrtSettings>,
    #[serde(default)]
    log_to_file: Option<bool>,
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default)]
    reconnect_interval: Option<u64>,
}

impl ApiServer {
    pub fn new(
        registry: Arc<Registry>,
        metrics: Arc<RelayMetrics>,
        username: String,
        password: String,
    ) -> Self {
        Self {
            registry,
            metrics,
            username,
            password,
        }
    }

    pub async fn run(self, port: u16, mut shutdown: watch::Receiver<bool>) {
        let server = Arc::new(self);
        let make_service = make_service_fn(move |_| {
            let server = server.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.route(req).await) }
                }))
            }
        });

        let addr = match format!("[::]:{}", port).parse() {
            Ok(addr) => addr,
            Err(err) => {
                log::error!("Invalid API listen address: {}", err);
                return;
            }
        };
        let server = Server::bind(&addr)
            .serve(make_service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
        log::info!("API server listening on http://{}", addr);
        if let Err(err) = server.await {
            log::error!("API server error: {}", err);
        }
    }

    async fn route(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        if !path.starts_with("/api/") {
            return not_found();
        }
        if let Err(err) = self.check_auth(&req) {
            return ErrorHandler::handle_error(&err);
        }

        let method = req.method().clone();
        let result = match (method, path.as_str()) {
            (Method::GET, "/api/inputs") => self.list_inputs().await,
            (Method::POST, "/api/inputs/add") => self.add_input(req).await,
            (Method::GET, "/api/inputs/remove") => self.remove_input(&req).await,
            (Method::POST, "/api/inputs/update_outputs") => self.update_outputs(req).await,
            (Method::POST, "/api/outputs/add") => self.add_output(req).await,
            (Method::POST, "/api/outputs/remove") => self.remove_output(req).await,
            (Method::POST, "/api/outputs/reconnect") => self.reconnect_output(req).await,
            (Method::GET, "/api/status") => self.status(&req).await,
            (Method::GET, "/api/status/all") => self.status_all().await,
            (Method::GET, "/api/settings") => self.get_settings().await,
            (Method::PUT, "/api/settings") => self.put_settings(req).await,
            (Method::POST, "/api/settings/reload") => self.reload_settings().await,
            (Method::GET, "/api/metrics") => Ok(ErrorHandler::handle_success(
                self.metrics.snapshot(),
            )),
            _ => return not_found(),
        };

        result.unwrap_or_else(|err| ErrorHandler::handle_error(&err))
    }

    fn check_auth(&self, req: &Request<Body>) -> Result<(), RelayError> {
        if self.username.is_empty() && self.password.is_empty() {
            return Ok(());
        }

        let header = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let encoded = match header.strip_prefix("Basic ") {
            Some(encoded) => encoded,
            None => return Err(RelayError::AuthenticationFailed),
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| RelayError::AuthenticationFailed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| RelayError::AuthenticationFailed)?;
        match decoded.split_once(':') {
            Some((user, pass)) if user == self.username && pass == self.password => Ok(()),
            _ => Err(RelayError::AuthenticationFailed),
        }
    }

    async fn list_inputs(&self) -> Result<Response<Body>, RelayError> {
        Ok(ErrorHandler::handle_success(
            self.registry.list_ingests().await,
        ))
    }

    async fn add_input(&self, req: Request<Body>) -> Result<Response<Body>, RelayError> {
        let input: IngestCfg = read_json(req).await?;
        if input.name.is_empty() || input.url_path.is_empty() {
            return Err(RelayError::InvalidRequest {
                message: "Input name and URL path are required".to_string(),
            });
        }
        if !input.url_path.starts_with('/') {
            return Err(RelayError::InvalidRequest {
                message: "url_path must start with '/'".to_string(),
            });
        }
        for url in &input.outputs {
            validate_output_url(url).map_err(|e| RelayError::InvalidRequest {
                message: format!("Invalid output URL: {}", e),
            })?;
        }

        let name = input.name.clone();
        self.registry.add_ingest(input).await?;
        self.persist_outputs().await;
        log::info!("New ingest added via API: {}", name);
        Ok(status_only(StatusCode::CREATED))
    }

    async fn remove_input(&self, req: &Request<Body>) -> Result<Response<Body>, RelayError> {
        let name = query_param(req, "name").ok_or_else(|| RelayError::InvalidRequest {
            message: "Missing 'name' parameter".to_string(),
        })?;
        self.registry.remove_ingest(&name).await;
        Ok(status_only(StatusCode::OK))
    }

    async fn update_outputs(&self, req: Request<Body>) -> Result<Response<Body>, RelayError> {
        let body: UpdateOutputsRequest = read_json(req).await?;
        for url in &body.outputs {
            validate_output_url(url).map_err(|e| RelayError::InvalidRequest {
                message: format!("Invalid output URL: {}", e),
            })?;
        }
        self.registry
            .update_outputs(&body.name, body.outputs)
            .await?;
        self.persist_outputs().await;
        Ok(status_only(StatusCode::OK))
    }

    async fn add_output(&self, req: Request<Body>) -> Result<Response<Body>, RelayError> {
        let body: OutputRef = read_json(req).await?;
        validate_output_url(&body.url).map_err(|e| RelayError::InvalidRequest {
            message: format!("Invalid output URL: {}", e),
        })?;
        self.registry.add_output_url(&body.name, &body.url).await?;
        self.persist_outputs().await;
        Ok(status_only(StatusCode::OK))
    }

    async fn remove_output(&self, req: Request<Body>) -> Result<Response<Body>, RelayError> {
        let body: OutputRef = read_json(req).await?;
        self.registry
            .remove_output_url(&body.name, &body.url)
            .await?;
        self.persist_outputs().await;
        Ok(status_only(StatusCode::OK))
    }

    async fn reconnect_output(&self, req: Request<Body>) -> Result<Response<Body>, RelayError> {
        let body: OutputRef = read_json(req).await?;
        if body.name.is_empty() || body.url.is_empty() {
            return Err(RelayError::InvalidRequest {
                message: "Missing name or url".to_string(),
            });
        }
        self.registry.force_reconnect(&body.name, &body.url).await;
        Ok(status_only(StatusCode::OK))
    }

    async fn status(&self, req: &Request<Body>) -> Result<Response<Body>, RelayError> {
        let name = query_param(req, "name").ok_or_else(|| RelayError::InvalidRequest {
            message: "Missing 'name' parameter".to_string(),
        })?;
        match self.registry.status(&name).await {
            Some(status) => Ok(ErrorHandler::handle_success(status)),
            None => Err(RelayError::IngestNotFound { name }),
        }
    }

    async fn status_all(&self) -> Result<Response<Body>, RelayError> {
        Ok(ErrorHandler::handle_success(
            self.registry.all_statuses().await,
        ))
    }

    async fn get_settings(&self) -> Result<Response<Body>, RelayError> {
        Ok(ErrorHandler::handle_success(
            self.registry.global_settings().await,
        ))
    }

    async fn put_settings(&self, req: Request<Body>) -> Result<Response<Body>, RelayError> {
        let body: UpdateSettingsRequest = read_json(req).await?;

        if let Some(interval) = body.reconnect_interval {
            if interval < 1 {
                return Err(RelayError::InvalidRequest {
                    message: "Reconnect interval must be >= 1".to_string(),
                });
            }
        }

        let mut global = self.registry.global_settings().await;
        if let Some(srt) = body.srt_settings {
            global.srt_settings = srt;
        }
        if let Some(log_to_file) = body.log_to_file {
            global.log_to_file = log_to_file;
        }
        if let Some(log_file) = body.log_file {
            if !log_file.is_empty() {
                global.log_file = log_file;
            }
        }
        if let Some(interval) = body.reconnect_interval {
            global.reconnect_interval = interval;
        }

        self.registry.update_global_settings(global.clone()).await;

        let path = self.registry.config_path().clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = config::save_settings(&path, &global) {
                log::error!("Failed to persist settings: {}", err);
            }
        });

        Ok(status_only(StatusCode::OK))
    }

    async fn reload_settings(&self) -> Result<Response<Body>, RelayError> {
        self.registry.reload_settings().await?;
        Ok(status_only(StatusCode::OK))
    }

    /// config.yaml mirrors the live outputs lists; rewritten off the
    /// request path.
    async fn persist_outputs(&self) {
        let inputs = self.registry.list_ingests().await;
        let path = self.registry.config_path().clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = config::save_outputs(&path, &inputs) {
                log::error!("Failed to persist outputs: {}", err);
            }
        });
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, RelayError> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|_| RelayError::InvalidRequest {
            message: "Failed to read body".to_string(),
        })?;
    if body.len() > MAX_BODY {
        return Err(RelayError::InvalidRequest {
            message: "Request body too large".to_string(),
        });
    }
    serde_json::from_slice(&body).map_err(|_| RelayError::InvalidRequest {
        message: "Invalid JSON".to_string(),
    })
}

fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    })
}

fn status_only(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::empty())
        .unwrap_or_default()
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not found"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::path::PathBuf;

    fn server(username: &str, password: &str) -> Arc<ApiServer> {
        let registry = Arc::new(Registry::new(
            Settings::default(),
            PathBuf::from("config.yaml"),
        ));
        Arc::new(ApiServer::new(
            registry,
            RelayMetrics::new(),
            username.to_string(),
            password.to_string(),
        ))
    }

    fn request_with_auth(auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/inputs");
        if let Some(auth) = auth {
            builder = builder.header("Authorization", auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn auth_disabled_when_unconfigured() {
        let server = server("", "");
        assert!(server.check_auth(&request_with_auth(None)).is_ok());
    }

    #[tokio::test]
    async fn auth_rejects_missing_and_bad_credentials() {
        let server = server("admin", "secret");
        assert!(server.check_auth(&request_with_auth(None)).is_err());

        let bad = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
        let header = format!("Basic {}", bad);
        assert!(server
            .check_auth(&request_with_auth(Some(&header)))
            .is_err());
    }

    #[tokio::test]
    async fn auth_accepts_correct_credentials() {
        let server = server("admin", "secret");
        let good = base64::engine::general_purpose::STANDARD.encode("admin:secret");
        let header = format!("Basic {}", good);
        assert!(server.check_auth(&request_with_auth(Some(&header))).is_ok());
    }

    #[tokio::test]
    async fn unauthorized_response_carries_www_authenticate() {
        let server = server("admin", "secret");
        let response = server.route(request_with_auth(None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("WWW-Authenticate"));
    }

    #[tokio::test]
    async fn add_input_conflict_maps_to_409() {
        let server = server("", "");
        let cfg = IngestCfg {
            name: "live".to_string(),
            url_path: "/live/a".to_string(),
            outputs: vec![],
        };
        server.registry.add_ingest(cfg.clone()).await.unwrap();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/inputs/add")
            .body(Body::from(serde_json::to_vec(&cfg).unwrap()))
            .unwrap();
        let response = server.route(req).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn add_input_rejects_bad_output_url() {
        let server = server("", "");
        let body = serde_json::json!({
            "name": "live",
            "url_path": "/live/a",
            "outputs": ["rtmp://"]
        });
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/inputs/add")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = server.route(req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settings_put_validates_reconnect_interval() {
        let server = server("", "");
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/api/settings")
            .body(Body::from(r#"{"reconnect_interval":0}"#))
            .unwrap();
        let response = server.route(req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_unknown_name_is_404() {
        let server = server("", "");
        let req = Request::builder()
            .uri("/api/status?name=missing")
            .body(Body::empty())
            .unwrap();
        let response = server.route(req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
