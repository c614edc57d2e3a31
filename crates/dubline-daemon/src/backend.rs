//! HTTP client for the transcript/translation service.
//!
//! Two JSON endpoints under `base_url`:
//!
//! ```text
//!   POST /v1/lines      {media_id, t, window}   → {lines: [{start, end, text}]}
//!   POST /v1/translate  {lines, target, hint}   → {lines: [...]}
//! ```

use async_trait::async_trait;
use dubline_engine::{Backend, BackendError};
use dubline_proto::config::BackendConfig;
use dubline_proto::protocol::Line;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct LinesRequest<'a> {
    media_id: &'a str,
    t: f64,
    window: f64,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    lines: &'a [Line],
    target: &'a str,
    hint: &'a str,
}

#[derive(Deserialize)]
struct LinesResponse {
    lines: Vec<Line>,
}

/// Shares one `reqwest::Client` (and its connection pool) across requests.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, BackendError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!("backend: {} returned {}", path, status);
            return Err(BackendError::Status(status.as_u16()));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_lines(
        &self,
        media_id: &str,
        t: f64,
        window: f64,
    ) -> Result<Vec<Line>, BackendError> {
        let body = LinesRequest { media_id, t, window };
        let resp: LinesResponse = self.post("/v1/lines", &body).await?;
        debug!("backend: {} lines for {} around {:.2}s", resp.lines.len(), media_id, t);
        Ok(resp.lines)
    }

    async fn translate(
        &self,
        lines: Vec<Line>,
        target: &str,
        hint: &str,
    ) -> Result<Vec<Line>, BackendError> {
        let body = TranslateRequest {
            lines: &lines,
            target,
            hint,
        };
        let resp: LinesResponse = self.post("/v1/translate", &body).await?;
        Ok(resp.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn lines(headers: HeaderMap, Json(body): Json<Value>) -> Response {
        if headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            != Some("Bearer secret")
        {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let t = body["t"].as_f64().unwrap_or_default();
        Json(json!({
            "lines": [
                { "start": t - 1.0, "end": t + 1.0, "text": body["media_id"] }
            ]
        }))
        .into_response()
    }

    async fn translate(Json(body): Json<Value>) -> Response {
        let target = body["target"].as_str().unwrap_or_default().to_string();
        let lines: Vec<Value> = body["lines"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut l| {
                let text = format!("{}:{}", target, l["text"].as_str().unwrap_or_default());
                l["text"] = Value::String(text);
                l
            })
            .collect();
        Json(json!({ "lines": lines })).into_response()
    }

    async fn broken() -> &'static str {
        "not json"
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn backend(base_url: String, api_key: Option<&str>) -> HttpBackend {
        HttpBackend::new(&BackendConfig {
            base_url,
            api_key: api_key.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_fetch_and_translate() {
        let base = serve(
            Router::new()
                .route("/v1/lines", post(lines))
                .route("/v1/translate", post(translate)),
        )
        .await;
        let b = backend(format!("{}/", base), Some("secret"));

        let fetched = b.fetch_lines("vid1", 11.0, 6.0).await.unwrap();
        assert_eq!(fetched, vec![Line::new(10.0, 12.0, "vid1")]);

        let translated = b.translate(fetched, "fr", "").await.unwrap();
        assert_eq!(translated, vec![Line::new(10.0, 12.0, "fr:vid1")]);
    }

    #[tokio::test]
    async fn test_non_success_status_maps_to_status_error() {
        let base = serve(Router::new().route("/v1/lines", post(lines))).await;
        let b = backend(base, None);
        assert_eq!(
            b.fetch_lines("vid1", 1.0, 6.0).await,
            Err(BackendError::Status(401))
        );
    }

    #[tokio::test]
    async fn test_bad_body_maps_to_decode_error() {
        let base = serve(Router::new().route("/v1/translate", post(broken))).await;
        let b = backend(base, None);
        let err = b
            .translate(vec![Line::new(0.0, 1.0, "x")], "fr", "")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_maps_to_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let b = backend(format!("http://{}", addr), None);
        let err = b.fetch_lines("vid1", 1.0, 6.0).await.unwrap_err();
        assert!(matches!(err, BackendError::Network(_)));
    }
}
