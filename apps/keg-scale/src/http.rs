use crate::error::{AppError, AppResult};
use crate::ingest::{IngestStatsSnapshot, Ingestor};
use crate::scale::{Measurement, Scale, ScaleSnapshot};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

#[derive(Clone)]
pub struct HttpState {
    pub ingestor: Ingestor,
    pub auth_token: Arc<str>,
}

impl HttpState {
    pub fn new(ingestor: Ingestor, auth_token: &str) -> Self {
        Self {
            ingestor,
            auth_token: Arc::from(auth_token),
        }
    }

    fn scale(&self) -> &Scale {
        self.ingestor.scale()
    }

    fn authorize(&self, headers: &HeaderMap) -> AppResult<()> {
        let presented = headers
            .get(header::AUTHORIZATION)
            .map(|value| value.as_bytes())
            .unwrap_or_default();
        if bool::from(presented.ct_eq(self.auth_token.as_bytes())) {
            Ok(())
        } else {
            Err(AppError::unauthorized("Unauthorized"))
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    scale: ScaleSnapshot,
    ingest: IngestStatsSnapshot,
}

#[derive(Debug, Deserialize)]
struct MeasurementsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ActiveKeg {
    keg: i64,
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    is_ok: bool,
    last_weight: f64,
    last_weight_kg: f64,
    last_at: DateTime<Utc>,
    last_at_age_secs: i64,
    rssi: f64,
    last_update: Option<DateTime<Utc>>,
    last_update_age_secs: Option<i64>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn post_message(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<&'static str> {
    state.authorize(&headers)?;
    let outcome = state.ingestor.handle_message(&body).await?;
    tracing::info!(
        message_id = outcome.message_id,
        kind = %outcome.kind,
        "scale message accepted"
    );
    Ok("OK")
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        scale: state.scale().snapshot(),
        ingest: state.ingestor.stats().snapshot(),
    })
}

async fn get_measurements(
    State(state): State<HttpState>,
    Query(query): Query<MeasurementsQuery>,
) -> Json<Vec<Measurement>> {
    let scale = state.scale();
    let limit = query.limit.unwrap_or_else(|| scale.capacity());
    Json(scale.recent(limit))
}

async fn put_active_keg(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(payload): Json<ActiveKeg>,
) -> AppResult<Json<ActiveKeg>> {
    state.authorize(&headers)?;
    state
        .scale()
        .set_active_keg(payload.keg)
        .await
        .map_err(|err| {
            tracing::warn!(error=%err, keg = payload.keg, "active keg not persisted");
            AppError::unavailable(format!("active keg not persisted: {err}"))
        })?;
    tracing::info!(keg = payload.keg, "active keg changed");
    Ok(Json(payload))
}

async fn get_dashboard(State(state): State<HttpState>) -> AppResult<Json<DashboardResponse>> {
    let snapshot = state.scale().snapshot();
    let last = snapshot
        .last_measurement
        .ok_or_else(|| AppError::new(StatusCode::TOO_EARLY, "No measurements yet"))?;

    Ok(Json(DashboardResponse {
        is_ok: snapshot.ok,
        last_weight: last.weight,
        last_weight_kg: (last.weight / 10.0).round() / 100.0,
        last_at: last.recorded_at,
        last_at_age_secs: last.age_secs,
        rssi: snapshot.rssi,
        last_update: snapshot.last_contact_at,
        last_update_age_secs: snapshot.last_contact_age_secs,
    }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/scale/message", post(post_message))
        .route("/api/scale/status", get(get_status))
        .route("/api/scale/measurements", get(get_measurements))
        .route("/api/scale/active-keg", put(put_active_keg))
        .route("/api/scale/dashboard", get(get_dashboard))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightBounds;
    use crate::scale::STALENESS_THRESHOLD;
    use crate::store::{MeasurementStore, MemoryStore};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::response::Response;
    use tower::ServiceExt;

    const TOKEN: &str = "secret-token";

    fn app_with(store: Arc<MemoryStore>) -> Router {
        let scale = Scale::with_limits(3, WeightBounds::default(), STALENESS_THRESHOLD, store);
        router(HttpState::new(Ingestor::new(scale), TOKEN))
    }

    fn app() -> Router {
        app_with(Arc::new(MemoryStore::new(100)))
    }

    fn post_line(token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/api/scale/message");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn message_requires_the_configured_token() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(post_line(None, "push|1|-70|20000"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(post_line(Some("wrong"), "push|1|-70|20000"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_message_is_a_bad_request() {
        let resp = app()
            .oneshot(post_line(Some(TOKEN), "push|x|-70|20000"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("message_id"));
    }

    #[tokio::test]
    async fn accepted_message_shows_up_in_status_and_listing() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(post_line(Some(TOKEN), "push|2887417|-74.7|23000\n"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "OK");

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/scale/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status = body_json(resp).await;
        assert_eq!(status["scale"]["ok"], true);
        assert_eq!(status["scale"]["venue"]["is_open"], true);
        assert_eq!(status["scale"]["last_measurement"]["weight"], 23000.0);
        assert_eq!(status["ingest"]["pushes"], 1);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/scale/measurements?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listing = body_json(resp).await;
        assert_eq!(listing.as_array().map(Vec::len), Some(1));
        assert_eq!(listing[0]["seq"], 1);
    }

    #[tokio::test]
    async fn dashboard_is_too_early_without_measurements() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .uri("/api/scale/dashboard")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_EARLY);
    }

    #[tokio::test]
    async fn dashboard_reports_the_latest_weight() {
        let app = app();
        app.clone()
            .oneshot(post_line(Some(TOKEN), "push|1|-61|23456"))
            .await
            .unwrap();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/scale/dashboard")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let dashboard = body_json(resp).await;
        assert_eq!(dashboard["is_ok"], true);
        assert_eq!(dashboard["last_weight"], 23456.0);
        assert_eq!(dashboard["last_weight_kg"], 23.46);
        assert_eq!(dashboard["rssi"], -61.0);
    }

    fn put_keg(token: &str, keg: i64) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri("/api/scale/active-keg")
            .header(header::AUTHORIZATION, token)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(r#"{{"keg":{keg}}}"#)))
            .unwrap()
    }

    #[tokio::test]
    async fn active_keg_update_is_authorized_and_persisted() {
        let store = Arc::new(MemoryStore::new(100));
        let app = app_with(store.clone());

        let resp = app.clone().oneshot(put_keg("nope", 30)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app.oneshot(put_keg(TOKEN, 30)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["keg"], 30);
        assert_eq!(store.load_active_keg().await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn active_keg_store_failure_is_unavailable() {
        let store = Arc::new(MemoryStore::new(100));
        store.set_fail_writes(true);
        let app = app_with(store);

        let resp = app.clone().oneshot(put_keg(TOKEN, 50)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/scale/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["scale"]["active_keg"], 50);
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let resp = app()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }
}
