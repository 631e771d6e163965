use crate::auth::{hash_password, new_session, validate_signup, verify_password, AuthUser};
use crate::batching::enqueue;
use crate::errors::Error;
use crate::metrics::{INVALID_READINGS_TOTAL, READINGS_TOTAL, VALID_READINGS_TOTAL};
use crate::model::{
    ActuatorStateResponse, HistoryResponse, IngestResponse, LatestReadingResponse, LoginRequest,
    LoginResponse, MessageResponse, ReadingPayload, ReadingsResponse, RelayCommand,
    RelayCommandResponse, SensorReading, SignupRequest, User,
};
use crate::reconcile::Reconciler;
use crate::store::Store;
use crate::validate::{validate, validate_id};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DEFAULT_READINGS_LIMIT: i64 = 1000;
const MAX_READINGS_LIMIT: i64 = 10_000;
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub reconciler: Reconciler,
    pub tx: mpsc::Sender<SensorReading>,
    pub default_device_id: String,
    pub default_actuator_id: String,
    pub session_ttl_secs: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    range: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<i64>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/readings", get(get_readings).post(post_reading))
        .route("/update", post(post_reading))
        .route("/api/readings/latest", get(get_latest_reading))
        .route("/api/actuators/:actuator_id/state", get(get_actuator_state))
        .route("/api/actuators/:actuator_id/history", get(get_actuator_history))
        .route("/api/control/relay", post(post_relay_command))
        .route("/signup", post(post_signup))
        .route("/login", post(post_login))
        .route("/logout", post(post_logout))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Stores a reading and answers with the relay command the device should apply.
async fn post_reading(
    State(state): State<AppState>,
    payload: Result<Json<ReadingPayload>, JsonRejection>,
) -> Result<Json<IngestResponse>, AppError> {
    READINGS_TOTAL.inc();
    let now = Utc::now();

    let Json(payload) = payload.map_err(|rejection| {
        INVALID_READINGS_TOTAL.inc();
        warn!("Rejected unparseable reading: {}", rejection.body_text());
        AppError::from(rejection)
    })?;

    let device_id = payload
        .device_id
        .clone()
        .unwrap_or_else(|| state.default_device_id.clone());
    let actuator_id = payload
        .actuator_id
        .clone()
        .unwrap_or_else(|| state.default_actuator_id.clone());
    let reported = payload.relay_state;
    let reading = payload.into_reading(device_id, now);

    if let Err(e) = validate(&reading).and_then(|_| validate_id("Actuator ID", &actuator_id)) {
        INVALID_READINGS_TOTAL.inc();
        warn!("Rejected reading from {}: {}", reading.device_id, e);
        return Err(e.into());
    }
    VALID_READINGS_TOTAL.inc();

    debug!(
        "Reading from {}: {:.1}V {:.2}A relay={:?}",
        reading.device_id, reading.voltage, reading.current, reported
    );
    // a reading is only stored once its relay report has been reconciled
    let record = state.reconciler.reconcile(&actuator_id, reported, now).await?;
    enqueue(&state.tx, reading).await?;

    Ok(Json(IngestResponse {
        status: "success",
        message: "Reading saved successfully",
        relay_command: record.state,
        switch: if record.state { "switch_on" } else { "switch_off" },
        accepted_at: record.accepted_at,
    }))
}

async fn get_readings(
    State(state): State<AppState>,
    params: Result<Query<ReadingsQuery>, QueryRejection>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let Query(params) = params?;
    let since = range_start(params.range.as_deref(), Utc::now());
    let limit = params
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .clamp(1, MAX_READINGS_LIMIT);

    let data = state.store.readings_since(since, limit).await?;

    Ok(Json(ReadingsResponse {
        status: "success",
        count: data.len(),
        data,
    }))
}

async fn get_latest_reading(State(state): State<AppState>) -> Result<Json<LatestReadingResponse>, AppError> {
    match state.store.latest_reading().await? {
        Some(data) => Ok(Json(LatestReadingResponse {
            status: "success",
            data,
        })),
        None => Err(AppError::NotFound("No readings found".to_string())),
    }
}

async fn get_actuator_state(
    State(state): State<AppState>,
    Path(actuator_id): Path<String>,
) -> Result<Json<ActuatorStateResponse>, AppError> {
    validate_id("Actuator ID", &actuator_id)?;

    let view = state.reconciler.current(&actuator_id, Utc::now()).await?;
    let record = view.record();

    Ok(Json(ActuatorStateResponse {
        freshness: view.freshness(),
        state: record.map(|r| r.state),
        source: record.map(|r| r.source),
        accepted_at: record.map(|r| r.accepted_at),
        actuator_id,
    }))
}

async fn get_actuator_history(
    State(state): State<AppState>,
    Path(actuator_id): Path<String>,
    params: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, AppError> {
    let Query(params) = params?;
    validate_id("Actuator ID", &actuator_id)?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let data = state.store.state_history(&actuator_id, limit).await?;

    Ok(Json(HistoryResponse {
        actuator_id,
        count: data.len(),
        data,
    }))
}

async fn post_relay_command(
    State(state): State<AppState>,
    user: AuthUser,
    command: Result<Json<RelayCommand>, JsonRejection>,
) -> Result<Json<RelayCommandResponse>, AppError> {
    let Json(command) = command?;
    let actuator_id = command
        .actuator_id
        .unwrap_or_else(|| state.default_actuator_id.clone());
    validate_id("Actuator ID", &actuator_id)?;

    let record = state
        .reconciler
        .command(&actuator_id, command.state, Utc::now())
        .await?;
    info!(
        "{} switched {} {}",
        user.username,
        actuator_id,
        if record.state { "ON" } else { "OFF" }
    );

    Ok(Json(RelayCommandResponse {
        status: "success",
        message: format!(
            "Relay state set to {}",
            if record.state { "ON" } else { "OFF" }
        ),
        relay_state: record.state,
        accepted_at: record.accepted_at,
    }))
}

async fn post_signup(
    State(state): State<AppState>,
    req: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    let Json(req) = req?;
    validate_signup(&req)?;

    let user = User {
        username: req.username,
        email: req.email.trim().to_lowercase(),
        password_hash: hash_password(&req.password)?,
        role: "user".to_string(),
        created_at: Utc::now(),
    };

    if !state.store.create_user(&user).await? {
        warn!("Signup refused, {} or {} already taken", user.username, user.email);
        return Err(AppError::BadRequest("User already exists".to_string()));
    }
    info!("Created user {}", user.username);

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            status: "success",
            message: "User created".to_string(),
        }),
    ))
}

async fn post_login(
    State(state): State<AppState>,
    req: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let Json(req) = req?;

    let user = match state.store.find_user(&req.username).await? {
        Some(user) if verify_password(&req.password, &user.password_hash) => user,
        _ => {
            warn!("Failed login for {}", req.username);
            return Err(AppError::Unauthorized("Invalid username or password".to_string()));
        }
    };

    let session = new_session(&user.username, Utc::now(), state.session_ttl_secs);
    state.store.create_session(&session).await?;
    info!("{} logged in", user.username);

    Ok(Json(LoginResponse {
        status: "success",
        message: "Login successful",
        token: session.token,
        role: user.role,
        expires_at: session.expires_at,
    }))
}

async fn post_logout(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<MessageResponse>, AppError> {
    state.store.delete_session(&user.token).await?;
    info!("{} logged out", user.username);

    Ok(Json(MessageResponse {
        status: "success",
        message: "Logged out".to_string(),
    }))
}

/// Start of the `range` window. Unknown ranges fall back to a day.
fn range_start(range: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let span = match range.unwrap_or("day") {
        "hour" => Duration::hours(1),
        "week" => Duration::weeks(1),
        "month" => Duration::days(30),
        _ => Duration::days(1),
    };
    now - span
}

pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::Internal(e) => {
                error!("API error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(MessageResponse {
                status: "error",
                message,
            }),
        )
            .into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(message) => AppError::BadRequest(message),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use crate::reconcile::DEFAULT_FRESHNESS_WINDOW_SECS;
    use crate::store::test_utils::{FailingStore, MemoryStore};
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(store: Arc<dyn Store>) -> (Router, mpsc::Receiver<SensorReading>) {
        let (tx, rx) = mpsc::channel(64);
        let state = AppState {
            reconciler: Reconciler::new(store.clone(), DEFAULT_FRESHNESS_WINDOW_SECS),
            store,
            tx,
            default_device_id: "octa-solar-1".to_string(),
            default_actuator_id: "pump".to_string(),
            session_ttl_secs: 3600,
        };
        (create_router(state), rx)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn with_token(mut request: Request<Body>, token: &str) -> Request<Body> {
        request.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        request
    }

    /// Signs up `operator` and returns a session token.
    async fn login(router: &Router) -> String {
        let (status, _) = send(
            router,
            post_json(
                "/signup",
                json!({"username": "operator", "email": "ops@octasolar.com", "password": "pump-it-up"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            router,
            post_json("/login", json!({"username": "operator", "password": "pump-it-up"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn firmware_reading(switch: u8) -> Value {
        json!({
            "voltage": 12.4, "current": 0.52, "tds": 310.5,
            "flow": 1.5, "liters": 42.0, "light": 2048, "switch": switch
        })
    }

    #[tokio::test]
    async fn test_post_reading_echoes_relay_command() {
        let store = Arc::new(MemoryStore::new());
        let (router, mut rx) = app(store.clone());

        let (status, body) = send(&router, post_json("/api/readings", firmware_reading(1))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["relay_command"], true);
        assert_eq!(body["switch"], "switch_on");

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.device_id, "octa-solar-1");
        assert_eq!(queued.flow_rate, 1.5);
        assert_eq!(queued.relay_state, Some(true));

        // within the window the device cannot switch the pump back off
        let (_, body) = send(&router, post_json("/update", firmware_reading(0))).await;
        assert_eq!(body["switch"], "switch_on");
        assert_eq!(store.state_rows("pump").len(), 2);
    }

    #[tokio::test]
    async fn test_post_reading_rejects_invalid() {
        let store = Arc::new(MemoryStore::new());
        let (router, mut rx) = app(store.clone());

        let mut reading = firmware_reading(1);
        reading["light"] = json!(9000);
        let (status, body) = send(&router, post_json("/api/readings", reading)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(rx.try_recv().is_err());
        assert!(store.state_rows("pump").is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_reading_is_bad_request() {
        let store = Arc::new(MemoryStore::new());
        let (router, mut rx) = app(store.clone());

        let (status, body) = send(&router, post_json("/update", json!({"switch": 2}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("0 or 1"));

        let request = Request::builder()
            .method("POST")
            .uri("/api/readings")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"voltage\": 12."))
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        assert!(rx.try_recv().is_err());
        assert!(store.state_rows("pump").is_empty());
    }

    #[tokio::test]
    async fn test_whole_float_light_is_accepted() {
        let (router, mut rx) = app(Arc::new(MemoryStore::new()));

        let mut reading = firmware_reading(0);
        reading["light"] = json!(2048.0);
        let (status, _) = send(&router, post_json("/update", reading)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().light, 2048);
    }

    #[tokio::test]
    async fn test_failed_reconcile_does_not_queue_reading() {
        let (router, mut rx) = app(Arc::new(FailingStore));

        let (status, _) = send(&router, post_json("/api/readings", firmware_reading(1))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_command_requires_login() {
        let store = Arc::new(MemoryStore::new());
        let (router, _rx) = app(store.clone());

        let (status, body) = send(&router, post_json("/api/control/relay", json!({"state": true}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], "error");

        let (status, _) = send(
            &router,
            with_token(post_json("/api/control/relay", json!({"state": true})), "not-a-session"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(store.state_rows("pump").is_empty());

        let token = login(&router).await;
        let (status, body) = send(
            &router,
            with_token(post_json("/api/control/relay", json!({"state": true})), &token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["relay_state"], true);
    }

    #[tokio::test]
    async fn test_signup_and_login_failures() {
        let store = Arc::new(MemoryStore::new());
        let (router, _rx) = app(store.clone());
        login(&router).await;

        let (status, body) = send(
            &router,
            post_json(
                "/signup",
                json!({"username": "operator", "email": "other@octasolar.com", "password": "pump-it-up"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "User already exists");

        let (status, _) = send(
            &router,
            post_json("/login", json!({"username": "operator", "password": "wrong-password"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &router,
            post_json("/login", json!({"username": "nobody", "password": "pump-it-up"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let stored = store.users.lock().unwrap()[0].password_hash.clone();
        assert_ne!(stored, "pump-it-up");
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let (router, _rx) = app(Arc::new(MemoryStore::new()));
        let token = login(&router).await;

        let (status, _) = send(&router, with_token(post_json("/logout", json!({})), &token)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &router,
            with_token(post_json("/api/control/relay", json!({"state": false})), &token),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_relay_command_overrides_device() {
        let store = Arc::new(MemoryStore::new());
        let (router, _rx) = app(store.clone());

        send(&router, post_json("/api/readings", firmware_reading(0))).await;
        let token = login(&router).await;

        let (status, body) = send(
            &router,
            with_token(post_json("/api/control/relay", json!({"state": true})), &token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["relay_state"], true);
        assert_eq!(body["message"], "Relay state set to ON");

        let (_, body) = send(&router, post_json("/api/readings", firmware_reading(0))).await;
        assert_eq!(body["relay_command"], true);

        let rows = store.state_rows("pump");
        assert_eq!(rows.last().map(|r| r.source), Some(Source::User));
    }

    #[tokio::test]
    async fn test_actuator_state_and_history() {
        let store = Arc::new(MemoryStore::new());
        let (router, _rx) = app(store.clone());

        let (status, body) = send(&router, get("/api/actuators/pump/state")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["freshness"], "absent");
        assert!(body.get("state").is_none());

        let token = login(&router).await;
        send(
            &router,
            with_token(post_json("/api/control/relay", json!({"state": true})), &token),
        )
        .await;
        send(&router, post_json("/api/readings", firmware_reading(0))).await;

        let (_, body) = send(&router, get("/api/actuators/pump/state")).await;
        assert_eq!(body["freshness"], "fresh");
        assert_eq!(body["state"], true);
        assert_eq!(body["source"], "user");

        let (_, body) = send(&router, get("/api/actuators/pump/history?limit=1")).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["state"], true);
    }

    #[tokio::test]
    async fn test_readings_queries() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let old = SensorReading {
            device_id: "octa-solar-1".to_string(),
            timestamp: now - Duration::hours(3),
            voltage: 11.9,
            current: 0.3,
            tds: 280.0,
            flow_rate: 0.0,
            total_liters: 10.0,
            light: 900,
            relay_state: Some(false),
        };
        let recent = SensorReading {
            timestamp: now - Duration::minutes(5),
            total_liters: 12.0,
            ..old.clone()
        };
        store.insert_readings(&[old, recent]).await.unwrap();
        let (router, _rx) = app(store);

        let (_, body) = send(&router, get("/api/readings?range=hour")).await;
        assert_eq!(body["count"], 1);

        let (_, body) = send(&router, get("/api/readings?range=fortnight")).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["data"][0]["total_liters"], 12.0);

        let (status, body) = send(&router, get("/api/readings/latest")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_liters"], 12.0);
    }

    #[tokio::test]
    async fn test_latest_reading_not_found() {
        let (router, _rx) = app(Arc::new(MemoryStore::new()));

        let (status, body) = send(&router, get("/api/readings/latest")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "No readings found");
    }

    #[tokio::test]
    async fn test_store_failure_is_internal_error() {
        let (router, _rx) = app(Arc::new(FailingStore));

        let (status, body) = send(&router, post_json("/api/readings", firmware_reading(1))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Internal server error");

        let (status, _) = send(&router, get("/api/actuators/pump/state")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_range_start() {
        let now = Utc::now();
        assert_eq!(range_start(Some("hour"), now), now - Duration::hours(1));
        assert_eq!(range_start(Some("month"), now), now - Duration::days(30));
        assert_eq!(range_start(None, now), now - Duration::days(1));
        assert_eq!(range_start(Some("bogus"), now), now - Duration::days(1));
    }
}
