//! Command and configuration surface over HTTP.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    backfill::{BackfillHandler, BackfillOutcome, BackfillRequest},
    pipeline::{Credentials, FetchError, SyncError},
    registry::{Registry, StatisticListing},
    scheduler::{refresh_accounts, AccountSet, AccountStatus},
    state::PollConfigStore,
};

#[derive(Clone)]
pub struct ApiState {
    pub backfill: Arc<BackfillHandler>,
    pub accounts: Arc<AccountSet>,
    pub registry: Arc<Registry>,
    pub poll_store: Arc<dyn PollConfigStore>,
    pub shutdown: CancellationToken,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/accounts", get(list_accounts))
        .route("/accounts/:account_id/options", put(update_options))
        .route("/accounts/:account_id/credentials", post(replace_credentials))
        .route("/services/fetch_more_history", post(fetch_more_history))
        .route("/services/refresh", post(refresh))
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn serve(bind_addr: &str, state: ApiState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(bind_addr, "command api listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

pub struct ApiError(StatusCode, String);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self(status_for(&e), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

pub fn status_for(e: &SyncError) -> StatusCode {
    match e {
        SyncError::InvalidRange { .. } | SyncError::InvalidInterval(_) => StatusCode::BAD_REQUEST,
        SyncError::UnknownStatistic(_) | SyncError::UnknownAccount(_) => StatusCode::NOT_FOUND,
        SyncError::Fetch(FetchError::Auth(_)) => StatusCode::UNAUTHORIZED,
        SyncError::Fetch(FetchError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        SyncError::Fetch(FetchError::Transport(_)) | SyncError::Sink(_) => StatusCode::BAD_GATEWAY,
        SyncError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::State(_) | SyncError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
struct AccountView {
    id: String,
    email: Option<String>,
    update_interval_minutes: u32,
    degraded: bool,
    status: AccountStatus,
    statistics: Vec<StatisticListing>,
}

async fn list_accounts(State(state): State<ApiState>) -> Json<Vec<AccountView>> {
    let mut out = Vec::new();
    for account in state.accounts.iter() {
        let status = account.status();
        out.push(AccountView {
            id: account.id().to_string(),
            email: account.email().map(str::to_string),
            update_interval_minutes: account.poll_config().update_interval_minutes(),
            degraded: status.is_degraded(),
            status,
            statistics: state.registry.listing(account.id()).await,
        });
    }
    Json(out)
}

async fn fetch_more_history(
    State(state): State<ApiState>,
    Json(request): Json<BackfillRequest>,
) -> Result<Json<BackfillOutcome>, ApiError> {
    let cancel = state.shutdown.child_token();
    let outcome = state.backfill.fetch_more_history(request, &cancel).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    #[serde(default)]
    installation_id: Option<String>,
}

/// Poll now instead of waiting for the next tick. Accepted once the account
/// tasks are woken; the polls themselves run in the background.
async fn refresh(
    State(state): State<ApiState>,
    Json(request): Json<RefreshRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let installation_id = request.installation_id.as_deref();
    let woken = refresh_accounts(&state.accounts, &state.registry, installation_id).await;
    if woken.is_empty() {
        return Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("no account has installation {}", installation_id.unwrap_or_default()),
        ));
    }
    tracing::info!(installation_id = ?installation_id, accounts = ?woken, "refresh requested via api");
    Ok((StatusCode::ACCEPTED, Json(json!({ "accounts": woken }))))
}

#[derive(Debug, Deserialize)]
struct OptionsUpdate {
    update_interval_minutes: u32,
}

async fn update_options(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    Json(update): Json<OptionsUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = state
        .accounts
        .get(&account_id)
        .ok_or_else(|| SyncError::UnknownAccount(account_id.clone()))?;
    let config = account
        .set_update_interval(&*state.poll_store, update.update_interval_minutes)
        .await?;
    Ok(Json(json!({
        "account_id": account_id,
        "update_interval_minutes": config.update_interval_minutes(),
    })))
}

#[derive(Deserialize)]
struct CredentialsUpdate {
    api_key: String,
}

async fn replace_credentials(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    Json(update): Json<CredentialsUpdate>,
) -> Result<StatusCode, ApiError> {
    let account = state
        .accounts
        .get(&account_id)
        .ok_or_else(|| SyncError::UnknownAccount(account_id.clone()))?;
    let api_key = update.api_key.trim();
    if api_key.is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "api_key must not be empty".to_string()));
    }
    account.replace_credentials(Credentials::new(api_key));
    tracing::info!(account_id = %account_id, "credentials updated via api");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        scheduler::AccountHandle,
        sinks::memory::MemorySink,
        sources::scripted::{water_meter, ScriptedSource},
        state::{MemoryStateStore, PollConfig},
        sync::{EngineSettings, SyncEngine},
    };
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use time::macros::datetime;
    use tower::ServiceExt;

    struct Harness {
        state: ApiState,
        store: Arc<MemoryStateStore>,
    }

    fn harness() -> Harness {
        let source = Arc::new(ScriptedSource::new(vec![water_meter("200")]));
        source.push_reading("200-cw", datetime!(2024-05-16 01:00:00 UTC), 100.0);
        let store = Arc::new(MemoryStateStore::new());
        let engine = Arc::new(SyncEngine::new(
            source.clone(),
            Arc::new(MemorySink::new()),
            store.clone(),
            Arc::new(ManualClock::new(datetime!(2024-06-30 12:00:00 UTC))),
            EngineSettings::default(),
        ));
        let registry = Arc::new(Registry::new("meterportal"));
        let accounts = Arc::new(AccountSet::new([AccountHandle::new(
            "acct",
            Some("user@example.com".to_string()),
            Credentials::new("key-1"),
            PollConfig::default(),
            None,
        )]));
        let backfill = Arc::new(BackfillHandler::new(
            engine,
            registry.clone(),
            source,
            accounts.clone(),
        ));
        Harness {
            state: ApiState {
                backfill,
                accounts,
                registry,
                poll_store: store.clone(),
                shutdown: CancellationToken::new(),
            },
            store,
        }
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn errors_map_to_http_statuses() {
        let cases = [
            (
                SyncError::InvalidRange {
                    from_days_ago: 1,
                    to_days_ago: 2,
                },
                StatusCode::BAD_REQUEST,
            ),
            (SyncError::UnknownStatistic("x".into()), StatusCode::NOT_FOUND),
            (
                SyncError::Fetch(FetchError::Auth("no".into())),
                StatusCode::UNAUTHORIZED,
            ),
            (
                SyncError::Fetch(FetchError::RateLimited { retry_after: None }),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                SyncError::Fetch(FetchError::Transport("down".into())),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(status_for(&error), status, "{error}");
        }
    }

    #[tokio::test]
    async fn fetch_more_history_runs_a_backfill() {
        let h = harness();
        let response = router(h.state)
            .oneshot(json_request(
                "POST",
                "/services/fetch_more_history",
                json!({ "statistic_id": "meterportal:200_coldwater_statistic_primary" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["points_written"], 1);
        assert_eq!(body["from"], "2024-05-01T12:00:00Z");
    }

    #[tokio::test]
    async fn fetch_more_history_rejects_bad_input() {
        let h = harness();
        let app = router(h.state);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/services/fetch_more_history",
                json!({
                    "statistic_id": "meterportal:200_coldwater_statistic_primary",
                    "from_days_ago": 10,
                    "to_days_ago": 20
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request(
                "POST",
                "/services/fetch_more_history",
                json!({ "statistic_id": "meterportal:nope" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("meterportal:nope"));
    }

    #[tokio::test]
    async fn refresh_wakes_the_owning_account() {
        let h = harness();
        let app = router(h.state.clone());

        // Not discovered yet, so the only account is asked.
        let response = app
            .clone()
            .oneshot(json_request("POST", "/services/refresh", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["accounts"], json!(["acct"]));

        h.state.registry.install("acct", vec![water_meter("200")]).await;
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/services/refresh",
                json!({ "installation_id": "200" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .oneshot(json_request(
                "POST",
                "/services/refresh",
                json!({ "installation_id": "999" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("999"));
    }

    #[tokio::test]
    async fn options_are_validated_and_persisted() {
        let h = harness();
        let app = router(h.state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/accounts/acct/options",
                json!({ "update_interval_minutes": 10 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/accounts/other/options",
                json!({ "update_interval_minutes": 45 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_request(
                "PUT",
                "/accounts/acct/options",
                json!({ "update_interval_minutes": 45 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let expected = PollConfig::new(45).unwrap();
        assert_eq!(h.store.poll_config("acct").await.unwrap(), Some(expected));
        assert_eq!(h.state.accounts.get("acct").unwrap().poll_config(), expected);
    }

    #[tokio::test]
    async fn credentials_can_be_replaced() {
        let h = harness();
        let response = router(h.state.clone())
            .oneshot(json_request(
                "POST",
                "/accounts/acct/credentials",
                json!({ "api_key": "key-2" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            h.state.accounts.get("acct").unwrap().credentials(),
            Credentials::new("key-2")
        );
    }

    #[tokio::test]
    async fn accounts_list_status_and_statistics() {
        let h = harness();
        h.state.registry.install("acct", vec![water_meter("200")]).await;

        let response = router(h.state)
            .oneshot(
                Request::builder()
                    .uri("/accounts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let account = &body[0];
        assert_eq!(account["id"], "acct");
        assert_eq!(account["update_interval_minutes"], 30);
        assert_eq!(account["degraded"], false);
        assert_eq!(account["status"]["state"], "idle");
        assert_eq!(
            account["statistics"][0]["statistic_id"],
            "meterportal:200_coldwater_statistic_primary"
        );
        assert_eq!(account["statistics"][0]["sensor_name"], "200_coldwater_meter_primary");
    }
}
