use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{AdRow, AdSpaceRow, CampaignRow, CampaignStatus},
    config::Config,
    delivery::{
        ClickEvent, DeliveryError, DeliveryOutcome, DeliveryService, DepositOutcome,
        ImpressionEvent, NewAd, NewAdSpace, NewCampaign,
    },
    funding::FundingReport,
    ledger::{AccountRow, TransactionRow},
    payments::PendingCredit,
    selector::PlacementContext,
};

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct AppState {
    config: Config,
    delivery: DeliveryService,
    started_at: chrono::DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, delivery: DeliveryService) -> Self {
        Self {
            config,
            delivery,
            started_at: Utc::now(),
        }
    }

    pub fn delivery(&self) -> &DeliveryService {
        &self.delivery
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    storage: &'static str,
}

#[derive(Debug, Serialize)]
struct ServeResponse {
    ad: AdRow,
}

#[derive(Debug, Deserialize)]
struct OpenAccountBody {
    account_id: String,
}

#[derive(Debug, Serialize)]
struct AccountResponse {
    account: AccountRow,
}

#[derive(Debug, Deserialize)]
struct ListTransactionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TransactionsResponse {
    account_id: String,
    transactions: Vec<TransactionRow>,
}

#[derive(Debug, Deserialize)]
struct DepositBody {
    amount_sats: i64,
    #[serde(default)]
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct CampaignResponse {
    campaign: CampaignRow,
}

#[derive(Debug, Deserialize)]
struct CampaignStatusBody {
    status: CampaignStatus,
}

#[derive(Debug, Serialize)]
struct AdResponse {
    ad: AdRow,
}

#[derive(Debug, Serialize)]
struct AdSpaceResponse {
    ad_space: AdSpaceRow,
}

#[derive(Debug, Serialize)]
struct SweepResponse {
    resumed_campaigns: u64,
}

#[derive(Debug, Serialize)]
struct ReconciliationResponse {
    settled: u64,
    pending: Vec<PendingCredit>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/ads/serve", post(serve_ad))
        .route("/v1/ads/:ad_id/impressions", post(record_impression))
        .route("/v1/ads/:ad_id/clicks", post(record_click))
        .route(
            "/v1/campaigns/:campaign_id/funding",
            get(get_campaign_funding),
        )
        .route("/internal/v1/accounts", post(open_account))
        .route("/internal/v1/accounts/:account_id", get(get_account))
        .route(
            "/internal/v1/accounts/:account_id/transactions",
            get(list_transactions),
        )
        .route(
            "/internal/v1/accounts/:account_id/deposits",
            post(deposit),
        )
        .route("/internal/v1/campaigns", post(create_campaign))
        .route(
            "/internal/v1/campaigns/:campaign_id/status",
            post(set_campaign_status),
        )
        .route("/internal/v1/ads", post(create_ad))
        .route("/internal/v1/ad-spaces", post(put_ad_space))
        .route("/internal/v1/funding/sweep", post(run_funding_sweep))
        .route(
            "/internal/v1/reconciliation/pending",
            get(list_pending_credits),
        )
        .route(
            "/internal/v1/reconciliation/retry",
            post(retry_pending_credits),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        build_sha: state.config.build_sha,
        uptime_seconds,
        storage: if state.config.db_url.is_some() {
            "postgres"
        } else {
            "memory"
        },
    })
}

async fn serve_ad(
    State(state): State<AppState>,
    Json(body): Json<PlacementContext>,
) -> Response {
    match state.delivery.serve_ad(&body).await {
        Some(ad) => (StatusCode::OK, Json(ServeResponse { ad })).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn record_impression(
    State(state): State<AppState>,
    Path(ad_id): Path<String>,
    Json(body): Json<ImpressionEvent>,
) -> Result<Json<DeliveryOutcome>, ApiError> {
    let outcome = state
        .delivery
        .record_impression(&ad_id, body)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok(Json(outcome))
}

async fn record_click(
    State(state): State<AppState>,
    Path(ad_id): Path<String>,
    Json(body): Json<ClickEvent>,
) -> Result<Json<DeliveryOutcome>, ApiError> {
    let outcome = state
        .delivery
        .record_click(&ad_id, body)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok(Json(outcome))
}

async fn get_campaign_funding(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Json<FundingReport> {
    Json(state.delivery.campaign_funding_report(&campaign_id).await)
}

async fn open_account(
    State(state): State<AppState>,
    Json(body): Json<OpenAccountBody>,
) -> Result<(StatusCode, Json<AccountResponse>), ApiError> {
    let account = state
        .delivery
        .open_account(&body.account_id)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok((StatusCode::CREATED, Json(AccountResponse { account })))
}

async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountResponse>, ApiError> {
    let account = state
        .delivery
        .get_account(&account_id)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok(Json(AccountResponse { account }))
}

async fn list_transactions(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let transactions = state
        .delivery
        .list_transactions(&account_id, query.limit)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok(Json(TransactionsResponse {
        account_id,
        transactions,
    }))
}

async fn deposit(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(body): Json<DepositBody>,
) -> Result<Json<DepositOutcome>, ApiError> {
    let outcome = state
        .delivery
        .deposit(&account_id, body.amount_sats, body.idempotency_key)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok(Json(outcome))
}

async fn create_campaign(
    State(state): State<AppState>,
    Json(body): Json<NewCampaign>,
) -> Result<(StatusCode, Json<CampaignResponse>), ApiError> {
    let campaign = state
        .delivery
        .create_campaign(body)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok((StatusCode::CREATED, Json(CampaignResponse { campaign })))
}

async fn set_campaign_status(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
    Json(body): Json<CampaignStatusBody>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .delivery
        .set_campaign_status(&campaign_id, body.status)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok(Json(CampaignResponse { campaign }))
}

async fn create_ad(
    State(state): State<AppState>,
    Json(body): Json<NewAd>,
) -> Result<(StatusCode, Json<AdResponse>), ApiError> {
    let ad = state
        .delivery
        .create_ad(body)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok((StatusCode::CREATED, Json(AdResponse { ad })))
}

async fn put_ad_space(
    State(state): State<AppState>,
    Json(body): Json<NewAdSpace>,
) -> Result<Json<AdSpaceResponse>, ApiError> {
    let ad_space = state
        .delivery
        .put_ad_space(body)
        .await
        .map_err(ApiError::from_delivery)?;
    Ok(Json(AdSpaceResponse { ad_space }))
}

async fn run_funding_sweep(State(state): State<AppState>) -> Json<SweepResponse> {
    Json(SweepResponse {
        resumed_campaigns: state.delivery.run_funding_sweep().await,
    })
}

async fn list_pending_credits(State(state): State<AppState>) -> Json<ReconciliationResponse> {
    Json(ReconciliationResponse {
        settled: 0,
        pending: state.delivery.pending_credits().await,
    })
}

async fn retry_pending_credits(State(state): State<AppState>) -> Json<ReconciliationResponse> {
    let settled = state.delivery.retry_pending_credits().await;
    Json(ReconciliationResponse {
        settled,
        pending: state.delivery.pending_credits().await,
    })
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Conflict(String),
    InvalidRequest(String),
    Internal(String),
}

impl ApiError {
    fn from_delivery(error: DeliveryError) -> Self {
        match error {
            DeliveryError::NotFound(message) => Self::NotFound(message),
            DeliveryError::Conflict(message) => Self::Conflict(message),
            DeliveryError::InvalidRequest(message) => Self::InvalidRequest(message),
            DeliveryError::Internal(message) => {
                tracing::error!(reason = %message, "delivery request failed");
                Self::Internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            Self::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            Self::InvalidRequest(message) => {
                (StatusCode::BAD_REQUEST, "invalid_request", message)
            }
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        };
        (
            status,
            Json(serde_json::json!({
                "error": code,
                "message": message,
            })),
        )
            .into_response()
    }
}
