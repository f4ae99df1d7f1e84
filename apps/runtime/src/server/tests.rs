use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::{AppState, build_router};
use crate::{
    catalog, config::Config, delivery::DeliveryService, frequency, ledger,
    payments::DEFAULT_PLATFORM_FEE_BPS, selector::DEFAULT_CPC_ESTIMATED_CTR_BPS,
};

fn test_config() -> Config {
    Config {
        service_name: "admarket-runtime-test".to_string(),
        bind_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
        build_sha: "test".to_string(),
        db_url: None,
        platform_fee_bps: DEFAULT_PLATFORM_FEE_BPS,
        funding_sweep_enabled: false,
        funding_sweep_interval_seconds: 300,
        cpc_estimated_ctr_bps: DEFAULT_CPC_ESTIMATED_CTR_BPS,
    }
}

fn test_router() -> Router {
    let delivery = DeliveryService::new(
        catalog::store::memory(),
        ledger::store::memory(),
        frequency::memory(),
        DEFAULT_PLATFORM_FEE_BPS,
        DEFAULT_CPC_ESTIMATED_CTR_BPS,
    );
    build_router(AppState::new(test_config(), delivery))
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => request.body(Body::empty())?,
    };
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, json))
}

async fn seed_cpc_campaign(app: &Router) -> Result<()> {
    let (status, _) = send(
        app,
        Method::POST,
        "/internal/v1/ad-spaces",
        Some(json!({
            "ad_space_id": "space_1",
            "publisher_id": "pub_1",
            "width": 728,
            "height": 90
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        app,
        Method::POST,
        "/internal/v1/campaigns",
        Some(json!({
            "campaign_id": "cmp_1",
            "advertiser_id": "adv_1",
            "name": "launch",
            "status": "active",
            "budget_sats": 1000,
            "daily_budget_sats": 1000
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["campaign"]["status"], "active");

    let (status, body) = send(
        app,
        Method::POST,
        "/internal/v1/ads",
        Some(json!({
            "ad_id": "ad_1",
            "campaign_id": "cmp_1",
            "status": "active",
            "placement_type": "banner",
            "bid_per_click_sats": 100
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["ad"]["pricing"]["model"], "cpc");

    let (status, body) = send(
        app,
        Method::POST,
        "/internal/v1/accounts/adv_1/deposits",
        Some(json!({ "amount_sats": 250 })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance_sats"], 250);
    Ok(())
}

fn placement() -> Value {
    json!({
        "placement_type": "banner",
        "ad_space_id": "space_1"
    })
}

fn click() -> Value {
    json!({ "ad_space_id": "space_1" })
}

#[tokio::test]
async fn health_endpoint_reports_service_and_storage() -> Result<()> {
    let app = test_router();
    let (status, body) = send(&app, Method::GET, "/healthz", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "admarket-runtime-test");
    assert_eq!(body["storage"], "memory");
    Ok(())
}

#[tokio::test]
async fn exhausted_campaign_stops_serving_and_resumes_on_deposit() -> Result<()> {
    let app = test_router();
    seed_cpc_campaign(&app).await?;

    let (status, body) = send(&app, Method::POST, "/v1/ads/serve", Some(placement())).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ad"]["ad_id"], "ad_1");

    let mut billed = Vec::new();
    for _ in 0..3 {
        let (status, body) =
            send(&app, Method::POST, "/v1/ads/ad_1/clicks", Some(click())).await?;
        assert_eq!(status, StatusCode::OK);
        billed.push(body["billed"].as_bool());
    }
    assert_eq!(billed, vec![Some(true), Some(true), Some(false)]);

    let (status, body) = send(&app, Method::POST, "/v1/ads/serve", Some(placement())).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (_, funding) = send(&app, Method::GET, "/v1/campaigns/cmp_1/funding", None).await?;
    assert_eq!(funding["status"], "PAUSED");
    assert_eq!(funding["pause_reason"], "insufficient_funds");
    assert_eq!(funding["advertiser_balance_sats"], 50);

    let (status, body) = send(
        &app,
        Method::POST,
        "/internal/v1/accounts/adv_1/deposits",
        Some(json!({ "amount_sats": 450, "idempotency_key": "dep_1" })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed_campaigns"], 1);

    let (_, funding) = send(&app, Method::GET, "/v1/campaigns/cmp_1/funding", None).await?;
    assert_eq!(funding["status"], "ACTIVE");

    let (status, _) = send(&app, Method::POST, "/v1/ads/serve", Some(placement())).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn manual_pause_survives_the_sweep_endpoint() -> Result<()> {
    let app = test_router();
    seed_cpc_campaign(&app).await?;

    let (status, body) = send(
        &app,
        Method::POST,
        "/internal/v1/campaigns/cmp_1/status",
        Some(json!({ "status": "paused" })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["campaign"]["pause_reason"], "manual");

    let (status, body) = send(&app, Method::POST, "/internal/v1/funding/sweep", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed_campaigns"], 0);

    let (_, funding) = send(&app, Method::GET, "/v1/campaigns/cmp_1/funding", None).await?;
    assert_eq!(funding["status"], "PAUSED");
    Ok(())
}

#[tokio::test]
async fn serve_degrades_to_no_content() -> Result<()> {
    let app = test_router();
    seed_cpc_campaign(&app).await?;

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/ads/serve",
        Some(json!({
            "placement_type": "banner",
            "ad_space_id": "space_unknown"
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/ads/serve",
        Some(json!({
            "placement_type": "video",
            "ad_space_id": "space_1"
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn errors_map_to_status_codes() -> Result<()> {
    let app = test_router();
    seed_cpc_campaign(&app).await?;

    let (status, body) = send(
        &app,
        Method::POST,
        "/internal/v1/ads",
        Some(json!({
            "campaign_id": "cmp_1",
            "placement_type": "banner",
            "bid_per_impression_sats": 2000,
            "bid_per_click_sats": 100
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");

    let (status, body) = send(
        &app,
        Method::POST,
        "/internal/v1/campaigns",
        Some(json!({
            "campaign_id": "cmp_1",
            "advertiser_id": "adv_1",
            "name": "again",
            "budget_sats": 1000,
            "daily_budget_sats": 1000
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let (status, body) = send(&app, Method::GET, "/internal/v1/accounts/ghost", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = send(&app, Method::POST, "/v1/ads/ad_missing/clicks", Some(click())).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::POST,
        "/internal/v1/accounts/adv_1/deposits",
        Some(json!({ "amount_sats": 0 })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn accounts_and_history_are_exposed() -> Result<()> {
    let app = test_router();
    seed_cpc_campaign(&app).await?;
    send(&app, Method::POST, "/v1/ads/ad_1/clicks", Some(click())).await?;

    let (status, body) = send(
        &app,
        Method::POST,
        "/internal/v1/accounts",
        Some(json!({ "account_id": "pub_2" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["account"]["balance_sats"], 0);

    let (status, body) = send(&app, Method::GET, "/internal/v1/accounts/pub_1", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["account"]["balance_sats"], 90);

    let (status, body) = send(
        &app,
        Method::GET,
        "/internal/v1/accounts/adv_1/transactions?limit=1",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let transactions = body["transactions"].as_array().cloned().unwrap_or_default();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["kind"], "ad_payment");
    assert_eq!(transactions[0]["amount_sats"], -100);

    let (status, body) =
        send(&app, Method::POST, "/internal/v1/reconciliation/retry", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settled"], 0);
    assert_eq!(body["pending"], json!([]));
    Ok(())
}
