use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{
    AdPricing, AdRow, AdSpaceRow, AdStatus, CampaignRow, CampaignStatus, CatalogStore,
    CatalogStoreError, DeliveryKind, PauseReason, Targeting,
};
use crate::frequency::{FrequencyCap, FrequencyCapStore};
use crate::funding::{CampaignFundingMonitor, FundingReport, FundingStatus};
use crate::ledger::{
    AccountRow, LedgerDelta, LedgerStore, LedgerStoreError, TransactionRow, TransactionType,
};
use crate::payments::{PaymentError, PaymentProcessor, PendingCredit, Settlement};
use crate::selector::{AdSelector, PlacementContext};


const DEFAULT_TRANSACTION_LIMIT: usize = 50;
const MAX_TRANSACTION_LIMIT: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::Internal(message) => message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImpressionEvent {
    pub ad_space_id: String,
    #[serde(default)]
    pub viewer_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClickEvent {
    pub ad_space_id: String,
    #[serde(default)]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotBilledReason {
    FrequencyCapped,
    InsufficientFunds,
    PricingModelMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub ad_id: String,
    pub kind: DeliveryKind,
    pub billed: bool,
    pub charged_sats: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_billed_reason: Option<NotBilledReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Settlement>,
}

impl DeliveryOutcome {
    fn unbilled(ad_id: &str, kind: DeliveryKind, reason: NotBilledReason) -> Self {
        Self {
            ad_id: ad_id.to_string(),
            kind,
            billed: false,
            charged_sats: 0,
            not_billed_reason: Some(reason),
            settlement: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    #[serde(default)]
    pub campaign_id: Option<String>,
    pub advertiser_id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<CampaignStatus>,
    pub budget_sats: i64,
    pub daily_budget_sats: i64,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targeting: Targeting,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAd {
    #[serde(default)]
    pub ad_id: Option<String>,
    pub campaign_id: String,
    #[serde(default)]
    pub status: Option<AdStatus>,
    pub placement_type: String,
    #[serde(default)]
    pub bid_per_impression_sats: i64,
    #[serde(default)]
    pub bid_per_click_sats: i64,
    #[serde(default)]
    pub freq_cap_views: u32,
    #[serde(default)]
    pub freq_cap_hours: u32,
    #[serde(default)]
    pub targeting: Targeting,
    #[serde(default)]
    pub ad_space_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAdSpace {
    pub ad_space_id: String,
    pub publisher_id: String,
    #[serde(default)]
    pub min_bid_per_impression_sats: i64,
    #[serde(default)]
    pub min_bid_per_click_sats: i64,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositOutcome {
    pub account_id: String,
    pub transaction_id: String,
    pub balance_sats: i64,
    pub replayed: bool,
    pub resumed_campaigns: u64,
}

/// The operations exposed to the delivery endpoint, dashboards and admin tooling.
#[derive(Clone)]
pub struct DeliveryService {
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn LedgerStore>,
    frequency: Arc<dyn FrequencyCapStore>,
    selector: AdSelector,
    payments: PaymentProcessor,
    monitor: CampaignFundingMonitor,
}

impl DeliveryService {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<dyn LedgerStore>,
        frequency: Arc<dyn FrequencyCapStore>,
        platform_fee_bps: u32,
        cpc_estimated_ctr_bps: u32,
    ) -> Self {
        let monitor = CampaignFundingMonitor::new(catalog.clone(), ledger.clone());
        let selector = AdSelector::new(
            catalog.clone(),
            ledger.clone(),
            frequency.clone(),
            cpc_estimated_ctr_bps,
        );
        let payments = PaymentProcessor::new(
            catalog.clone(),
            ledger.clone(),
            monitor.clone(),
            platform_fee_bps,
        );
        Self {
            catalog,
            ledger,
            frequency,
            selector,
            payments,
            monitor,
        }
    }

    pub fn monitor(&self) -> &CampaignFundingMonitor {
        &self.monitor
    }

    pub fn frequency(&self) -> Arc<dyn FrequencyCapStore> {
        self.frequency.clone()
    }

    /// Read-only. Any selection failure degrades to no content.
    pub async fn serve_ad(&self, context: &PlacementContext) -> Option<AdRow> {
        match self.selector.select_ad(context, Utc::now()).await {
            Ok(selected) => selected.map(|candidate| candidate.ad),
            Err(error) => {
                tracing::warn!(
                    ad_space_id = %context.ad_space_id,
                    placement_type = %context.placement_type,
                    reason = %error,
                    "ad selection failed; serving no content"
                );
                None
            }
        }
    }

    pub async fn record_impression(
        &self,
        ad_id: &str,
        event: ImpressionEvent,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let ad = self
            .catalog
            .get_ad(ad_id)
            .await
            .map_err(map_catalog_error)?
            .ok_or_else(|| DeliveryError::NotFound(format!("ad {ad_id}")))?;

        let viewer = event
            .viewer_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let event_id = event
            .event_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let (Some(viewer), Some(cap)) = (viewer, ad.frequency_cap) {
            // A retried event id is a replay, not a second exposure.
            match self
                .frequency
                .record_exposure(&ad.ad_id, viewer, cap, Utc::now(), event_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(ad_id = %ad.ad_id, "impression over frequency cap; not billed");
                    return Ok(DeliveryOutcome::unbilled(
                        &ad.ad_id,
                        DeliveryKind::Impression,
                        NotBilledReason::FrequencyCapped,
                    ));
                }
                Err(error) => {
                    tracing::warn!(
                        ad_id = %ad.ad_id,
                        reason = %error,
                        "frequency cap unavailable; settling without recording exposure"
                    );
                }
            }
        }

        let settled = self
            .payments
            .settle_impression(&ad.ad_id, &event.ad_space_id, event.event_id)
            .await;
        outcome_from_settlement(&ad.ad_id, DeliveryKind::Impression, settled)
    }

    pub async fn record_click(
        &self,
        ad_id: &str,
        event: ClickEvent,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let settled = self
            .payments
            .settle_click(ad_id, &event.ad_space_id, event.event_id)
            .await;
        outcome_from_settlement(ad_id, DeliveryKind::Click, settled)
    }

    pub async fn get_campaign_funding_status(&self, campaign_id: &str) -> FundingStatus {
        self.monitor.get_campaign_funding_status(campaign_id).await
    }

    pub async fn campaign_funding_report(&self, campaign_id: &str) -> FundingReport {
        self.monitor.funding_report(campaign_id).await
    }

    pub async fn open_account(&self, account_id: &str) -> Result<AccountRow, DeliveryError> {
        let account_id = required(account_id, "account_id")?;
        self.ledger
            .open_account(account_id, Utc::now())
            .await
            .map_err(map_ledger_error)
    }

    pub async fn get_account(&self, account_id: &str) -> Result<AccountRow, DeliveryError> {
        self.ledger
            .get_account(account_id)
            .await
            .map_err(map_ledger_error)
    }

    pub async fn list_transactions(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TransactionRow>, DeliveryError> {
        let limit = limit
            .unwrap_or(DEFAULT_TRANSACTION_LIMIT)
            .clamp(1, MAX_TRANSACTION_LIMIT);
        self.ledger
            .list_transactions(account_id, limit)
            .await
            .map_err(map_ledger_error)
    }

    /// Explicit funding event. Resumes the account's auto-paused campaigns.
    pub async fn deposit(
        &self,
        account_id: &str,
        amount_sats: i64,
        idempotency_key: Option<String>,
    ) -> Result<DepositOutcome, DeliveryError> {
        if amount_sats <= 0 {
            return Err(DeliveryError::InvalidRequest(
                "amount_sats must be positive".to_string(),
            ));
        }
        let mut delta =
            LedgerDelta::new(account_id, amount_sats, TransactionType::Deposit, "deposit");
        if let Some(key) = idempotency_key.filter(|key| !key.trim().is_empty()) {
            delta = delta.with_idempotency_key(key);
        }
        let applied = self
            .ledger
            .apply_delta(delta)
            .await
            .map_err(map_ledger_error)?;
        tracing::info!(
            account_id = %account_id,
            amount_sats,
            balance_sats = applied.new_balance_sats,
            replayed = applied.replayed,
            "deposit applied"
        );
        let resumed_campaigns = self.monitor.resume_advertiser_campaigns(account_id).await;
        Ok(DepositOutcome {
            account_id: account_id.to_string(),
            transaction_id: applied.transaction_id,
            balance_sats: applied.new_balance_sats,
            replayed: applied.replayed,
            resumed_campaigns,
        })
    }

    pub async fn create_campaign(&self, body: NewCampaign) -> Result<CampaignRow, DeliveryError> {
        let advertiser_id = required(&body.advertiser_id, "advertiser_id")?.to_string();
        let status = body.status.unwrap_or(CampaignStatus::Draft);
        let now = Utc::now();
        let campaign = CampaignRow {
            campaign_id: body
                .campaign_id
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| format!("cmp_{}", Uuid::now_v7().simple())),
            advertiser_id,
            name: body.name,
            status,
            pause_reason: (status == CampaignStatus::Paused).then_some(PauseReason::Manual),
            budget_sats: body.budget_sats,
            daily_budget_sats: body.daily_budget_sats,
            spent_sats: 0,
            start_at: body.start_at,
            end_at: body.end_at,
            targeting: body.targeting,
            created_at: now,
            updated_at: now,
        };
        self.ledger
            .open_account(&campaign.advertiser_id, now)
            .await
            .map_err(map_ledger_error)?;
        let campaign = self
            .catalog
            .create_campaign(campaign)
            .await
            .map_err(map_catalog_error)?;
        tracing::info!(
            campaign_id = %campaign.campaign_id,
            advertiser_id = %campaign.advertiser_id,
            status = campaign.status.as_str(),
            "campaign created"
        );
        Ok(campaign)
    }

    /// Owner action. Pausing here is manual and the funding monitor never undoes it.
    pub async fn set_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
    ) -> Result<CampaignRow, DeliveryError> {
        let pause_reason = (status == CampaignStatus::Paused).then_some(PauseReason::Manual);
        let campaign = self
            .catalog
            .set_campaign_status(campaign_id, status, pause_reason, Utc::now())
            .await
            .map_err(map_catalog_error)?;
        tracing::info!(
            campaign_id = %campaign.campaign_id,
            status = campaign.status.as_str(),
            "campaign status set manually"
        );
        Ok(campaign)
    }

    pub async fn create_ad(&self, body: NewAd) -> Result<AdRow, DeliveryError> {
        let pricing = AdPricing::from_bids(body.bid_per_impression_sats, body.bid_per_click_sats)
            .ok_or_else(|| {
                DeliveryError::InvalidRequest(
                    "exactly one of bid_per_impression_sats or bid_per_click_sats must be set"
                        .to_string(),
                )
            })?;
        let now = Utc::now();
        let ad = AdRow {
            ad_id: body
                .ad_id
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| format!("ad_{}", Uuid::now_v7().simple())),
            campaign_id: body.campaign_id,
            status: body.status.unwrap_or(AdStatus::Pending),
            placement_type: body.placement_type.trim().to_string(),
            pricing,
            frequency_cap: FrequencyCap::new(body.freq_cap_views, body.freq_cap_hours),
            targeting: body.targeting,
            ad_space_ids: body
                .ad_space_ids
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            impressions: 0,
            clicks: 0,
            created_at: now,
            updated_at: now,
        };
        self.catalog.create_ad(ad).await.map_err(map_catalog_error)
    }

    /// Creates or replaces an ad space and opens its publisher's account.
    pub async fn put_ad_space(&self, body: NewAdSpace) -> Result<AdSpaceRow, DeliveryError> {
        let now = Utc::now();
        let ad_space = AdSpaceRow {
            ad_space_id: body.ad_space_id.trim().to_string(),
            publisher_id: body.publisher_id.trim().to_string(),
            min_bid_per_impression_sats: body.min_bid_per_impression_sats,
            min_bid_per_click_sats: body.min_bid_per_click_sats,
            width: body.width,
            height: body.height,
            category: body.category,
            created_at: now,
        };
        let ad_space = self
            .catalog
            .put_ad_space(ad_space)
            .await
            .map_err(map_catalog_error)?;
        self.ledger
            .open_account(&ad_space.publisher_id, now)
            .await
            .map_err(map_ledger_error)?;
        Ok(ad_space)
    }

    pub async fn run_funding_sweep(&self) -> u64 {
        self.monitor.resume_paused_campaigns_with_funds().await
    }

    pub async fn retry_pending_credits(&self) -> u64 {
        self.payments.retry_pending_credits().await
    }

    pub async fn pending_credits(&self) -> Vec<PendingCredit> {
        self.payments.pending_credits().await
    }
}

fn outcome_from_settlement(
    ad_id: &str,
    kind: DeliveryKind,
    settled: Result<Settlement, PaymentError>,
) -> Result<DeliveryOutcome, DeliveryError> {
    match settled {
        Ok(settlement) => Ok(DeliveryOutcome {
            ad_id: settlement.ad_id.clone(),
            kind,
            billed: settlement.billed,
            charged_sats: settlement.charged_sats,
            not_billed_reason: (!settlement.billed)
                .then_some(NotBilledReason::PricingModelMismatch),
            settlement: Some(settlement),
        }),
        Err(PaymentError::InsufficientFunds { .. }) => Ok(DeliveryOutcome::unbilled(
            ad_id,
            kind,
            NotBilledReason::InsufficientFunds,
        )),
        Err(error) => Err(map_payment_error(error)),
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, DeliveryError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DeliveryError::InvalidRequest(format!("{field} is required")));
    }
    Ok(value)
}

fn map_catalog_error(error: CatalogStoreError) -> DeliveryError {
    match error {
        CatalogStoreError::Conflict(message) => DeliveryError::Conflict(message),
        CatalogStoreError::NotFound(message) => DeliveryError::NotFound(message),
        CatalogStoreError::Invalid(message) => DeliveryError::InvalidRequest(message),
        CatalogStoreError::Db(message) => DeliveryError::Internal(message),
    }
}

fn map_ledger_error(error: LedgerStoreError) -> DeliveryError {
    match error {
        LedgerStoreError::AccountNotFound(account_id) => {
            DeliveryError::NotFound(format!("account {account_id}"))
        }
        LedgerStoreError::InvalidDelta(message) => DeliveryError::InvalidRequest(message),
        LedgerStoreError::Conflict(message) => DeliveryError::Conflict(message),
        LedgerStoreError::InsufficientFunds { .. } => DeliveryError::Conflict(error.to_string()),
        LedgerStoreError::Db(message) => DeliveryError::Internal(message),
    }
}

fn map_payment_error(error: PaymentError) -> DeliveryError {
    match error {
        PaymentError::AdNotFound(ad_id) => DeliveryError::NotFound(format!("ad {ad_id}")),
        PaymentError::CampaignNotFound(campaign_id) => {
            DeliveryError::NotFound(format!("campaign {campaign_id}"))
        }
        PaymentError::AdSpaceNotFound(ad_space_id) => {
            DeliveryError::NotFound(format!("ad space {ad_space_id}"))
        }
        PaymentError::InsufficientFunds { .. } => DeliveryError::Conflict(error.to_string()),
        PaymentError::Ledger(error) => map_ledger_error(error),
        PaymentError::Catalog(error) => map_catalog_error(error),
    }
}
