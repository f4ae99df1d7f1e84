use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::{AdPricing, CatalogStore, CatalogStoreError, DeliveryKind};
use crate::funding::CampaignFundingMonitor;
use crate::ledger::{LedgerDelta, LedgerStore, LedgerStoreError, TransactionType};

pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("ad not found: {0}")]
    AdNotFound(String),
    #[error("campaign not found: {0}")]
    CampaignNotFound(String),
    #[error("ad space not found: {0}")]
    AdSpaceNotFound(String),
    #[error("insufficient funds for campaign {campaign_id}: balance {balance_sats}, charge {requested_sats}")]
    InsufficientFunds {
        campaign_id: String,
        balance_sats: i64,
        requested_sats: i64,
    },
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerStoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogStoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub ad_id: String,
    pub ad_space_id: String,
    pub kind: DeliveryKind,
    /// Caller-supplied event id. Retries with the same id never bill twice.
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub ad_id: String,
    pub campaign_id: String,
    pub kind: DeliveryKind,
    pub billed: bool,
    pub charged_sats: i64,
    pub publisher_earning_sats: i64,
    pub platform_fee_sats: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debit_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_transaction_id: Option<String>,
    pub credit_pending: bool,
    pub replayed: bool,
}

/// Publisher earning owed after the advertiser was already debited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCredit {
    pub publisher_id: String,
    pub amount_sats: i64,
    pub idempotency_key: String,
    pub ad_id: String,
    pub campaign_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub queued_at: DateTime<Utc>,
}

/// Per-event charge for the ad's pricing model. The other event kind is free.
pub fn charge_for(pricing: AdPricing, kind: DeliveryKind) -> i64 {
    match (pricing, kind) {
        // Truncated; remainders below one sat are not accumulated.
        (AdPricing::Cpm { bid_per_mille_sats }, DeliveryKind::Impression) => {
            bid_per_mille_sats / 1_000
        }
        (AdPricing::Cpc { bid_per_click_sats }, DeliveryKind::Click) => bid_per_click_sats,
        _ => 0,
    }
}

pub fn platform_fee_sats(charged_sats: i64, platform_fee_bps: u32) -> i64 {
    if platform_fee_bps == 0 || charged_sats <= 0 {
        return 0;
    }
    // Ceil to avoid undercharging on fractional bps.
    let fee = charged_sats
        .saturating_mul(i64::from(platform_fee_bps))
        .saturating_add(9_999)
        / 10_000;
    fee.min(charged_sats)
}

/// Debits advertisers and credits publishers per delivered impression or click.
///
/// The two ledger writes are not atomic across accounts. A failed publisher credit
/// leaves the debit in place and is queued for `retry_pending_credits`, which reuses
/// the original idempotency key so a credit can never land twice.
#[derive(Clone)]
pub struct PaymentProcessor {
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn LedgerStore>,
    monitor: CampaignFundingMonitor,
    platform_fee_bps: u32,
    pending_credits: Arc<Mutex<Vec<PendingCredit>>>,
}

impl PaymentProcessor {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<dyn LedgerStore>,
        monitor: CampaignFundingMonitor,
        platform_fee_bps: u32,
    ) -> Self {
        Self {
            catalog,
            ledger,
            monitor,
            platform_fee_bps,
            pending_credits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn settle_impression(
        &self,
        ad_id: &str,
        ad_space_id: &str,
        event_id: Option<String>,
    ) -> Result<Settlement, PaymentError> {
        self.settle(SettlementRequest {
            ad_id: ad_id.to_string(),
            ad_space_id: ad_space_id.to_string(),
            kind: DeliveryKind::Impression,
            event_id,
        })
        .await
    }

    pub async fn settle_click(
        &self,
        ad_id: &str,
        ad_space_id: &str,
        event_id: Option<String>,
    ) -> Result<Settlement, PaymentError> {
        self.settle(SettlementRequest {
            ad_id: ad_id.to_string(),
            ad_space_id: ad_space_id.to_string(),
            kind: DeliveryKind::Click,
            event_id,
        })
        .await
    }

    pub async fn settle(&self, request: SettlementRequest) -> Result<Settlement, PaymentError> {
        let ad = self
            .catalog
            .get_ad(&request.ad_id)
            .await?
            .ok_or_else(|| PaymentError::AdNotFound(request.ad_id.clone()))?;
        let campaign = self
            .catalog
            .get_campaign(&ad.campaign_id)
            .await?
            .ok_or_else(|| PaymentError::CampaignNotFound(ad.campaign_id.clone()))?;
        let ad_space = self
            .catalog
            .get_ad_space(&request.ad_space_id)
            .await?
            .ok_or_else(|| PaymentError::AdSpaceNotFound(request.ad_space_id.clone()))?;

        let mut settlement = Settlement {
            ad_id: ad.ad_id.clone(),
            campaign_id: campaign.campaign_id.clone(),
            kind: request.kind,
            billed: false,
            charged_sats: 0,
            publisher_earning_sats: 0,
            platform_fee_sats: 0,
            debit_transaction_id: None,
            credit_transaction_id: None,
            credit_pending: false,
            replayed: false,
        };

        let charge = charge_for(ad.pricing, request.kind);
        if charge <= 0 {
            self.record_delivery(&ad.ad_id, request.kind, 0).await;
            return Ok(settlement);
        }

        let settlement_key = settlement_key(request.kind, &ad.ad_id, request.event_id.as_deref());

        let debit = LedgerDelta::new(
            &campaign.advertiser_id,
            -charge,
            TransactionType::AdPayment,
            format!("{} on ad {}", request.kind.as_str(), ad.ad_id),
        )
        .with_idempotency_key(format!("{settlement_key}:debit"));
        let debit = match self.ledger.apply_delta(debit).await {
            Ok(applied) => applied,
            Err(LedgerStoreError::InsufficientFunds {
                balance_sats,
                requested_sats,
            }) => {
                tracing::info!(
                    campaign_id = %campaign.campaign_id,
                    ad_id = %ad.ad_id,
                    account_id = %campaign.advertiser_id,
                    balance_sats,
                    charged_sats = requested_sats,
                    "settlement refused for insufficient funds"
                );
                self.monitor
                    .pause_campaign_due_to_insufficient_funds(&campaign.campaign_id)
                    .await;
                // Already delivered; counted but never billed.
                self.record_delivery(&ad.ad_id, request.kind, 0).await;
                return Err(PaymentError::InsufficientFunds {
                    campaign_id: campaign.campaign_id,
                    balance_sats,
                    requested_sats,
                });
            }
            Err(error) => return Err(error.into()),
        };

        let fee = platform_fee_sats(charge, self.platform_fee_bps);
        let share = charge - fee;
        settlement.billed = true;
        settlement.charged_sats = charge;
        settlement.platform_fee_sats = fee;
        settlement.publisher_earning_sats = share;
        settlement.debit_transaction_id = Some(debit.transaction_id);
        settlement.replayed = debit.replayed;

        if share > 0 {
            let credit_key = format!("{settlement_key}:credit");
            let credit = LedgerDelta::new(
                &ad_space.publisher_id,
                share,
                TransactionType::PublisherEarning,
                format!("{} on ad {}", request.kind.as_str(), ad.ad_id),
            )
            .with_idempotency_key(credit_key.clone());
            match self.ledger.apply_delta(credit).await {
                Ok(applied) => settlement.credit_transaction_id = Some(applied.transaction_id),
                Err(error) => {
                    tracing::error!(
                        campaign_id = %campaign.campaign_id,
                        ad_id = %ad.ad_id,
                        account_id = %ad_space.publisher_id,
                        charged_sats = charge,
                        reason = %error,
                        "reconciliation error: publisher credit failed after advertiser debit"
                    );
                    self.queue_credit(PendingCredit {
                        publisher_id: ad_space.publisher_id.clone(),
                        amount_sats: share,
                        idempotency_key: credit_key,
                        ad_id: ad.ad_id.clone(),
                        campaign_id: campaign.campaign_id.clone(),
                        attempts: 1,
                        last_error: error.to_string(),
                        queued_at: Utc::now(),
                    })
                    .await;
                    settlement.credit_pending = true;
                }
            }
        }

        if !debit.replayed {
            self.record_delivery(&ad.ad_id, request.kind, charge).await;
            tracing::info!(
                campaign_id = %campaign.campaign_id,
                ad_id = %ad.ad_id,
                kind = request.kind.as_str(),
                charged_sats = charge,
                publisher_earning_sats = share,
                "settlement applied"
            );
        }
        Ok(settlement)
    }

    /// Replays queued publisher credits. Returns how many settled.
    pub async fn retry_pending_credits(&self) -> u64 {
        let queued = std::mem::take(&mut *self.pending_credits.lock().await);
        let mut settled = 0_u64;
        let mut still_pending = Vec::new();
        for mut credit in queued {
            let delta = LedgerDelta::new(
                &credit.publisher_id,
                credit.amount_sats,
                TransactionType::PublisherEarning,
                format!("retried earning on ad {}", credit.ad_id),
            )
            .with_idempotency_key(credit.idempotency_key.clone());
            match self.ledger.apply_delta(delta).await {
                Ok(_) => {
                    tracing::info!(
                        account_id = %credit.publisher_id,
                        ad_id = %credit.ad_id,
                        amount_sats = credit.amount_sats,
                        "pending publisher credit settled"
                    );
                    settled += 1;
                }
                Err(error) => {
                    credit.attempts = credit.attempts.saturating_add(1);
                    credit.last_error = error.to_string();
                    tracing::error!(
                        account_id = %credit.publisher_id,
                        ad_id = %credit.ad_id,
                        attempts = credit.attempts,
                        reason = %error,
                        "reconciliation error: publisher credit retry failed"
                    );
                    still_pending.push(credit);
                }
            }
        }
        if !still_pending.is_empty() {
            self.pending_credits.lock().await.extend(still_pending);
        }
        settled
    }

    pub async fn pending_credits(&self) -> Vec<PendingCredit> {
        self.pending_credits.lock().await.clone()
    }

    async fn queue_credit(&self, credit: PendingCredit) {
        let mut pending = self.pending_credits.lock().await;
        // The same event can fail twice; keep one entry per key.
        if pending
            .iter()
            .any(|queued| queued.idempotency_key == credit.idempotency_key)
        {
            return;
        }
        pending.push(credit);
    }

    async fn record_delivery(&self, ad_id: &str, kind: DeliveryKind, charged_sats: i64) {
        if let Err(error) = self
            .catalog
            .record_delivery(ad_id, kind, charged_sats, Utc::now())
            .await
        {
            tracing::warn!(
                ad_id = %ad_id,
                kind = kind.as_str(),
                reason = %error,
                "could not record delivery counters"
            );
        }
    }
}

/// Ledger key prefix for one delivery. Caller event ids are only unique per ad,
/// so the key is scoped to the ad as well as the event kind.
fn settlement_key(kind: DeliveryKind, ad_id: &str, event_id: Option<&str>) -> String {
    match event_id.map(str::trim).filter(|value| !value.is_empty()) {
        Some(event_id) => format!("{}:{ad_id}:{event_id}", kind.as_str()),
        None => format!("settle_{}", Uuid::now_v7().simple()),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};

    use super::*;
    use crate::catalog::{
        AdRow, AdSpaceRow, AdStatus, CampaignRow, CampaignStatus, PauseReason, Targeting,
        store as catalog_store,
    };
    use crate::ledger::store as ledger_store;

    struct Fixture {
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<dyn LedgerStore>,
        payments: PaymentProcessor,
    }

    async fn fixture(balance_sats: i64, pricing: AdPricing, open_publisher: bool) -> Result<Fixture> {
        let catalog = catalog_store::memory();
        let ledger = ledger_store::memory();
        let now = Utc::now();
        ledger.open_account("adv_1", now).await?;
        if open_publisher {
            ledger.open_account("pub_1", now).await?;
        }
        if balance_sats > 0 {
            ledger
                .apply_delta(LedgerDelta::new(
                    "adv_1",
                    balance_sats,
                    TransactionType::Deposit,
                    "seed",
                ))
                .await?;
        }
        catalog
            .create_campaign(CampaignRow {
                campaign_id: "cmp_1".to_string(),
                advertiser_id: "adv_1".to_string(),
                name: "launch".to_string(),
                status: CampaignStatus::Active,
                pause_reason: None,
                budget_sats: 1_000,
                daily_budget_sats: 1_000,
                spent_sats: 0,
                start_at: None,
                end_at: None,
                targeting: Targeting::default(),
                created_at: now,
                updated_at: now,
            })
            .await?;
        catalog
            .create_ad(AdRow {
                ad_id: "ad_1".to_string(),
                campaign_id: "cmp_1".to_string(),
                status: AdStatus::Active,
                placement_type: "banner".to_string(),
                pricing,
                frequency_cap: None,
                targeting: Targeting::default(),
                ad_space_ids: Vec::new(),
                impressions: 0,
                clicks: 0,
                created_at: now,
                updated_at: now,
            })
            .await?;
        catalog
            .put_ad_space(AdSpaceRow {
                ad_space_id: "space_1".to_string(),
                publisher_id: "pub_1".to_string(),
                min_bid_per_impression_sats: 0,
                min_bid_per_click_sats: 0,
                width: 300,
                height: 250,
                category: None,
                created_at: now,
            })
            .await?;
        let monitor = CampaignFundingMonitor::new(catalog.clone(), ledger.clone());
        let payments = PaymentProcessor::new(
            catalog.clone(),
            ledger.clone(),
            monitor,
            DEFAULT_PLATFORM_FEE_BPS,
        );
        Ok(Fixture {
            catalog,
            ledger,
            payments,
        })
    }

    fn cpc(bid_per_click_sats: i64) -> AdPricing {
        AdPricing::Cpc { bid_per_click_sats }
    }

    #[test]
    fn charges_follow_the_pricing_model() {
        let cpm = AdPricing::Cpm {
            bid_per_mille_sats: 2_999,
        };
        assert_eq!(charge_for(cpm, DeliveryKind::Impression), 2);
        assert_eq!(charge_for(cpm, DeliveryKind::Click), 0);
        assert_eq!(charge_for(cpc(100), DeliveryKind::Click), 100);
        assert_eq!(charge_for(cpc(100), DeliveryKind::Impression), 0);
    }

    #[test]
    fn platform_fee_rounds_up_and_never_exceeds_charge() {
        assert_eq!(platform_fee_sats(100, 1_000), 10);
        assert_eq!(platform_fee_sats(3, 1_000), 1);
        assert_eq!(platform_fee_sats(5, 10_000), 5);
        assert_eq!(platform_fee_sats(5, 0), 0);
    }

    #[tokio::test]
    async fn click_debits_advertiser_and_credits_publisher_share() -> Result<()> {
        let fx = fixture(250, cpc(100), true).await?;
        let settlement = fx.payments.settle_click("ad_1", "space_1", None).await?;
        assert!(settlement.billed);
        assert_eq!(settlement.charged_sats, 100);
        assert_eq!(settlement.platform_fee_sats, 10);
        assert_eq!(settlement.publisher_earning_sats, 90);
        assert_eq!(fx.ledger.get_balance("adv_1").await?, 150);
        assert_eq!(fx.ledger.get_balance("pub_1").await?, 90);

        let ad = fx.catalog.get_ad("ad_1").await?.ok_or_else(|| anyhow!("ad"))?;
        assert_eq!(ad.clicks, 1);
        let campaign = fx
            .catalog
            .get_campaign("cmp_1")
            .await?
            .ok_or_else(|| anyhow!("campaign"))?;
        assert_eq!(campaign.spent_sats, 100);
        Ok(())
    }

    #[tokio::test]
    async fn insufficient_funds_pauses_campaign_without_charging() -> Result<()> {
        let fx = fixture(50, cpc(100), true).await?;
        let result = fx.payments.settle_click("ad_1", "space_1", None).await;
        assert!(matches!(
            result,
            Err(PaymentError::InsufficientFunds {
                balance_sats: 50,
                requested_sats: 100,
                ..
            })
        ));
        assert_eq!(fx.ledger.get_balance("adv_1").await?, 50);
        assert_eq!(fx.ledger.get_balance("pub_1").await?, 0);

        let campaign = fx
            .catalog
            .get_campaign("cmp_1")
            .await?
            .ok_or_else(|| anyhow!("campaign"))?;
        assert_eq!(campaign.status, CampaignStatus::Paused);
        assert_eq!(campaign.pause_reason, Some(PauseReason::InsufficientFunds));
        assert_eq!(campaign.spent_sats, 0);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_event_kind_is_counted_but_free() -> Result<()> {
        let fx = fixture(250, cpc(100), true).await?;
        let settlement = fx.payments.settle_impression("ad_1", "space_1", None).await?;
        assert!(!settlement.billed);
        assert_eq!(settlement.charged_sats, 0);
        assert_eq!(fx.ledger.get_balance("adv_1").await?, 250);
        let ad = fx.catalog.get_ad("ad_1").await?.ok_or_else(|| anyhow!("ad"))?;
        assert_eq!(ad.impressions, 1);
        Ok(())
    }

    #[tokio::test]
    async fn retried_event_id_never_bills_twice() -> Result<()> {
        let fx = fixture(250, cpc(100), true).await?;
        let first = fx
            .payments
            .settle_click("ad_1", "space_1", Some("evt_1".to_string()))
            .await?;
        let second = fx
            .payments
            .settle_click("ad_1", "space_1", Some("evt_1".to_string()))
            .await?;
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.debit_transaction_id, second.debit_transaction_id);
        assert_eq!(fx.ledger.get_balance("adv_1").await?, 150);
        assert_eq!(fx.ledger.get_balance("pub_1").await?, 90);
        let ad = fx.catalog.get_ad("ad_1").await?.ok_or_else(|| anyhow!("ad"))?;
        assert_eq!(ad.clicks, 1);
        Ok(())
    }

    #[tokio::test]
    async fn shared_event_id_bills_each_ad_separately() -> Result<()> {
        let fx = fixture(250, cpc(100), true).await?;
        let now = Utc::now();
        let mut second_ad = fx.catalog.get_ad("ad_1").await?.ok_or_else(|| anyhow!("ad"))?;
        second_ad.ad_id = "ad_2".to_string();
        second_ad.created_at = now;
        second_ad.updated_at = now;
        fx.catalog.create_ad(second_ad).await?;

        let first = fx
            .payments
            .settle_click("ad_1", "space_1", Some("evt_1".to_string()))
            .await?;
        let second = fx
            .payments
            .settle_click("ad_2", "space_1", Some("evt_1".to_string()))
            .await?;
        assert!(first.billed && second.billed);
        assert!(!second.replayed);
        assert_ne!(first.debit_transaction_id, second.debit_transaction_id);
        assert_eq!(fx.ledger.get_balance("adv_1").await?, 50);
        assert_eq!(fx.ledger.get_balance("pub_1").await?, 180);

        let ad = fx.catalog.get_ad("ad_2").await?.ok_or_else(|| anyhow!("ad"))?;
        assert_eq!(ad.clicks, 1);
        let campaign = fx
            .catalog
            .get_campaign("cmp_1")
            .await?
            .ok_or_else(|| anyhow!("campaign"))?;
        assert_eq!(campaign.spent_sats, 200);
        Ok(())
    }

    #[test]
    fn settlement_keys_are_scoped_to_the_ad() {
        assert_eq!(
            settlement_key(DeliveryKind::Click, "ad_1", Some(" evt_1 ")),
            "click:ad_1:evt_1"
        );
        assert_ne!(
            settlement_key(DeliveryKind::Click, "ad_1", Some("evt_1")),
            settlement_key(DeliveryKind::Click, "ad_2", Some("evt_1"))
        );
        assert!(settlement_key(DeliveryKind::Impression, "ad_1", Some("  ")).starts_with("settle_"));
    }

    #[tokio::test]
    async fn failed_publisher_credit_is_queued_and_retried() -> Result<()> {
        let fx = fixture(250, cpc(100), false).await?;
        let settlement = fx
            .payments
            .settle_click("ad_1", "space_1", Some("evt_1".to_string()))
            .await?;
        assert!(settlement.billed);
        assert!(settlement.credit_pending);
        assert_eq!(fx.ledger.get_balance("adv_1").await?, 150);
        assert_eq!(fx.payments.pending_credits().await.len(), 1);

        assert_eq!(fx.payments.retry_pending_credits().await, 0);
        let pending = fx.payments.pending_credits().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.first().map(|credit| credit.attempts), Some(2));

        fx.ledger.open_account("pub_1", Utc::now()).await?;
        assert_eq!(fx.payments.retry_pending_credits().await, 1);
        assert!(fx.payments.pending_credits().await.is_empty());
        assert_eq!(fx.ledger.get_balance("pub_1").await?, 90);

        // A late retry of the same event cannot credit again.
        let replay = fx
            .payments
            .settle_click("ad_1", "space_1", Some("evt_1".to_string()))
            .await?;
        assert!(replay.replayed);
        assert!(!replay.credit_pending);
        assert_eq!(fx.ledger.get_balance("pub_1").await?, 90);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_references_are_reported() -> Result<()> {
        let fx = fixture(250, cpc(100), true).await?;
        assert!(matches!(
            fx.payments.settle_click("ad_missing", "space_1", None).await,
            Err(PaymentError::AdNotFound(_))
        ));
        assert!(matches!(
            fx.payments.settle_click("ad_1", "space_missing", None).await,
            Err(PaymentError::AdSpaceNotFound(_))
        ));
        Ok(())
    }
}
