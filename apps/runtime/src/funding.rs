use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::catalog::{
    CampaignRow, CampaignStatus, CatalogStore, CatalogStoreError, PauseReason, StatusTransition,
};
use crate::frequency::{FrequencyCapStore, MAX_WINDOW_HOURS};
use crate::ledger::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundingStatus {
    Active,
    Paused,
    Unknown,
}

/// Dashboard view of one campaign's funding state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingReport {
    pub campaign_id: String,
    pub status: FundingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertiser_balance_sats: Option<i64>,
}

/// Moves campaigns between ACTIVE and auto-PAUSED based on advertiser balance.
///
/// Every operation fails closed: lookup errors are logged and reported as
/// `false`, `None` or `0` so a broken store never takes down serving or the sweep.
/// Manual pauses are never touched because every transition here is a guarded
/// compare-and-set on the (status, pause reason) pair.
#[derive(Clone)]
pub struct CampaignFundingMonitor {
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn LedgerStore>,
}

impl CampaignFundingMonitor {
    pub fn new(catalog: Arc<dyn CatalogStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { catalog, ledger }
    }

    pub async fn check_campaign_funding(&self, campaign_id: &str) -> bool {
        let Some(campaign) = self.load_campaign(campaign_id).await else {
            return false;
        };
        if campaign.status != CampaignStatus::Active {
            return false;
        }
        self.advertiser_balance(&campaign.advertiser_id)
            .await
            .is_some_and(|balance_sats| balance_sats > 0)
    }

    /// Idempotent. A campaign that is already paused, manually or not, is returned
    /// unchanged.
    pub async fn pause_campaign_due_to_insufficient_funds(
        &self,
        campaign_id: &str,
    ) -> Option<CampaignRow> {
        match self
            .catalog
            .transition_campaign(campaign_id, StatusTransition::AUTO_PAUSE, Utc::now())
            .await
        {
            Ok(Some(campaign)) => {
                tracing::info!(
                    campaign_id = %campaign.campaign_id,
                    advertiser_id = %campaign.advertiser_id,
                    reason = PauseReason::InsufficientFunds.as_str(),
                    "campaign auto-paused"
                );
                Some(campaign)
            }
            Ok(None) => self.load_campaign(campaign_id).await,
            Err(error) => {
                log_swallowed(campaign_id, "pause", &error);
                None
            }
        }
    }

    /// Returns `None` unless the campaign was auto-paused and its advertiser now has
    /// a positive balance.
    pub async fn resume_campaign_if_funded(&self, campaign_id: &str) -> Option<CampaignRow> {
        let campaign = self.load_campaign(campaign_id).await?;
        if !campaign.is_auto_paused() {
            return None;
        }
        let balance_sats = self.advertiser_balance(&campaign.advertiser_id).await?;
        if balance_sats <= 0 {
            return None;
        }
        self.apply_resume(&campaign, balance_sats).await
    }

    /// Sweeps every auto-paused campaign and returns how many were resumed.
    pub async fn resume_paused_campaigns_with_funds(&self) -> u64 {
        let paused = match self
            .catalog
            .list_campaigns_by_status(CampaignStatus::Paused)
            .await
        {
            Ok(paused) => paused,
            Err(error) => {
                tracing::warn!(reason = %error, "funding sweep could not list paused campaigns");
                return 0;
            }
        };
        self.resume_funded(paused).await
    }

    /// Funding-event hook: resumes the advertiser's auto-paused campaigns.
    pub async fn resume_advertiser_campaigns(&self, advertiser_id: &str) -> u64 {
        let campaigns = match self
            .catalog
            .list_campaigns_for_advertiser(advertiser_id)
            .await
        {
            Ok(campaigns) => campaigns,
            Err(error) => {
                tracing::warn!(
                    advertiser_id = %advertiser_id,
                    reason = %error,
                    "could not list advertiser campaigns for resume"
                );
                return 0;
            }
        };
        self.resume_funded(campaigns).await
    }

    pub async fn get_campaign_funding_status(&self, campaign_id: &str) -> FundingStatus {
        self.funding_report(campaign_id).await.status
    }

    pub async fn funding_report(&self, campaign_id: &str) -> FundingReport {
        let Some(campaign) = self.load_campaign(campaign_id).await else {
            return FundingReport {
                campaign_id: campaign_id.to_string(),
                status: FundingStatus::Unknown,
                pause_reason: None,
                advertiser_balance_sats: None,
            };
        };
        let status = match campaign.status {
            CampaignStatus::Active => FundingStatus::Active,
            CampaignStatus::Paused => FundingStatus::Paused,
            _ => FundingStatus::Unknown,
        };
        FundingReport {
            campaign_id: campaign.campaign_id,
            status,
            pause_reason: campaign.pause_reason,
            advertiser_balance_sats: self.advertiser_balance(&campaign.advertiser_id).await,
        }
    }

    async fn resume_funded(&self, campaigns: Vec<CampaignRow>) -> u64 {
        let mut balances = HashMap::<String, Option<i64>>::new();
        let mut resumed = 0_u64;
        for campaign in campaigns.into_iter().filter(CampaignRow::is_auto_paused) {
            let balance = match balances.get(&campaign.advertiser_id) {
                Some(balance) => *balance,
                None => {
                    let balance = self.advertiser_balance(&campaign.advertiser_id).await;
                    balances.insert(campaign.advertiser_id.clone(), balance);
                    balance
                }
            };
            let Some(balance_sats) = balance.filter(|balance_sats| *balance_sats > 0) else {
                continue;
            };
            if self.apply_resume(&campaign, balance_sats).await.is_some() {
                resumed += 1;
            }
        }
        resumed
    }

    async fn apply_resume(&self, campaign: &CampaignRow, balance_sats: i64) -> Option<CampaignRow> {
        match self
            .catalog
            .transition_campaign(
                &campaign.campaign_id,
                StatusTransition::AUTO_RESUME,
                Utc::now(),
            )
            .await
        {
            Ok(Some(resumed)) => {
                tracing::info!(
                    campaign_id = %resumed.campaign_id,
                    advertiser_id = %resumed.advertiser_id,
                    balance_sats,
                    "campaign auto-resumed"
                );
                Some(resumed)
            }
            // Someone changed the campaign since it was read.
            Ok(None) => None,
            Err(error) => {
                log_swallowed(&campaign.campaign_id, "resume", &error);
                None
            }
        }
    }

    async fn load_campaign(&self, campaign_id: &str) -> Option<CampaignRow> {
        match self.catalog.get_campaign(campaign_id).await {
            Ok(campaign) => campaign,
            Err(error) => {
                log_swallowed(campaign_id, "lookup", &error);
                None
            }
        }
    }

    async fn advertiser_balance(&self, advertiser_id: &str) -> Option<i64> {
        match self.ledger.get_balance(advertiser_id).await {
            Ok(balance_sats) => Some(balance_sats),
            Err(error) => {
                tracing::warn!(
                    advertiser_id = %advertiser_id,
                    reason = %error,
                    "funding monitor could not read advertiser balance"
                );
                None
            }
        }
    }
}

/// Background sweep: every tick resumes funded campaigns and prunes frequency
/// exposures older than the longest allowed cap window.
pub fn spawn_sweep_worker(
    monitor: CampaignFundingMonitor,
    frequency: Arc<dyn FrequencyCapStore>,
    every: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let resumed = monitor.resume_paused_campaigns_with_funds().await;
            let cutoff = Utc::now() - ChronoDuration::hours(i64::from(MAX_WINDOW_HOURS));
            let pruned = match frequency.prune_expired(cutoff).await {
                Ok(pruned) => pruned,
                Err(error) => {
                    tracing::warn!(reason = %error, "frequency prune failed");
                    0
                }
            };
            tracing::info!(resumed, pruned, "funding sweep completed");
        }
    })
}

fn log_swallowed(campaign_id: &str, action: &str, error: &CatalogStoreError) {
    tracing::warn!(
        campaign_id = %campaign_id,
        action,
        reason = %error,
        "funding monitor swallowed catalog error"
    );
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};
    use chrono::Utc;

    use super::*;
    use crate::catalog::{Targeting, store as catalog_store};
    use crate::ledger::{LedgerDelta, TransactionType, store as ledger_store};

    async fn setup(balance_sats: i64) -> Result<(CampaignFundingMonitor, Arc<dyn CatalogStore>, Arc<dyn LedgerStore>)> {
        let catalog = catalog_store::memory();
        let ledger = ledger_store::memory();
        let now = Utc::now();
        ledger.open_account("adv_1", now).await?;
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
        for campaign_id in ["cmp_1", "cmp_2"] {
            catalog
                .create_campaign(CampaignRow {
                    campaign_id: campaign_id.to_string(),
                    advertiser_id: "adv_1".to_string(),
                    name: campaign_id.to_string(),
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
        }
        Ok((
            CampaignFundingMonitor::new(catalog.clone(), ledger.clone()),
            catalog,
            ledger,
        ))
    }

    #[tokio::test]
    async fn pausing_twice_is_a_no_op_success() -> Result<()> {
        let (monitor, _, _) = setup(0).await?;
        let first = monitor
            .pause_campaign_due_to_insufficient_funds("cmp_1")
            .await
            .ok_or_else(|| anyhow!("first pause"))?;
        let second = monitor
            .pause_campaign_due_to_insufficient_funds("cmp_1")
            .await
            .ok_or_else(|| anyhow!("second pause"))?;
        for campaign in [first, second] {
            assert_eq!(campaign.status, CampaignStatus::Paused);
            assert_eq!(campaign.pause_reason, Some(PauseReason::InsufficientFunds));
        }
        assert_eq!(
            monitor.get_campaign_funding_status("cmp_1").await,
            FundingStatus::Paused
        );
        Ok(())
    }

    #[tokio::test]
    async fn auto_pause_never_overrides_a_manual_pause() -> Result<()> {
        let (monitor, catalog, _) = setup(0).await?;
        catalog
            .set_campaign_status(
                "cmp_1",
                CampaignStatus::Paused,
                Some(PauseReason::Manual),
                Utc::now(),
            )
            .await?;
        let campaign = monitor
            .pause_campaign_due_to_insufficient_funds("cmp_1")
            .await
            .ok_or_else(|| anyhow!("pause"))?;
        assert_eq!(campaign.pause_reason, Some(PauseReason::Manual));
        Ok(())
    }

    #[tokio::test]
    async fn sweep_resumes_only_auto_paused_campaigns_with_funds() -> Result<()> {
        let (monitor, catalog, ledger) = setup(0).await?;
        monitor
            .pause_campaign_due_to_insufficient_funds("cmp_1")
            .await
            .ok_or_else(|| anyhow!("pause"))?;
        catalog
            .set_campaign_status(
                "cmp_2",
                CampaignStatus::Paused,
                Some(PauseReason::Manual),
                Utc::now(),
            )
            .await?;

        assert_eq!(monitor.resume_paused_campaigns_with_funds().await, 0);
        assert!(monitor.resume_campaign_if_funded("cmp_1").await.is_none());

        ledger
            .apply_delta(LedgerDelta::new("adv_1", 500, TransactionType::Deposit, "top up"))
            .await?;
        assert_eq!(monitor.resume_paused_campaigns_with_funds().await, 1);
        assert_eq!(monitor.resume_paused_campaigns_with_funds().await, 0);

        let resumed = catalog
            .get_campaign("cmp_1")
            .await?
            .ok_or_else(|| anyhow!("cmp_1"))?;
        assert_eq!(resumed.status, CampaignStatus::Active);
        assert_eq!(resumed.pause_reason, None);

        let manual = catalog
            .get_campaign("cmp_2")
            .await?
            .ok_or_else(|| anyhow!("cmp_2"))?;
        assert_eq!(manual.status, CampaignStatus::Paused);
        assert!(monitor.resume_campaign_if_funded("cmp_2").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn funding_event_resumes_advertiser_campaigns() -> Result<()> {
        let (monitor, _, ledger) = setup(0).await?;
        for campaign_id in ["cmp_1", "cmp_2"] {
            monitor
                .pause_campaign_due_to_insufficient_funds(campaign_id)
                .await
                .ok_or_else(|| anyhow!("pause"))?;
        }
        assert!(!monitor.check_campaign_funding("cmp_1").await);

        ledger
            .apply_delta(LedgerDelta::new("adv_1", 1, TransactionType::Deposit, "top up"))
            .await?;
        assert_eq!(monitor.resume_advertiser_campaigns("adv_1").await, 2);
        assert!(monitor.check_campaign_funding("cmp_1").await);
        assert!(monitor.check_campaign_funding("cmp_2").await);
        Ok(())
    }

    #[tokio::test]
    async fn missing_campaigns_fail_closed() -> Result<()> {
        let (monitor, _, _) = setup(100).await?;
        assert!(!monitor.check_campaign_funding("missing").await);
        assert!(
            monitor
                .pause_campaign_due_to_insufficient_funds("missing")
                .await
                .is_none()
        );
        assert!(monitor.resume_campaign_if_funded("missing").await.is_none());
        assert_eq!(
            monitor.get_campaign_funding_status("missing").await,
            FundingStatus::Unknown
        );

        let report = monitor.funding_report("cmp_1").await;
        assert_eq!(report.status, FundingStatus::Active);
        assert_eq!(report.advertiser_balance_sats, Some(100));
        Ok(())
    }
}
