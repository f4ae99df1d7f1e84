use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::catalog::types::{
    AdPricing, AdRow, AdSpaceRow, AdStatus, CampaignRow, CampaignStatus, DeliveryKind,
    PauseReason, Targeting, validate_ad, validate_ad_space, validate_campaign,
};
use crate::db::RuntimeDb;
use crate::frequency::FrequencyCap;

#[derive(Debug, thiserror::Error)]
pub enum CatalogStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Guarded campaign status change. Applied only while the campaign is still in
/// `from`/`from_reason`, so a concurrent manual change always wins over the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: CampaignStatus,
    pub from_reason: Option<PauseReason>,
    pub to: CampaignStatus,
    pub to_reason: Option<PauseReason>,
}

impl StatusTransition {
    pub const AUTO_PAUSE: Self = Self {
        from: CampaignStatus::Active,
        from_reason: None,
        to: CampaignStatus::Paused,
        to_reason: Some(PauseReason::InsufficientFunds),
    };

    pub const AUTO_RESUME: Self = Self {
        from: CampaignStatus::Paused,
        from_reason: Some(PauseReason::InsufficientFunds),
        to: CampaignStatus::Active,
        to_reason: None,
    };
}

#[derive(Debug, Clone)]
pub struct AdCandidate {
    pub ad: AdRow,
    pub campaign: CampaignRow,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_campaign(&self, campaign: CampaignRow)
    -> Result<CampaignRow, CatalogStoreError>;

    async fn get_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<Option<CampaignRow>, CatalogStoreError>;

    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<CampaignRow>, CatalogStoreError>;

    async fn list_campaigns_for_advertiser(
        &self,
        advertiser_id: &str,
    ) -> Result<Vec<CampaignRow>, CatalogStoreError>;

    /// Unconditional status change, used for explicit owner actions.
    async fn set_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
        pause_reason: Option<PauseReason>,
        now: DateTime<Utc>,
    ) -> Result<CampaignRow, CatalogStoreError>;

    /// Returns `None` when the campaign exists but no longer matches the guard.
    async fn transition_campaign(
        &self,
        campaign_id: &str,
        transition: StatusTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<CampaignRow>, CatalogStoreError>;

    async fn create_ad(&self, ad: AdRow) -> Result<AdRow, CatalogStoreError>;

    async fn get_ad(&self, ad_id: &str) -> Result<Option<AdRow>, CatalogStoreError>;

    /// Active ads whose campaign is active, ordered by ad id.
    async fn list_active_ads_with_campaigns(&self) -> Result<Vec<AdCandidate>, CatalogStoreError>;

    async fn put_ad_space(&self, ad_space: AdSpaceRow) -> Result<AdSpaceRow, CatalogStoreError>;

    async fn get_ad_space(
        &self,
        ad_space_id: &str,
    ) -> Result<Option<AdSpaceRow>, CatalogStoreError>;

    /// Bumps the ad's reporting counter and adds `charged_sats` to the campaign spend.
    async fn record_delivery(
        &self,
        ad_id: &str,
        kind: DeliveryKind,
        charged_sats: i64,
        now: DateTime<Utc>,
    ) -> Result<(), CatalogStoreError>;
}

pub fn memory() -> Arc<dyn CatalogStore> {
    Arc::new(MemoryCatalogStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn CatalogStore> {
    Arc::new(PostgresCatalogStore { db })
}

#[derive(Default)]
struct MemoryCatalogStore {
    inner: Mutex<MemoryCatalogStoreInner>,
}

#[derive(Default)]
struct MemoryCatalogStoreInner {
    campaigns: HashMap<String, CampaignRow>,
    ads: HashMap<String, AdRow>,
    ad_spaces: HashMap<String, AdSpaceRow>,
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn create_campaign(
        &self,
        campaign: CampaignRow,
    ) -> Result<CampaignRow, CatalogStoreError> {
        validate_campaign(&campaign).map_err(CatalogStoreError::Invalid)?;
        let mut inner = self.inner.lock().await;
        if inner.campaigns.contains_key(&campaign.campaign_id) {
            return Err(CatalogStoreError::Conflict(
                "campaign_id already exists".to_string(),
            ));
        }
        inner
            .campaigns
            .insert(campaign.campaign_id.clone(), campaign.clone());
        Ok(campaign)
    }

    async fn get_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<Option<CampaignRow>, CatalogStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.campaigns.get(campaign_id).cloned())
    }

    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<CampaignRow>, CatalogStoreError> {
        let inner = self.inner.lock().await;
        let mut out = inner
            .campaigns
            .values()
            .filter(|campaign| campaign.status == status)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.campaign_id.cmp(&b.campaign_id));
        Ok(out)
    }

    async fn list_campaigns_for_advertiser(
        &self,
        advertiser_id: &str,
    ) -> Result<Vec<CampaignRow>, CatalogStoreError> {
        let inner = self.inner.lock().await;
        let mut out = inner
            .campaigns
            .values()
            .filter(|campaign| campaign.advertiser_id == advertiser_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.campaign_id.cmp(&b.campaign_id));
        Ok(out)
    }

    async fn set_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
        pause_reason: Option<PauseReason>,
        now: DateTime<Utc>,
    ) -> Result<CampaignRow, CatalogStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(campaign) = inner.campaigns.get_mut(campaign_id) else {
            return Err(CatalogStoreError::NotFound("campaign".to_string()));
        };
        campaign.status = status;
        campaign.pause_reason = pause_reason;
        campaign.updated_at = now;
        Ok(campaign.clone())
    }

    async fn transition_campaign(
        &self,
        campaign_id: &str,
        transition: StatusTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<CampaignRow>, CatalogStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(campaign) = inner.campaigns.get_mut(campaign_id) else {
            return Err(CatalogStoreError::NotFound("campaign".to_string()));
        };
        if campaign.status != transition.from || campaign.pause_reason != transition.from_reason {
            return Ok(None);
        }
        campaign.status = transition.to;
        campaign.pause_reason = transition.to_reason;
        campaign.updated_at = now;
        Ok(Some(campaign.clone()))
    }

    async fn create_ad(&self, ad: AdRow) -> Result<AdRow, CatalogStoreError> {
        validate_ad(&ad).map_err(CatalogStoreError::Invalid)?;
        let mut inner = self.inner.lock().await;
        if !inner.campaigns.contains_key(&ad.campaign_id) {
            return Err(CatalogStoreError::NotFound("campaign".to_string()));
        }
        if inner.ads.contains_key(&ad.ad_id) {
            return Err(CatalogStoreError::Conflict("ad_id already exists".to_string()));
        }
        inner.ads.insert(ad.ad_id.clone(), ad.clone());
        Ok(ad)
    }

    async fn get_ad(&self, ad_id: &str) -> Result<Option<AdRow>, CatalogStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.ads.get(ad_id).cloned())
    }

    async fn list_active_ads_with_campaigns(&self) -> Result<Vec<AdCandidate>, CatalogStoreError> {
        let inner = self.inner.lock().await;
        let mut out = inner
            .ads
            .values()
            .filter(|ad| ad.status == AdStatus::Active)
            .filter_map(|ad| {
                let campaign = inner.campaigns.get(&ad.campaign_id)?;
                (campaign.status == CampaignStatus::Active).then(|| AdCandidate {
                    ad: ad.clone(),
                    campaign: campaign.clone(),
                })
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.ad.ad_id.cmp(&b.ad.ad_id));
        Ok(out)
    }

    async fn put_ad_space(&self, ad_space: AdSpaceRow) -> Result<AdSpaceRow, CatalogStoreError> {
        validate_ad_space(&ad_space).map_err(CatalogStoreError::Invalid)?;
        let mut inner = self.inner.lock().await;
        inner
            .ad_spaces
            .insert(ad_space.ad_space_id.clone(), ad_space.clone());
        Ok(ad_space)
    }

    async fn get_ad_space(
        &self,
        ad_space_id: &str,
    ) -> Result<Option<AdSpaceRow>, CatalogStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.ad_spaces.get(ad_space_id).cloned())
    }

    async fn record_delivery(
        &self,
        ad_id: &str,
        kind: DeliveryKind,
        charged_sats: i64,
        now: DateTime<Utc>,
    ) -> Result<(), CatalogStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(ad) = inner.ads.get_mut(ad_id) else {
            return Err(CatalogStoreError::NotFound("ad".to_string()));
        };
        match kind {
            DeliveryKind::Impression => ad.impressions = ad.impressions.saturating_add(1),
            DeliveryKind::Click => ad.clicks = ad.clicks.saturating_add(1),
        }
        ad.updated_at = now;
        let campaign_id = ad.campaign_id.clone();
        if charged_sats > 0 {
            let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
                return Err(CatalogStoreError::NotFound("campaign".to_string()));
            };
            campaign.spent_sats = campaign.spent_sats.saturating_add(charged_sats);
            campaign.updated_at = now;
        }
        Ok(())
    }
}

struct PostgresCatalogStore {
    db: Arc<RuntimeDb>,
}

const CAMPAIGN_COLUMNS: &str = "campaign_id, advertiser_id, name, status, pause_reason, \
     budget_sats, daily_budget_sats, spent_sats, start_at, end_at, targeting, created_at, \
     updated_at";

const AD_COLUMNS: &str = "ad_id, campaign_id, status, placement_type, pricing_model, bid_sats, \
     freq_cap_views, freq_cap_hours, targeting, ad_space_ids, impressions, clicks, created_at, \
     updated_at";

#[async_trait]
impl CatalogStore for PostgresCatalogStore {
    async fn create_campaign(
        &self,
        campaign: CampaignRow,
    ) -> Result<CampaignRow, CatalogStoreError> {
        validate_campaign(&campaign).map_err(CatalogStoreError::Invalid)?;
        let targeting = targeting_to_json(&campaign.targeting)?;
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO runtime.campaigns (
                    campaign_id, advertiser_id, name, status, pause_reason, budget_sats,
                    daily_budget_sats, spent_sats, start_at, end_at, targeting, created_at,
                    updated_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13
                )
                ON CONFLICT (campaign_id) DO NOTHING
                "#,
                &[
                    &campaign.campaign_id,
                    &campaign.advertiser_id,
                    &campaign.name,
                    &campaign.status.as_str(),
                    &campaign.pause_reason.map(PauseReason::as_str),
                    &campaign.budget_sats,
                    &campaign.daily_budget_sats,
                    &campaign.spent_sats,
                    &campaign.start_at,
                    &campaign.end_at,
                    &targeting,
                    &campaign.created_at,
                    &campaign.updated_at,
                ],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        if inserted == 0 {
            return Err(CatalogStoreError::Conflict(
                "campaign_id already exists".to_string(),
            ));
        }
        Ok(campaign)
    }

    async fn get_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<Option<CampaignRow>, CatalogStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM runtime.campaigns WHERE campaign_id = $1"),
                &[&campaign_id],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_campaign_row)
            .transpose()
            .map_err(CatalogStoreError::Db)
    }

    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<CampaignRow>, CatalogStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM runtime.campaigns WHERE status = $1 \
                     ORDER BY campaign_id"
                ),
                &[&status.as_str()],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_campaign_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CatalogStoreError::Db)
    }

    async fn list_campaigns_for_advertiser(
        &self,
        advertiser_id: &str,
    ) -> Result<Vec<CampaignRow>, CatalogStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM runtime.campaigns WHERE advertiser_id = $1 \
                     ORDER BY campaign_id"
                ),
                &[&advertiser_id],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_campaign_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CatalogStoreError::Db)
    }

    async fn set_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
        pause_reason: Option<PauseReason>,
        now: DateTime<Utc>,
    ) -> Result<CampaignRow, CatalogStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE runtime.campaigns SET status = $2, pause_reason = $3, updated_at = $4 \
                     WHERE campaign_id = $1 RETURNING {CAMPAIGN_COLUMNS}"
                ),
                &[
                    &campaign_id,
                    &status.as_str(),
                    &pause_reason.map(PauseReason::as_str),
                    &now,
                ],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Err(CatalogStoreError::NotFound("campaign".to_string()));
        };
        map_campaign_row(&row).map_err(CatalogStoreError::Db)
    }

    async fn transition_campaign(
        &self,
        campaign_id: &str,
        transition: StatusTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<CampaignRow>, CatalogStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE runtime.campaigns SET status = $4, pause_reason = $5, updated_at = $6 \
                     WHERE campaign_id = $1 AND status = $2 \
                       AND pause_reason IS NOT DISTINCT FROM $3 \
                     RETURNING {CAMPAIGN_COLUMNS}"
                ),
                &[
                    &campaign_id,
                    &transition.from.as_str(),
                    &transition.from_reason.map(PauseReason::as_str),
                    &transition.to.as_str(),
                    &transition.to_reason.map(PauseReason::as_str),
                    &now,
                ],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        if let Some(row) = row {
            return map_campaign_row(&row)
                .map(Some)
                .map_err(CatalogStoreError::Db);
        }
        let exists = client
            .query_opt(
                "SELECT 1 FROM runtime.campaigns WHERE campaign_id = $1",
                &[&campaign_id],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        if exists.is_none() {
            return Err(CatalogStoreError::NotFound("campaign".to_string()));
        }
        Ok(None)
    }

    async fn create_ad(&self, ad: AdRow) -> Result<AdRow, CatalogStoreError> {
        validate_ad(&ad).map_err(CatalogStoreError::Invalid)?;
        let targeting = targeting_to_json(&ad.targeting)?;
        let (freq_cap_views, freq_cap_hours) = frequency_cap_to_columns(ad.frequency_cap);
        let client = self.db.client();
        let client = client.lock().await;
        let campaign = client
            .query_opt(
                "SELECT 1 FROM runtime.campaigns WHERE campaign_id = $1",
                &[&ad.campaign_id],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        if campaign.is_none() {
            return Err(CatalogStoreError::NotFound("campaign".to_string()));
        }
        let inserted = client
            .execute(
                r#"
                INSERT INTO runtime.ads (
                    ad_id, campaign_id, status, placement_type, pricing_model, bid_sats,
                    freq_cap_views, freq_cap_hours, targeting, ad_space_ids, impressions, clicks,
                    created_at, updated_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14
                )
                ON CONFLICT (ad_id) DO NOTHING
                "#,
                &[
                    &ad.ad_id,
                    &ad.campaign_id,
                    &ad.status.as_str(),
                    &ad.placement_type,
                    &ad.pricing.model(),
                    &ad.pricing.bid_sats(),
                    &freq_cap_views,
                    &freq_cap_hours,
                    &targeting,
                    &ad.ad_space_ids,
                    &ad.impressions,
                    &ad.clicks,
                    &ad.created_at,
                    &ad.updated_at,
                ],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        if inserted == 0 {
            return Err(CatalogStoreError::Conflict("ad_id already exists".to_string()));
        }
        Ok(ad)
    }

    async fn get_ad(&self, ad_id: &str) -> Result<Option<AdRow>, CatalogStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT {AD_COLUMNS} FROM runtime.ads WHERE ad_id = $1"),
                &[&ad_id],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_ad_row)
            .transpose()
            .map_err(CatalogStoreError::Db)
    }

    async fn list_active_ads_with_campaigns(&self) -> Result<Vec<AdCandidate>, CatalogStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let ads = client
            .query(
                &format!(
                    "SELECT {AD_COLUMNS} FROM runtime.ads WHERE status = 'active' AND campaign_id IN \
                     (SELECT campaign_id FROM runtime.campaigns WHERE status = 'active') \
                     ORDER BY ad_id"
                ),
                &[],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        let campaigns = client
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM runtime.campaigns WHERE status = 'active'"
                ),
                &[],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        let campaigns = campaigns
            .iter()
            .map(map_campaign_row)
            .map(|row| row.map(|campaign| (campaign.campaign_id.clone(), campaign)))
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(CatalogStoreError::Db)?;

        let mut out = Vec::with_capacity(ads.len());
        for row in &ads {
            let ad = map_ad_row(row).map_err(CatalogStoreError::Db)?;
            // A campaign paused between the two reads simply drops out.
            if let Some(campaign) = campaigns.get(&ad.campaign_id) {
                out.push(AdCandidate {
                    campaign: campaign.clone(),
                    ad,
                });
            }
        }
        Ok(out)
    }

    async fn put_ad_space(&self, ad_space: AdSpaceRow) -> Result<AdSpaceRow, CatalogStoreError> {
        validate_ad_space(&ad_space).map_err(CatalogStoreError::Invalid)?;
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO runtime.ad_spaces (
                    ad_space_id, publisher_id, min_bid_per_impression_sats,
                    min_bid_per_click_sats, width, height, category, created_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8
                )
                ON CONFLICT (ad_space_id) DO UPDATE
                   SET publisher_id = EXCLUDED.publisher_id,
                       min_bid_per_impression_sats = EXCLUDED.min_bid_per_impression_sats,
                       min_bid_per_click_sats = EXCLUDED.min_bid_per_click_sats,
                       width = EXCLUDED.width,
                       height = EXCLUDED.height,
                       category = EXCLUDED.category
                "#,
                &[
                    &ad_space.ad_space_id,
                    &ad_space.publisher_id,
                    &ad_space.min_bid_per_impression_sats,
                    &ad_space.min_bid_per_click_sats,
                    &ad_space.width,
                    &ad_space.height,
                    &ad_space.category,
                    &ad_space.created_at,
                ],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        Ok(ad_space)
    }

    async fn get_ad_space(
        &self,
        ad_space_id: &str,
    ) -> Result<Option<AdSpaceRow>, CatalogStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT ad_space_id, publisher_id, min_bid_per_impression_sats,
                       min_bid_per_click_sats, width, height, category, created_at
                  FROM runtime.ad_spaces
                 WHERE ad_space_id = $1
                "#,
                &[&ad_space_id],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_ad_space_row)
            .transpose()
            .map_err(CatalogStoreError::Db)
    }

    async fn record_delivery(
        &self,
        ad_id: &str,
        kind: DeliveryKind,
        charged_sats: i64,
        now: DateTime<Utc>,
    ) -> Result<(), CatalogStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        let (impressions, clicks): (i64, i64) = match kind {
            DeliveryKind::Impression => (1, 0),
            DeliveryKind::Click => (0, 1),
        };
        let row = tx
            .query_opt(
                r#"
                UPDATE runtime.ads
                   SET impressions = impressions + $2,
                       clicks = clicks + $3,
                       updated_at = $4
                 WHERE ad_id = $1
                 RETURNING campaign_id
                "#,
                &[&ad_id, &impressions, &clicks, &now],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Err(CatalogStoreError::NotFound("ad".to_string()));
        };
        let campaign_id: String = row.get("campaign_id");
        if charged_sats > 0 {
            tx.execute(
                r#"
                UPDATE runtime.campaigns
                   SET spent_sats = spent_sats + $2,
                       updated_at = $3
                 WHERE campaign_id = $1
                "#,
                &[&campaign_id, &charged_sats, &now],
            )
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|error| CatalogStoreError::Db(error.to_string()))?;
        Ok(())
    }
}

fn targeting_to_json(targeting: &Targeting) -> Result<Value, CatalogStoreError> {
    serde_json::to_value(targeting).map_err(|error| CatalogStoreError::Db(error.to_string()))
}

fn frequency_cap_to_columns(cap: Option<FrequencyCap>) -> (i32, i32) {
    cap.map_or((0, 0), |cap| {
        (
            i32::try_from(cap.max_views).unwrap_or(i32::MAX),
            i32::try_from(cap.window_hours).unwrap_or(i32::MAX),
        )
    })
}

fn map_campaign_row(row: &tokio_postgres::Row) -> Result<CampaignRow, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let pause_reason: Option<String> = row.try_get("pause_reason").map_err(|e| e.to_string())?;
    let targeting: Value = row.try_get("targeting").map_err(|e| e.to_string())?;
    Ok(CampaignRow {
        campaign_id: row.try_get("campaign_id").map_err(|e| e.to_string())?,
        advertiser_id: row
            .try_get("advertiser_id")
            .map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        status: CampaignStatus::parse(&status)
            .ok_or_else(|| format!("unknown campaign status: {status}"))?,
        pause_reason: pause_reason
            .map(|reason| {
                PauseReason::parse(&reason).ok_or_else(|| format!("unknown pause reason: {reason}"))
            })
            .transpose()?,
        budget_sats: row.try_get("budget_sats").map_err(|e| e.to_string())?,
        daily_budget_sats: row
            .try_get("daily_budget_sats")
            .map_err(|e| e.to_string())?,
        spent_sats: row.try_get("spent_sats").map_err(|e| e.to_string())?,
        start_at: row.try_get("start_at").map_err(|e| e.to_string())?,
        end_at: row.try_get("end_at").map_err(|e| e.to_string())?,
        targeting: serde_json::from_value(targeting).map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_ad_row(row: &tokio_postgres::Row) -> Result<AdRow, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let pricing_model: String = row.try_get("pricing_model").map_err(|e| e.to_string())?;
    let bid_sats: i64 = row.try_get("bid_sats").map_err(|e| e.to_string())?;
    let freq_cap_views: i32 = row.try_get("freq_cap_views").map_err(|e| e.to_string())?;
    let freq_cap_hours: i32 = row.try_get("freq_cap_hours").map_err(|e| e.to_string())?;
    let targeting: Value = row.try_get("targeting").map_err(|e| e.to_string())?;
    let pricing = match pricing_model.as_str() {
        "cpm" => AdPricing::Cpm {
            bid_per_mille_sats: bid_sats,
        },
        "cpc" => AdPricing::Cpc {
            bid_per_click_sats: bid_sats,
        },
        other => return Err(format!("unknown pricing model: {other}")),
    };
    Ok(AdRow {
        ad_id: row.try_get("ad_id").map_err(|e| e.to_string())?,
        campaign_id: row.try_get("campaign_id").map_err(|e| e.to_string())?,
        status: AdStatus::parse(&status).ok_or_else(|| format!("unknown ad status: {status}"))?,
        placement_type: row
            .try_get("placement_type")
            .map_err(|e| e.to_string())?,
        pricing,
        frequency_cap: FrequencyCap::new(
            u32::try_from(freq_cap_views).unwrap_or(0),
            u32::try_from(freq_cap_hours).unwrap_or(0),
        ),
        targeting: serde_json::from_value(targeting).map_err(|e| e.to_string())?,
        ad_space_ids: row.try_get("ad_space_ids").map_err(|e| e.to_string())?,
        impressions: row.try_get("impressions").map_err(|e| e.to_string())?,
        clicks: row.try_get("clicks").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_ad_space_row(row: &tokio_postgres::Row) -> Result<AdSpaceRow, String> {
    Ok(AdSpaceRow {
        ad_space_id: row.try_get("ad_space_id").map_err(|e| e.to_string())?,
        publisher_id: row.try_get("publisher_id").map_err(|e| e.to_string())?,
        min_bid_per_impression_sats: row
            .try_get("min_bid_per_impression_sats")
            .map_err(|e| e.to_string())?,
        min_bid_per_click_sats: row
            .try_get("min_bid_per_click_sats")
            .map_err(|e| e.to_string())?,
        width: row.try_get("width").map_err(|e| e.to_string())?,
        height: row.try_get("height").map_err(|e| e.to_string())?,
        category: row.try_get("category").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}
