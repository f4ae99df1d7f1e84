use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{
    AdCandidate, AdPricing, AdSpaceRow, AdStatus, CampaignStatus, CatalogStore,
    CatalogStoreError, Targeting,
};
use crate::frequency::FrequencyCapStore;
use crate::ledger::LedgerStore;

/// Default click-through estimate used to compare CPC bids against CPM bids (1%).
pub const DEFAULT_CPC_ESTIMATED_CTR_BPS: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementContext {
    pub placement_type: String,
    pub ad_space_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_range: Option<String>,
}

impl PlacementContext {
    /// Blank viewer ids count as anonymous.
    pub fn viewer(&self) -> Option<&str> {
        self.viewer_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("ad space not found: {0}")]
    AdSpaceNotFound(String),
    #[error("catalog unavailable: {0}")]
    Catalog(#[from] CatalogStoreError),
}

/// Picks the single best eligible ad for a placement.
///
/// Selection never records exposures: frequency caps are only counted here, and the
/// atomic check-and-record happens when the impression is reported. Anonymous viewers
/// skip capping entirely since there is no identity to cap against.
#[derive(Clone)]
pub struct AdSelector {
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn LedgerStore>,
    frequency: Arc<dyn FrequencyCapStore>,
    cpc_estimated_ctr_bps: u32,
}

impl AdSelector {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<dyn LedgerStore>,
        frequency: Arc<dyn FrequencyCapStore>,
        cpc_estimated_ctr_bps: u32,
    ) -> Self {
        Self {
            catalog,
            ledger,
            frequency,
            cpc_estimated_ctr_bps,
        }
    }

    pub async fn select_ad(
        &self,
        context: &PlacementContext,
        now: DateTime<Utc>,
    ) -> Result<Option<AdCandidate>, SelectorError> {
        let ad_space = self
            .catalog
            .get_ad_space(context.ad_space_id.trim())
            .await?
            .ok_or_else(|| SelectorError::AdSpaceNotFound(context.ad_space_id.clone()))?;

        let mut candidates = self
            .catalog
            .list_active_ads_with_campaigns()
            .await?
            .into_iter()
            .filter(|candidate| is_eligible(candidate, context, &ad_space, now))
            .collect::<Vec<_>>();

        // Balances never go negative, so this only drops ads whose advertiser account
        // is missing or unreadable.
        let mut funded = HashMap::<String, bool>::new();
        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates.drain(..) {
            let advertiser_id = candidate.campaign.advertiser_id.clone();
            let ok = match funded.get(&advertiser_id) {
                Some(ok) => *ok,
                None => {
                    let ok = match self.ledger.get_balance(&advertiser_id).await {
                        Ok(balance_sats) => balance_sats >= 0,
                        Err(error) => {
                            tracing::warn!(
                                advertiser_id = %advertiser_id,
                                reason = %error,
                                "advertiser balance unavailable; skipping campaign ads"
                            );
                            false
                        }
                    };
                    funded.insert(advertiser_id, ok);
                    ok
                }
            };
            if ok {
                kept.push(candidate);
            }
        }

        let ctr_bps = self.cpc_estimated_ctr_bps;
        kept.sort_by(|a, b| rank_key(a, ctr_bps).cmp(&rank_key(b, ctr_bps)));

        let viewer = context.viewer();
        for candidate in kept {
            let (Some(viewer), Some(cap)) = (viewer, candidate.ad.frequency_cap) else {
                return Ok(Some(candidate));
            };
            match self
                .frequency
                .would_allow(&candidate.ad.ad_id, viewer, cap, now)
                .await
            {
                Ok(true) => return Ok(Some(candidate)),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        ad_id = %candidate.ad.ad_id,
                        reason = %error,
                        "frequency cap lookup failed; skipping ad"
                    );
                }
            }
        }
        Ok(None)
    }
}

fn is_eligible(
    candidate: &AdCandidate,
    context: &PlacementContext,
    ad_space: &AdSpaceRow,
    now: DateTime<Utc>,
) -> bool {
    let AdCandidate { ad, campaign } = candidate;
    ad.status == AdStatus::Active
        && campaign.status == CampaignStatus::Active
        && campaign.is_running_at(now)
        && campaign.has_budget_remaining()
        && normalize(&ad.placement_type) == normalize(&context.placement_type)
        && (ad.ad_space_ids.is_empty()
            || ad
                .ad_space_ids
                .iter()
                .any(|id| id.trim() == ad_space.ad_space_id))
        && ad_space.accepts_bid(ad.pricing)
        && targeting_matches(&ad.targeting, &campaign.targeting, context)
}

/// Ad-level fields override campaign-level fields one field at a time.
pub fn targeting_matches(ad: &Targeting, campaign: &Targeting, context: &PlacementContext) -> bool {
    let location = non_blank(ad.location.as_deref()).or(non_blank(campaign.location.as_deref()));
    let age_range =
        non_blank(ad.age_range.as_deref()).or(non_blank(campaign.age_range.as_deref()));
    let interests = if ad.interests.iter().any(|value| !value.trim().is_empty()) {
        &ad.interests
    } else {
        &campaign.interests
    };

    scalar_matches(location, context.location.as_deref())
        && scalar_matches(age_range, context.age_range.as_deref())
        && interests_match(interests, &context.interests)
}

/// A target may list alternatives separated by commas ("US, CA").
fn scalar_matches(target: Option<&str>, requested: Option<&str>) -> bool {
    let Some(target) = target else {
        return true;
    };
    let Some(requested) = non_blank(requested) else {
        return false;
    };
    let requested = normalize(requested);
    target.split(',').any(|option| normalize(option) == requested)
}

fn interests_match(target: &[String], requested: &[String]) -> bool {
    let target = target
        .iter()
        .map(|value| normalize(value))
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();
    if target.is_empty() {
        return true;
    }
    requested
        .iter()
        .map(|value| normalize(value))
        .any(|value| target.contains(&value))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Expected value per 1000 impressions. CPC bids are scaled by the estimated CTR.
pub fn effective_value_per_mille(pricing: AdPricing, cpc_estimated_ctr_bps: u32) -> i64 {
    match pricing {
        AdPricing::Cpm { bid_per_mille_sats } => bid_per_mille_sats,
        AdPricing::Cpc { bid_per_click_sats } => {
            bid_per_click_sats.saturating_mul(i64::from(cpc_estimated_ctr_bps)) / 10
        }
    }
}

fn rank_key(
    candidate: &AdCandidate,
    cpc_estimated_ctr_bps: u32,
) -> (Reverse<i64>, Reverse<i64>, DateTime<Utc>, String) {
    let start = candidate
        .campaign
        .start_at
        .unwrap_or(candidate.campaign.created_at);
    (
        Reverse(effective_value_per_mille(
            candidate.ad.pricing,
            cpc_estimated_ctr_bps,
        )),
        Reverse(candidate.ad.pricing.bid_sats()),
        start,
        candidate.ad.ad_id.clone(),
    )
}
