use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::frequency::{FrequencyCap, MAX_WINDOW_HOURS};

/// Smallest CPM bid accepted on an ad. Below this a single impression truncates to a
/// zero-sat charge and the ad would be served for free indefinitely.
pub const MIN_CPM_BID_SATS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Active,
    Paused,
    Review,
    Ended,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Review => "review",
            Self::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "scheduled" => Some(Self::Scheduled),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "review" => Some(Self::Review),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// Why a campaign entered `Paused`. Only `InsufficientFunds` pauses are ever resumed
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    InsufficientFunds,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::InsufficientFunds => "insufficient_funds",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "insufficient_funds" => Some(Self::InsufficientFunds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Rejected,
}

impl AdStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Exactly one pricing model per ad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum AdPricing {
    /// Priced per 1000 impressions.
    Cpm { bid_per_mille_sats: i64 },
    Cpc { bid_per_click_sats: i64 },
}

impl AdPricing {
    pub fn model(self) -> &'static str {
        match self {
            Self::Cpm { .. } => "cpm",
            Self::Cpc { .. } => "cpc",
        }
    }

    pub fn bid_sats(self) -> i64 {
        match self {
            Self::Cpm { bid_per_mille_sats } => bid_per_mille_sats,
            Self::Cpc { bid_per_click_sats } => bid_per_click_sats,
        }
    }

    pub fn bid_per_impression_sats(self) -> i64 {
        match self {
            Self::Cpm { bid_per_mille_sats } => bid_per_mille_sats,
            Self::Cpc { .. } => 0,
        }
    }

    pub fn bid_per_click_sats(self) -> i64 {
        match self {
            Self::Cpm { .. } => 0,
            Self::Cpc { bid_per_click_sats } => bid_per_click_sats,
        }
    }

    pub fn from_bids(bid_per_impression_sats: i64, bid_per_click_sats: i64) -> Option<Self> {
        match (bid_per_impression_sats, bid_per_click_sats) {
            (cpm, 0) if cpm > 0 => Some(Self::Cpm {
                bid_per_mille_sats: cpm,
            }),
            (0, cpc) if cpc > 0 => Some(Self::Cpc {
                bid_per_click_sats: cpc,
            }),
            _ => None,
        }
    }
}

/// Free-form targeting. Empty fields match every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targeting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRow {
    pub campaign_id: String,
    pub advertiser_id: String,
    pub name: String,
    pub status: CampaignStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    pub budget_sats: i64,
    pub daily_budget_sats: i64,
    pub spent_sats: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targeting: Targeting,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignRow {
    pub fn is_auto_paused(&self) -> bool {
        self.status == CampaignStatus::Paused
            && self.pause_reason == Some(PauseReason::InsufficientFunds)
    }

    pub fn is_running_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at.is_none_or(|start| start <= now) && self.end_at.is_none_or(|end| now <= end)
    }

    pub fn has_budget_remaining(&self) -> bool {
        self.spent_sats < self.budget_sats
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdRow {
    pub ad_id: String,
    pub campaign_id: String,
    pub status: AdStatus,
    pub placement_type: String,
    pub pricing: AdPricing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_cap: Option<FrequencyCap>,
    /// Ad-level overrides; empty fields fall back to the campaign.
    #[serde(default)]
    pub targeting: Targeting,
    /// Empty means every ad space.
    #[serde(default)]
    pub ad_space_ids: Vec<String>,
    pub impressions: i64,
    pub clicks: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdSpaceRow {
    pub ad_space_id: String,
    pub publisher_id: String,
    pub min_bid_per_impression_sats: i64,
    pub min_bid_per_click_sats: i64,
    pub width: i32,
    pub height: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AdSpaceRow {
    /// Floor check against the bid of the ad's own pricing model.
    pub fn accepts_bid(&self, pricing: AdPricing) -> bool {
        match pricing {
            AdPricing::Cpm { bid_per_mille_sats } => {
                bid_per_mille_sats >= self.min_bid_per_impression_sats
            }
            AdPricing::Cpc { bid_per_click_sats } => {
                bid_per_click_sats >= self.min_bid_per_click_sats
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Impression,
    Click,
}

impl DeliveryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Impression => "impression",
            Self::Click => "click",
        }
    }
}

pub fn validate_campaign(campaign: &CampaignRow) -> Result<(), String> {
    if campaign.campaign_id.trim().is_empty() || campaign.advertiser_id.trim().is_empty() {
        return Err("campaign_id and advertiser_id are required".to_string());
    }
    if campaign.budget_sats <= 0 || campaign.daily_budget_sats <= 0 {
        return Err("budget_sats and daily_budget_sats must be positive".to_string());
    }
    if campaign.daily_budget_sats > campaign.budget_sats {
        return Err("daily_budget_sats cannot exceed budget_sats".to_string());
    }
    if let (Some(start), Some(end)) = (campaign.start_at, campaign.end_at) {
        if start >= end {
            return Err("start_at must be before end_at".to_string());
        }
    }
    Ok(())
}

pub fn validate_ad(ad: &AdRow) -> Result<(), String> {
    if ad.ad_id.trim().is_empty() || ad.campaign_id.trim().is_empty() {
        return Err("ad_id and campaign_id are required".to_string());
    }
    if ad.placement_type.trim().is_empty() {
        return Err("placement_type is required".to_string());
    }
    if ad
        .frequency_cap
        .is_some_and(|cap| cap.window_hours > MAX_WINDOW_HOURS)
    {
        return Err(format!("freq_cap_hours cannot exceed {MAX_WINDOW_HOURS}"));
    }
    match ad.pricing {
        AdPricing::Cpm { bid_per_mille_sats } if bid_per_mille_sats < MIN_CPM_BID_SATS => Err(
            format!("bid_per_impression_sats must be at least {MIN_CPM_BID_SATS} sats per mille"),
        ),
        AdPricing::Cpc { bid_per_click_sats } if bid_per_click_sats <= 0 => {
            Err("bid_per_click_sats must be positive".to_string())
        }
        _ => Ok(()),
    }
}

pub fn validate_ad_space(ad_space: &AdSpaceRow) -> Result<(), String> {
    if ad_space.ad_space_id.trim().is_empty() || ad_space.publisher_id.trim().is_empty() {
        return Err("ad_space_id and publisher_id are required".to_string());
    }
    if ad_space.min_bid_per_impression_sats < 0 || ad_space.min_bid_per_click_sats < 0 {
        return Err("minimum bids cannot be negative".to_string());
    }
    if ad_space.width <= 0 || ad_space.height <= 0 {
        return Err("width and height must be positive".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn campaign(budget_sats: i64, daily_budget_sats: i64) -> CampaignRow {
        let now = Utc::now();
        CampaignRow {
            campaign_id: "cmp_1".to_string(),
            advertiser_id: "adv_1".to_string(),
            name: "launch".to_string(),
            status: CampaignStatus::Draft,
            pause_reason: None,
            budget_sats,
            daily_budget_sats,
            spent_sats: 0,
            start_at: None,
            end_at: None,
            targeting: Targeting::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn pricing_from_bids_requires_exactly_one_model() {
        assert_eq!(
            AdPricing::from_bids(10, 0),
            Some(AdPricing::Cpm {
                bid_per_mille_sats: 10
            })
        );
        assert_eq!(
            AdPricing::from_bids(0, 100),
            Some(AdPricing::Cpc {
                bid_per_click_sats: 100
            })
        );
        assert_eq!(AdPricing::from_bids(10, 100), None);
        assert_eq!(AdPricing::from_bids(0, 0), None);

        let cpm = AdPricing::Cpm {
            bid_per_mille_sats: 10,
        };
        assert_eq!(cpm.bid_per_impression_sats(), 10);
        assert_eq!(cpm.bid_per_click_sats(), 0);
    }

    #[test]
    fn daily_budget_cannot_exceed_total_budget() {
        assert!(validate_campaign(&campaign(1_000, 1_000)).is_ok());
        assert!(validate_campaign(&campaign(1_000, 1_001)).is_err());
        assert!(validate_campaign(&campaign(0, 0)).is_err());
    }

    #[test]
    fn schedule_window_is_inclusive() {
        let now = Utc::now();
        let mut row = campaign(1_000, 100);
        row.start_at = Some(now);
        row.end_at = Some(now + Duration::days(1));
        assert!(validate_campaign(&row).is_ok());
        assert!(row.is_running_at(now));
        assert!(!row.is_running_at(now - Duration::seconds(1)));
        assert!(!row.is_running_at(now + Duration::days(2)));

        row.end_at = Some(now);
        assert!(validate_campaign(&row).is_err());
    }

    #[test]
    fn only_insufficient_funds_pauses_count_as_automatic() {
        let mut row = campaign(1_000, 100);
        row.status = CampaignStatus::Paused;
        row.pause_reason = Some(PauseReason::Manual);
        assert!(!row.is_auto_paused());
        row.pause_reason = Some(PauseReason::InsufficientFunds);
        assert!(row.is_auto_paused());
    }

    #[test]
    fn ad_space_floor_applies_to_the_ads_own_model() {
        let space = AdSpaceRow {
            ad_space_id: "space_1".to_string(),
            publisher_id: "pub_1".to_string(),
            min_bid_per_impression_sats: 2_000,
            min_bid_per_click_sats: 50,
            width: 300,
            height: 250,
            category: None,
            created_at: Utc::now(),
        };
        assert!(!space.accepts_bid(AdPricing::Cpm {
            bid_per_mille_sats: 1_500
        }));
        assert!(space.accepts_bid(AdPricing::Cpm {
            bid_per_mille_sats: 2_000
        }));
        assert!(space.accepts_bid(AdPricing::Cpc {
            bid_per_click_sats: 50
        }));
        assert!(!space.accepts_bid(AdPricing::Cpc {
            bid_per_click_sats: 49
        }));
    }
}
