//! Campaigns, ads and publisher ad spaces.

pub mod store;
pub mod types;

pub use store::{AdCandidate, CatalogStore, CatalogStoreError, StatusTransition};
pub use types::{
    AdPricing, AdRow, AdSpaceRow, AdStatus, CampaignRow, CampaignStatus, DeliveryKind,
    PauseReason, Targeting,
};
