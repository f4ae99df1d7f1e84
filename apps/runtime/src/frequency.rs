use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::db::RuntimeDb;

/// Longest rolling window an ad may declare. Exposures older than this are dead.
pub const MAX_WINDOW_HOURS: u32 = 24 * 30;

/// Maximum exposures of one ad to one viewer inside a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyCap {
    pub max_views: u32,
    pub window_hours: u32,
}

impl FrequencyCap {
    /// A zero view count or zero window means the ad is uncapped.
    pub fn new(max_views: u32, window_hours: u32) -> Option<Self> {
        if max_views == 0 || window_hours == 0 {
            return None;
        }
        Some(Self {
            max_views,
            window_hours,
        })
    }

    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(i64::from(self.window_hours))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrequencyCapError {
    #[error("invalid frequency key: {0}")]
    InvalidKey(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Exposure log per (ad, viewer). Exposures at or before the window start are expired.
#[async_trait]
pub trait FrequencyCapStore: Send + Sync {
    async fn exposure_count(
        &self,
        ad_id: &str,
        viewer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, FrequencyCapError>;

    /// Records an exposure and returns true only if the viewer is still under the cap.
    /// Atomic per (ad, viewer): two racing callers can never both take the last slot.
    /// An exposure already recorded under `event_id` is allowed again without counting.
    async fn record_exposure(
        &self,
        ad_id: &str,
        viewer_id: &str,
        cap: FrequencyCap,
        now: DateTime<Utc>,
        event_id: Option<&str>,
    ) -> Result<bool, FrequencyCapError>;

    async fn check_and_record(
        &self,
        ad_id: &str,
        viewer_id: &str,
        cap: FrequencyCap,
        now: DateTime<Utc>,
    ) -> Result<bool, FrequencyCapError> {
        self.record_exposure(ad_id, viewer_id, cap, now, None).await
    }

    /// Drops exposures at or before `older_than`. Returns the number removed.
    async fn prune_expired(&self, older_than: DateTime<Utc>) -> Result<u64, FrequencyCapError>;

    /// Read-only variant of `check_and_record`.
    async fn would_allow(
        &self,
        ad_id: &str,
        viewer_id: &str,
        cap: FrequencyCap,
        now: DateTime<Utc>,
    ) -> Result<bool, FrequencyCapError> {
        let count = self
            .exposure_count(ad_id, viewer_id, cap.window_start(now))
            .await?;
        Ok(count < cap.max_views)
    }
}

pub fn memory() -> Arc<dyn FrequencyCapStore> {
    Arc::new(MemoryFrequencyCapStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn FrequencyCapStore> {
    Arc::new(PostgresFrequencyCapStore { db })
}

fn ensure_key(ad_id: &str, viewer_id: &str) -> Result<(), FrequencyCapError> {
    if ad_id.trim().is_empty() || viewer_id.trim().is_empty() {
        return Err(FrequencyCapError::InvalidKey(
            "ad_id and viewer_id are required".to_string(),
        ));
    }
    Ok(())
}

fn retention_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::hours(i64::from(MAX_WINDOW_HOURS))
}

struct Exposure {
    at: DateTime<Utc>,
    event_id: Option<String>,
}

#[derive(Default)]
struct MemoryFrequencyCapStore {
    exposures: Mutex<HashMap<(String, String), Vec<Exposure>>>,
}

#[async_trait]
impl FrequencyCapStore for MemoryFrequencyCapStore {
    async fn exposure_count(
        &self,
        ad_id: &str,
        viewer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, FrequencyCapError> {
        ensure_key(ad_id, viewer_id)?;
        let exposures = self.exposures.lock().await;
        let key = (ad_id.to_string(), viewer_id.to_string());
        let count = exposures
            .get(&key)
            .map(|seen| seen.iter().filter(|exposure| exposure.at > since).count())
            .unwrap_or(0);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn record_exposure(
        &self,
        ad_id: &str,
        viewer_id: &str,
        cap: FrequencyCap,
        now: DateTime<Utc>,
        event_id: Option<&str>,
    ) -> Result<bool, FrequencyCapError> {
        ensure_key(ad_id, viewer_id)?;
        let since = cap.window_start(now);
        let mut exposures = self.exposures.lock().await;
        let seen = exposures
            .entry((ad_id.to_string(), viewer_id.to_string()))
            .or_default();
        let retain_after = retention_start(now);
        seen.retain(|exposure| exposure.at > retain_after);
        let replayed = event_id.is_some_and(|event_id| {
            seen.iter()
                .any(|exposure| exposure.event_id.as_deref() == Some(event_id))
        });
        if replayed {
            return Ok(true);
        }
        let live = seen.iter().filter(|exposure| exposure.at > since).count();
        if live >= cap.max_views as usize {
            return Ok(false);
        }
        seen.push(Exposure {
            at: now,
            event_id: event_id.map(str::to_string),
        });
        Ok(true)
    }

    async fn prune_expired(&self, older_than: DateTime<Utc>) -> Result<u64, FrequencyCapError> {
        let mut exposures = self.exposures.lock().await;
        let mut removed = 0_u64;
        exposures.retain(|_, seen| {
            let before = seen.len();
            seen.retain(|exposure| exposure.at > older_than);
            removed += (before - seen.len()) as u64;
            !seen.is_empty()
        });
        Ok(removed)
    }
}

struct PostgresFrequencyCapStore {
    db: Arc<RuntimeDb>,
}

#[async_trait]
impl FrequencyCapStore for PostgresFrequencyCapStore {
    async fn exposure_count(
        &self,
        ad_id: &str,
        viewer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, FrequencyCapError> {
        ensure_key(ad_id, viewer_id)?;
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS exposures
                  FROM runtime.frequency_exposures
                 WHERE ad_id = $1
                   AND viewer_id = $2
                   AND exposed_at > $3
                "#,
                &[&ad_id, &viewer_id, &since],
            )
            .await
            .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
        let count: i64 = row
            .try_get("exposures")
            .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn record_exposure(
        &self,
        ad_id: &str,
        viewer_id: &str,
        cap: FrequencyCap,
        now: DateTime<Utc>,
        event_id: Option<&str>,
    ) -> Result<bool, FrequencyCapError> {
        ensure_key(ad_id, viewer_id)?;
        let since = cap.window_start(now);
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| FrequencyCapError::Db(error.to_string()))?;

        // Counter row exists only to be locked; it serializes checks for the pair.
        tx.execute(
            r#"
            INSERT INTO runtime.frequency_counters (ad_id, viewer_id, updated_at)
            VALUES ($1,$2,$3)
            ON CONFLICT (ad_id, viewer_id) DO NOTHING
            "#,
            &[&ad_id, &viewer_id, &now],
        )
        .await
        .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
        tx.query_one(
            r#"
            SELECT ad_id
              FROM runtime.frequency_counters
             WHERE ad_id = $1
               AND viewer_id = $2
             FOR UPDATE
            "#,
            &[&ad_id, &viewer_id],
        )
        .await
        .map_err(|error| FrequencyCapError::Db(error.to_string()))?;

        if let Some(event_id) = event_id {
            let replayed = tx
                .query_opt(
                    r#"
                    SELECT 1 AS seen
                      FROM runtime.frequency_exposures
                     WHERE ad_id = $1
                       AND viewer_id = $2
                       AND event_id = $3
                     LIMIT 1
                    "#,
                    &[&ad_id, &viewer_id, &event_id],
                )
                .await
                .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
            if replayed.is_some() {
                tx.commit()
                    .await
                    .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
                return Ok(true);
            }
        }

        let row = tx
            .query_one(
                r#"
                SELECT COUNT(*) AS exposures
                  FROM runtime.frequency_exposures
                 WHERE ad_id = $1
                   AND viewer_id = $2
                   AND exposed_at > $3
                "#,
                &[&ad_id, &viewer_id, &since],
            )
            .await
            .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
        let count: i64 = row
            .try_get("exposures")
            .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
        if count >= i64::from(cap.max_views) {
            tx.commit()
                .await
                .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO runtime.frequency_exposures (ad_id, viewer_id, exposed_at, event_id)
            VALUES ($1,$2,$3,$4)
            "#,
            &[&ad_id, &viewer_id, &now, &event_id],
        )
        .await
        .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
        tx.execute(
            r#"
            UPDATE runtime.frequency_counters
               SET updated_at = $3
             WHERE ad_id = $1
               AND viewer_id = $2
            "#,
            &[&ad_id, &viewer_id, &now],
        )
        .await
        .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
        tx.commit()
            .await
            .map_err(|error| FrequencyCapError::Db(error.to_string()))?;
        Ok(true)
    }

    async fn prune_expired(&self, older_than: DateTime<Utc>) -> Result<u64, FrequencyCapError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                DELETE FROM runtime.frequency_exposures
                 WHERE exposed_at <= $1
                "#,
                &[&older_than],
            )
            .await
            .map_err(|error| FrequencyCapError::Db(error.to_string()))
    }
}
