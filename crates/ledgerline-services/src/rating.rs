//! Rating service implementation
//!
//! Longest-prefix rate lookup with a JSON cache in front of the rate
//! store. Cache failures degrade to a store lookup; they never fail a
//! rating.

use ledgerline_cache::keys::{rate_key, RATE_TTL_SECS};
use ledgerline_core::{
    models::RateCard,
    traits::{CacheService, RateRepository, RatingService},
    AppError, AppResult,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Rating service with caching
pub struct RatingServiceImpl<R: RateRepository, C: CacheService> {
    rate_repo: Arc<R>,
    cache: Arc<C>,
    ttl_secs: u64,
}

impl<R: RateRepository, C: CacheService> RatingServiceImpl<R, C> {
    pub fn new(rate_repo: Arc<R>, cache: Arc<C>) -> Self {
        Self {
            rate_repo,
            cache,
            ttl_secs: RATE_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    async fn get_from_cache(&self, destination: &str) -> Option<RateCard> {
        match self.cache.get::<RateCard>(&rate_key(destination)).await {
            Ok(rate) => {
                if rate.is_some() {
                    debug!("Rate cache HIT for destination: {}", destination);
                }
                rate
            }
            Err(e) => {
                warn!("Cache error for destination {}: {}", destination, e);
                None
            }
        }
    }

    async fn store_in_cache(&self, destination: &str, rate: &RateCard) {
        if let Err(e) = self.cache.set(&rate_key(destination), rate, self.ttl_secs).await {
            warn!("Failed to cache rate for {}: {}", destination, e);
        }
    }
}

#[async_trait]
impl<R, C> RatingService for RatingServiceImpl<R, C>
where
    R: RateRepository + 'static,
    C: CacheService + 'static,
{
    #[instrument(skip(self))]
    async fn find_rate(&self, destination: &str) -> AppResult<Option<RateCard>> {
        let normalized = RateCard::normalize_destination(destination);
        if normalized.is_empty() {
            warn!("Empty destination after normalization: {}", destination);
            return Ok(None);
        }

        if let Some(rate) = self.get_from_cache(&normalized).await {
            return Ok(Some(rate));
        }

        debug!("Rate cache MISS for destination: {}", normalized);
        let rate = self.rate_repo.find_by_destination(&normalized).await?;

        if let Some(ref r) = rate {
            self.store_in_cache(&normalized, r).await;
        }

        Ok(rate)
    }

    #[instrument(skip(self))]
    async fn calculate_cost(&self, destination: &str, duration_seconds: i64) -> AppResult<Decimal> {
        if duration_seconds <= 0 {
            return Ok(Decimal::ZERO);
        }

        let rate = self.find_rate(destination).await?.ok_or_else(|| {
            error!("No rate found for destination: {}", destination);
            AppError::RateNotFound(destination.to_string())
        })?;

        let cost = rate.calculate_cost(duration_seconds);
        debug!(
            "Calculated cost: {} for {}s at {}/min",
            cost, duration_seconds, rate.rate_per_minute
        );
        Ok(cost)
    }
}
