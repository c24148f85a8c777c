//! Rate card model and increment-aware cost math
//!
//! Represents billing rates for different destinations.
//! Supports longest prefix matching for rate lookup.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Decimal places kept on computed call costs
pub const COST_SCALE: u32 = 4;

/// Round elapsed seconds up to the next multiple of the billing increment
///
/// A fraction of an increment is never billed: 61 seconds with a 60
/// second increment bills as 120. Non-positive durations bill nothing.
#[inline]
pub fn billable_seconds(seconds: i64, increment: i32) -> i64 {
    if seconds <= 0 {
        return 0;
    }
    let increment = i64::from(increment.max(1));
    ((seconds + increment - 1) / increment) * increment
}

/// Cost of `seconds` of talk time at `rate_per_minute`, rounded up to the
/// billing increment
///
/// `ceil(seconds / increment) * increment / 60 * rate_per_minute`,
/// rounded away from zero at [`COST_SCALE`] so the ledger never under-bills.
pub fn cost_for_seconds(seconds: i64, increment: i32, rate_per_minute: Decimal) -> Decimal {
    let rounded = billable_seconds(seconds, increment);
    if rounded == 0 {
        return Decimal::ZERO;
    }
    let minutes = Decimal::from(rounded) / Decimal::from(60);
    (minutes * rate_per_minute).round_dp_with_strategy(COST_SCALE, RoundingStrategy::AwayFromZero)
}

/// Rate card entity
///
/// Defines the billing rate for calls to a specific destination prefix.
/// Multiple rate cards can exist for overlapping prefixes, resolved by
/// longest prefix match and priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateCard {
    /// Unique identifier
    pub id: i32,

    /// Rate name/description
    pub rate_name: Option<String>,

    /// Destination prefix for matching (e.g., "51" for Peru, "519" for Peru Mobile)
    pub destination_prefix: String,

    /// Human-readable destination name
    pub destination_name: String,

    /// Rate per minute
    pub rate_per_minute: Decimal,

    /// Billing increment in seconds (e.g., 60 for per-minute billing)
    pub billing_increment: i32,

    /// Connection fee (charged once per answered call)
    pub connection_fee: Decimal,

    /// When this rate becomes effective
    pub effective_start: DateTime<Utc>,

    /// When this rate expires (None = no expiry)
    pub effective_end: Option<DateTime<Utc>>,

    /// Priority for conflict resolution (higher = preferred)
    pub priority: i32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl RateCard {
    /// Calculate the cost for a given billable duration
    ///
    /// Rounds up to the nearest billing increment before calculating and
    /// adds the connection fee. Calls with no billable time cost nothing.
    #[inline]
    pub fn calculate_cost(&self, billsec: i64) -> Decimal {
        if billsec <= 0 {
            return Decimal::ZERO;
        }

        cost_for_seconds(billsec, self.billing_increment, self.rate_per_minute)
            + self.connection_fee
    }

    /// Check if rate is currently effective
    pub fn is_effective(&self) -> bool {
        let now = Utc::now();
        now >= self.effective_start && self.effective_end.map_or(true, |end| now < end)
    }

    /// Normalize a phone number for prefix matching
    pub fn normalize_destination(destination: &str) -> String {
        destination.chars().filter(|c| c.is_ascii_digit()).collect()
    }

    /// Generate all possible prefixes for a destination (for LPM lookup)
    ///
    /// Returns prefixes from longest to shortest.
    pub fn generate_prefixes(destination: &str) -> Vec<String> {
        let normalized = Self::normalize_destination(destination);
        (1..=normalized.len())
            .rev()
            .map(|i| normalized[..i].to_string())
            .collect()
    }
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            id: 0,
            rate_name: None,
            destination_prefix: String::new(),
            destination_name: String::new(),
            rate_per_minute: Decimal::ZERO,
            billing_increment: 60,
            connection_fee: Decimal::ZERO,
            effective_start: Utc::now(),
            effective_end: None,
            priority: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_billable_seconds_rounds_up() {
        assert_eq!(billable_seconds(61, 60), 120);
        assert_eq!(billable_seconds(60, 60), 60);
        assert_eq!(billable_seconds(1, 60), 60);
        assert_eq!(billable_seconds(0, 60), 0);
        assert_eq!(billable_seconds(-5, 60), 0);
        assert_eq!(billable_seconds(7, 6), 12);
        // A zero increment is treated as per-second billing
        assert_eq!(billable_seconds(7, 0), 7);
    }

    #[test]
    fn test_cost_for_seconds() {
        // 125s at 60s increments = 3 increments = 180s = $0.15 at $0.05/min
        assert_eq!(cost_for_seconds(125, 60, dec!(0.05)), dec!(0.15));
        // 61s bills as 120s, never 61/60
        assert_eq!(cost_for_seconds(61, 60, dec!(1.00)), dec!(2.00));
    }

    #[test]
    fn test_cost_rounds_away_from_zero() {
        // 7 seconds per-second billing at $0.10/min = 0.011666.. -> 0.0117
        assert_eq!(cost_for_seconds(7, 1, dec!(0.10)), dec!(0.0117));
    }

    #[test]
    fn test_calculate_cost_basic() {
        let rate = RateCard {
            rate_per_minute: dec!(0.10),
            billing_increment: 6,
            connection_fee: dec!(0.00),
            ..Default::default()
        };

        assert_eq!(rate.calculate_cost(60), dec!(0.10));
        assert_eq!(rate.calculate_cost(30), dec!(0.05));
        // 7 seconds rounds up to 12 seconds (2 increments)
        assert_eq!(rate.calculate_cost(7), dec!(0.02));
    }

    #[test]
    fn test_calculate_cost_with_connection_fee() {
        let rate = RateCard {
            rate_per_minute: dec!(0.10),
            billing_increment: 6,
            connection_fee: dec!(0.05),
            ..Default::default()
        };

        assert_eq!(rate.calculate_cost(60), dec!(0.15));
        // Unanswered calls never pick up the connection fee
        assert_eq!(rate.calculate_cost(0), dec!(0));
    }

    #[test]
    fn test_generate_prefixes() {
        let prefixes = RateCard::generate_prefixes("+51-99");
        assert_eq!(prefixes, vec!["5199", "519", "51", "5"]);
    }

    #[test]
    fn test_is_effective() {
        let now = Utc::now();

        let rate = RateCard {
            effective_start: now - chrono::Duration::hours(1),
            effective_end: None,
            ..Default::default()
        };
        assert!(rate.is_effective());

        let rate = RateCard {
            effective_start: now - chrono::Duration::hours(2),
            effective_end: Some(now - chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(!rate.is_effective());
    }

    proptest! {
        #[test]
        fn billable_seconds_is_a_covering_multiple(seconds in 1i64..200_000, increment in 1i32..3600) {
            let billed = billable_seconds(seconds, increment);
            prop_assert_eq!(billed % i64::from(increment), 0);
            prop_assert!(billed >= seconds);
            prop_assert!(billed - seconds < i64::from(increment));
        }

        #[test]
        fn cost_is_monotonic_in_duration(seconds in 0i64..100_000, extra in 0i64..10_000, cents in 0i64..500) {
            let rate = Decimal::new(cents, 2);
            prop_assert!(cost_for_seconds(seconds, 60, rate) <= cost_for_seconds(seconds + extra, 60, rate));
        }
    }
}
