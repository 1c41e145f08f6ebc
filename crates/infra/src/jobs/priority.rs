//! Weighted priority-tier ordering per poll cycle.

use rand::Rng;

use jobstore_core::{DomainError, Priority};

/// Source of uniform draws in `[0, 100)`.
pub trait PercentageSource: Send + Sync {
    fn next_percentage(&self) -> u32;
}

/// Thread-local RNG draws.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPercentage;

impl PercentageSource for RandomPercentage {
    fn next_percentage(&self) -> u32 {
        rand::rng().random_range(0..100)
    }
}

/// Always returns the same draw (tests).
#[derive(Debug, Clone, Copy)]
pub struct FixedPercentage(pub u32);

impl PercentageSource for FixedPercentage {
    fn next_percentage(&self) -> u32 {
        self.0
    }
}

/// Chooses which priority tier is drained first each cycle.
///
/// HIGH leads with probability `high/100`, LOW with `low/100`, MEDIUM with the
/// remainder. Every returned order contains all three tiers exactly once.
pub struct PrioritySelector<R = RandomPercentage> {
    high: u32,
    low: u32,
    source: R,
}

impl PrioritySelector<RandomPercentage> {
    pub fn random(high: u32, low: u32) -> Result<Self, DomainError> {
        Self::new(high, low, RandomPercentage)
    }
}

impl<R: PercentageSource> PrioritySelector<R> {
    /// Fails if either weight or their sum exceeds 100.
    pub fn new(high: u32, low: u32, source: R) -> Result<Self, DomainError> {
        if high > 100 || low > 100 || high + low > 100 {
            return Err(DomainError::validation(format!(
                "priority percentages must satisfy high + low <= 100 (high={high}, low={low})"
            )));
        }
        Ok(Self { high, low, source })
    }

    /// Draw once and return this cycle's tier order.
    pub fn select_ordered_priorities(&self) -> [Priority; 3] {
        self.order_for(self.source.next_percentage())
    }

    /// Tier order for a given draw in `[0, 100)`.
    pub fn order_for(&self, draw: u32) -> [Priority; 3] {
        if draw < self.high {
            [Priority::High, Priority::Medium, Priority::Low]
        } else if draw < self.high + self.low {
            [Priority::Low, Priority::High, Priority::Medium]
        } else {
            [Priority::Medium, Priority::High, Priority::Low]
        }
    }
}

impl<R> core::fmt::Debug for PrioritySelector<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrioritySelector")
            .field("high", &self.high)
            .field("low", &self.low)
            .finish_non_exhaustive()
    }
}
