//! Defines the metric keys and labels used throughout slotpool.
//!
//! Using a central module for these constants helps prevent typos and ensures
//! consistency across the codebase.

// --- Metric Keys ---

/// Tracks the total number of growth events, i.e. blocks carved and spliced
/// onto the free list.
pub const GROWTHS_TOTAL: &str = "slotpool_growths_total";

/// A gauge representing the current capacity of the pool in slots: the total
/// number of slots ever produced across all blocks the pool owns.
pub const CAPACITY_SLOTS: &str = "slotpool_capacity_slots";

/// Tracks the total number of refused growth attempts.
///
/// Labels:
/// - `reason`: "rate_limited", "alloc_failed"
pub const GROWTH_REFUSALS_TOTAL: &str = "slotpool_growth_refusals_total";

// --- Label Keys ---

pub const LABEL_REASON: &str = "reason";
