//! Materialization strategies
//!
//! Three interchangeable realizations of one contract: given an archive
//! entry and a target directory, produce a visible, playable name inside the
//! target (or fail the item). The strategy is a tagged variant per configured
//! source, not a type hierarchy; the worker dispatches on
//! [`StrategyKind`](crate::types::StrategyKind).

pub mod extract;
pub mod mount;
pub mod sanitize;
pub mod virtual_http;

use crate::types::StrategyKind;
use tracing::warn;

/// Resolve the strategy actually used for one archive set.
///
/// Very large sets fall back from virtual-http to extraction: decoding a
/// multi-gigabyte entry from its start on every distant seek serves poorly,
/// while extraction pays the cost once.
pub fn effective_strategy(
    configured: StrategyKind,
    total_size: u64,
    fallback_threshold: u64,
) -> StrategyKind {
    if configured == StrategyKind::VirtualHttp && total_size > fallback_threshold {
        warn!(
            total_size,
            fallback_threshold, "archive too large for virtual-http, switching to extraction"
        );
        StrategyKind::Extract
    } else {
        configured
    }
}
