// =============================================================================
// Order-Type Normalization — internal vocabulary <-> venue strings
// =============================================================================
//
// The mapping is bijective by default: every internal type has exactly one
// venue string and the inverse accepts that string back. Unknown venue
// strings fall back to LIMIT with a warning rather than failing the sync
// path. Status mapping follows the same policy: anything unrecognised is
// treated as OPEN so reconciliation keeps polling it.
// =============================================================================

use tracing::warn;

use crate::types::{OrderStatus, OrderType};

/// Map an internal order type to the venue wire string.
pub fn map_internal_to_venue(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::Stop => "STOP",
        OrderType::StopLimit => "STOP_LIMIT",
        OrderType::StopMarket => "STOP_MARKET",
        OrderType::TakeProfit => "TAKE_PROFIT",
        OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
    }
}

/// Map a venue order-type string back to the internal vocabulary.
///
/// Case-insensitive; `-` and space are treated as `_`. Unknown strings map
/// to `Limit` with a warning.
pub fn map_venue_to_internal(venue_type: &str) -> OrderType {
    let normalized = venue_type.trim().to_uppercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "MARKET" => OrderType::Market,
        "LIMIT" => OrderType::Limit,
        "STOP" | "STOP_LOSS" => OrderType::Stop,
        "STOP_LIMIT" | "STOP_LOSS_LIMIT" => OrderType::StopLimit,
        "STOP_MARKET" => OrderType::StopMarket,
        "TAKE_PROFIT" | "TAKE_PROFIT_LIMIT" => OrderType::TakeProfit,
        "TAKE_PROFIT_MARKET" => OrderType::TakeProfitMarket,
        other => {
            warn!(venue_type = other, "unknown venue order type — defaulting to LIMIT");
            OrderType::Limit
        }
    }
}

/// Map a venue order-status string to the internal lifecycle.
///
///   open -> Placed, closed|filled -> Filled, canceled -> Canceled,
///   rejected -> Rejected, anything else -> Open.
pub fn map_venue_status(venue_status: &str) -> OrderStatus {
    match venue_status.trim().to_lowercase().as_str() {
        "open" | "new" => OrderStatus::Placed,
        "closed" | "filled" => OrderStatus::Filled,
        "canceled" | "cancelled" => OrderStatus::Canceled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Open,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_bijective_for_known_types() {
        for t in [
            OrderType::Market,
            OrderType::Limit,
            OrderType::Stop,
            OrderType::StopLimit,
            OrderType::StopMarket,
            OrderType::TakeProfit,
            OrderType::TakeProfitMarket,
        ] {
            assert_eq!(map_venue_to_internal(map_internal_to_venue(t)), t);
        }
    }

    #[test]
    fn unknown_venue_type_defaults_to_limit() {
        assert_eq!(map_venue_to_internal("ICEBERG_WEIRD"), OrderType::Limit);
        assert_eq!(map_venue_to_internal(""), OrderType::Limit);
    }

    #[test]
    fn venue_aliases_normalise() {
        assert_eq!(map_venue_to_internal("stop-loss"), OrderType::Stop);
        assert_eq!(map_venue_to_internal("stop loss limit"), OrderType::StopLimit);
        assert_eq!(map_venue_to_internal("take_profit_limit"), OrderType::TakeProfit);
        assert_eq!(map_venue_to_internal("market"), OrderType::Market);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_venue_status("open"), OrderStatus::Placed);
        assert_eq!(map_venue_status("NEW"), OrderStatus::Placed);
        assert_eq!(map_venue_status("closed"), OrderStatus::Filled);
        assert_eq!(map_venue_status("filled"), OrderStatus::Filled);
        assert_eq!(map_venue_status("canceled"), OrderStatus::Canceled);
        assert_eq!(map_venue_status("cancelled"), OrderStatus::Canceled);
        assert_eq!(map_venue_status("rejected"), OrderStatus::Rejected);
        assert_eq!(map_venue_status("partially_filled"), OrderStatus::Open);
        assert_eq!(map_venue_status("???"), OrderStatus::Open);
    }
}
