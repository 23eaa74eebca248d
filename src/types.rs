// =============================================================================
// Shared types used across the Meridian trade engine
// =============================================================================
//
// Every status enum round-trips through its `as_str` / `FromStr` pair because
// the persistent store keeps statuses as text columns. Unknown values parse
// to `UnknownEnum`, which the admin surface maps to a 400.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Parse failure for any of the textual enums below.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownEnum {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownEnum;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownEnum { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single last-traded-price update from the data broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub ltp: Decimal,
    pub volume: i64,
    pub ts: DateTime<Utc>,
}

/// Candle timeframes the engine aggregates. Higher timeframes derive from
/// closed one-minute candles and roll over on session-aligned boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M25,
    M125,
}

impl Timeframe {
    /// Bucket width in whole minutes.
    pub fn minutes(&self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M25 => 25,
            Self::M125 => 125,
        }
    }
}

text_enum!(Timeframe, "timeframe", {
    M1 => "1m",
    M25 => "25m",
    M125 => "125m",
});

// ---------------------------------------------------------------------------
// Orders & trades
// ---------------------------------------------------------------------------

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// +1 for longs, -1 for shorts; used for PnL and mirrored exit predicates.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

text_enum!(Direction, "direction", {
    Buy => "BUY",
    Sell => "SELL",
});

/// Order type sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

text_enum!(OrderType, "order type", {
    Market => "MARKET",
    Limit => "LIMIT",
});

/// Broker product type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Delivery,
    Intraday,
}

impl Default for ProductType {
    fn default() -> Self {
        Self::Delivery
    }
}

text_enum!(ProductType, "product type", {
    Delivery => "DELIVERY",
    Intraday => "INTRADAY",
});

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Discrete bucketing of the weighted cross-timeframe buy-zone score.
/// Drives the position-size multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfluenceStrength {
    None,
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

text_enum!(ConfluenceStrength, "confluence strength", {
    None => "NONE",
    Weak => "WEAK",
    Moderate => "MODERATE",
    Strong => "STRONG",
    VeryStrong => "VERY_STRONG",
});

/// Signal lifecycle. Status only ever moves away from Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Active,
    Expired,
    Cancelled,
    Stale,
}

text_enum!(SignalStatus, "signal status", {
    Active => "ACTIVE",
    Expired => "EXPIRED",
    Cancelled => "CANCELLED",
    Stale => "STALE",
});

/// Per-(signal, user-broker) delivery row status. CONSUMED requires a
/// non-null intent id; terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Created,
    Delivered,
    Consumed,
    Expired,
    Rejected,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Consumed | Self::Expired | Self::Rejected)
    }
}

text_enum!(DeliveryStatus, "delivery status", {
    Created => "CREATED",
    Delivered => "DELIVERED",
    Consumed => "CONSUMED",
    Expired => "EXPIRED",
    Rejected => "REJECTED",
});

/// Trade intent status. The intent records the validation *decision*; the
/// trade records the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

text_enum!(IntentStatus, "intent status", {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
    Executed => "EXECUTED",
    Failed => "FAILED",
});

// ---------------------------------------------------------------------------
// Trade lifecycle
// ---------------------------------------------------------------------------

/// Trade status. Transitions are enforced by [`TradeStatus::can_transition`];
/// the trade actor is the only writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Created,
    EntrySubmitted,
    Pending,
    Open,
    Exiting,
    Closed,
    Rejected,
    Cancelled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Rejected | Self::Cancelled)
    }

    /// Whether `self -> to` is a legal edge of the trade state machine.
    ///
    /// Exiting -> Open covers a rejected exit order: the exit intent dies and
    /// the trade returns to the open book for a new episode.
    pub fn can_transition(&self, to: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, to),
            (Created, EntrySubmitted)
                | (Created, Rejected)
                | (EntrySubmitted, Pending)
                | (EntrySubmitted, Rejected)
                | (Pending, Open)
                | (Pending, Rejected)
                | (Open, Exiting)
                | (Open, Cancelled)
                | (Exiting, Closed)
                | (Exiting, Open)
                | (Exiting, Cancelled)
        )
    }
}

text_enum!(TradeStatus, "trade status", {
    Created => "CREATED",
    EntrySubmitted => "ENTRY_SUBMITTED",
    Pending => "PENDING",
    Open => "OPEN",
    Exiting => "EXITING",
    Closed => "CLOSED",
    Rejected => "REJECTED",
    Cancelled => "CANCELLED",
});

/// Whether an entry opens a fresh position or adds to an active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    NewBuy,
    Rebuy,
}

text_enum!(EntryKind, "entry kind", {
    NewBuy => "NEWBUY",
    Rebuy => "REBUY",
});

/// Exit intent status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitIntentStatus {
    Pending,
    Approved,
    Placed,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl ExitIntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected | Self::Failed)
    }
}

text_enum!(ExitIntentStatus, "exit intent status", {
    Pending => "PENDING",
    Approved => "APPROVED",
    Placed => "PLACED",
    Filled => "FILLED",
    Cancelled => "CANCELLED",
    Rejected => "REJECTED",
    Failed => "FAILED",
});

/// Why a trade is being exited. Stop and trailing exits go out as MARKET
/// orders; target and time-based exits go out as LIMIT orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TargetHit,
    TrailingStop,
    TimeBased,
    Manual,
}

impl ExitReason {
    pub fn order_type(&self) -> OrderType {
        match self {
            Self::StopLoss | Self::TrailingStop | Self::Manual => OrderType::Market,
            Self::TargetHit | Self::TimeBased => OrderType::Limit,
        }
    }

    /// Stop-driven exits may fire across the whole session, including the
    /// closing window where target/time exits are refused.
    pub fn allowed_in_closing_window(&self) -> bool {
        matches!(self, Self::StopLoss | Self::TrailingStop | Self::Manual)
    }
}

text_enum!(ExitReason, "exit reason", {
    StopLoss => "STOP_LOSS",
    TargetHit => "TARGET_HIT",
    TrailingStop => "TRAILING_STOP",
    TimeBased => "TIME_BASED",
    Manual => "MANUAL",
});

// ---------------------------------------------------------------------------
// Brokers & operations
// ---------------------------------------------------------------------------

/// Role of a user-broker binding. EXEC brokers receive signal deliveries;
/// exactly one DATA broker feeds market data system-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerRole {
    Exec,
    Data,
}

text_enum!(BrokerRole, "broker role", {
    Exec => "EXEC",
    Data => "DATA",
});

/// Connection state of a user-broker binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Degraded,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

text_enum!(ConnectionStatus, "connection status", {
    Connected => "CONNECTED",
    Disconnected => "DISCONNECTED",
    Degraded => "DEGRADED",
});

/// How often the trailing-stop rule re-evaluates for an open trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateFrequency {
    Tick,
    Brick,
    Candle,
}

impl Default for UpdateFrequency {
    fn default() -> Self {
        Self::Brick
    }
}

text_enum!(UpdateFrequency, "update frequency", {
    Tick => "TICK",
    Brick => "BRICK",
    Candle => "CANDLE",
});

/// Severity attached to operational alert events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

text_enum!(AlertSeverity, "alert severity", {
    Critical => "CRITICAL",
    High => "HIGH",
    Medium => "MEDIUM",
    Low => "LOW",
    Info => "INFO",
});

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_through_text() {
        for s in [
            TradeStatus::Created,
            TradeStatus::EntrySubmitted,
            TradeStatus::Pending,
            TradeStatus::Open,
            TradeStatus::Exiting,
            TradeStatus::Closed,
            TradeStatus::Rejected,
            TradeStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<TradeStatus>().unwrap(), s);
        }
        assert_eq!("VERY_STRONG".parse::<ConfluenceStrength>().unwrap(), ConfluenceStrength::VeryStrong);
    }

    #[test]
    fn unknown_value_is_rejected() {
        let err = "SIDEWAYS".parse::<Direction>().unwrap_err();
        assert_eq!(err.kind, "direction");
        assert_eq!(err.value, "SIDEWAYS");
    }

    #[test]
    fn trade_state_machine_edges() {
        use TradeStatus::*;
        assert!(Created.can_transition(EntrySubmitted));
        assert!(Created.can_transition(Rejected));
        assert!(EntrySubmitted.can_transition(Pending));
        assert!(Pending.can_transition(Open));
        assert!(Open.can_transition(Exiting));
        assert!(Exiting.can_transition(Closed));
        assert!(Exiting.can_transition(Open));

        // Illegal edges.
        assert!(!Created.can_transition(Open));
        assert!(!Closed.can_transition(Open));
        assert!(!Rejected.can_transition(EntrySubmitted));
        assert!(!Open.can_transition(Closed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TradeStatus::Closed.is_terminal());
        assert!(TradeStatus::Rejected.is_terminal());
        assert!(TradeStatus::Cancelled.is_terminal());
        assert!(!TradeStatus::Exiting.is_terminal());
        assert!(DeliveryStatus::Consumed.is_terminal());
        assert!(!DeliveryStatus::Delivered.is_terminal());
    }

    #[test]
    fn exit_reason_order_types() {
        assert_eq!(ExitReason::StopLoss.order_type(), OrderType::Market);
        assert_eq!(ExitReason::TrailingStop.order_type(), OrderType::Market);
        assert_eq!(ExitReason::Manual.order_type(), OrderType::Market);
        assert_eq!(ExitReason::TargetHit.order_type(), OrderType::Limit);
        assert_eq!(ExitReason::TimeBased.order_type(), OrderType::Limit);
    }

    #[test]
    fn direction_sign() {
        assert_eq!(Direction::Buy.sign(), Decimal::ONE);
        assert_eq!(Direction::Sell.sign(), Decimal::NEGATIVE_ONE);
        assert_eq!(Direction::Buy.opposite(), Direction::Sell);
    }
}
