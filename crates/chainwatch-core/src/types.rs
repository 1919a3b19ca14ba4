//! Canonical records and shared state enums.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Side of a tracked wallet's trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// The wallet's token balance increased.
    Buy,
    /// The wallet's token balance decreased.
    Sell,
    /// No token balance change could be attributed to the wallet.
    Unknown,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Token metadata as cached from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub symbol: String,
    pub decimals: u8,
}

/// One normalized transaction for one tracked wallet.
///
/// A provider payload touching several tracked wallets yields one record per
/// wallet, all sharing the same signature.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Tracked wallet involved in the transaction.
    pub wallet: String,
    /// Token symbol, `Unknown Token` if metadata could not be resolved.
    pub token: String,
    /// Token mint, absent for SOL-only movements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mint: Option<String>,
    pub buy_sell: Direction,
    /// Human-readable signed amount, e.g. `+1,250.5 BONK`.
    pub amount: String,
    /// Provider transaction signature.
    pub signature: String,
    /// Chain block time if the provider sent one, arrival time otherwise.
    pub timestamp: DateTime<Utc>,
    /// The payload this record was built from.
    #[serde(skip)]
    pub raw: Arc<Value>,
}

/// Lifecycle of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; only an explicit `connect()` recovers.
    Terminated,
}

impl ConnectionState {
    /// `connect()` is a no-op in these states.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}
