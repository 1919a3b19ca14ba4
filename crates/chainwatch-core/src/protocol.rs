//! Provider wire protocol.
//!
//! Outbound control frames:
//! ```json
//! {"action": "subscribe", "addresses": ["<wallet>", ...]}
//! ```
//!
//! Inbound frames are either control acks (`subscribed`, `unsubscribed`,
//! `pong`, `error`) or transaction pushes. A push is a single enhanced
//! transaction object, an array of them, or an envelope
//! `{"type": "transaction", "data": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PayloadError;

// ─── Outbound ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Subscription control frame sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub action: SubscriptionAction,
    pub addresses: Vec<String>,
}

impl ControlFrame {
    pub fn subscribe(addresses: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Subscribe,
            addresses,
        }
    }

    pub fn unsubscribe(addresses: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Unsubscribe,
            addresses,
        }
    }

    pub fn to_json(&self) -> String {
        // A struct of strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ─── Inbound ──────────────────────────────────────────────────────────────────

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// One or more raw transaction payloads, in provider order.
    Transactions(Vec<Value>),
    /// The provider confirmed a control frame.
    Ack {
        action: SubscriptionAction,
        addresses: Vec<String>,
    },
    Pong,
    /// The provider reported an error on the stream.
    ProviderError(String),
}

/// Any of these on an untyped object marks it as a bare transaction payload.
const TRANSACTION_KEYS: [&str; 5] = [
    "signature",
    "accountData",
    "tokenTransfers",
    "nativeTransfers",
    "feePayer",
];

/// Classify one text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, PayloadError> {
    let value: Value = serde_json::from_str(text)?;
    classify(value)
}

fn classify(value: Value) -> Result<InboundFrame, PayloadError> {
    match value {
        Value::Array(items) => Ok(InboundFrame::Transactions(items)),
        Value::Object(obj) => classify_object(obj),
        other => Err(PayloadError::Unrecognised(format!("non-object frame: {other}"))),
    }
}

fn classify_object(obj: Map<String, Value>) -> Result<InboundFrame, PayloadError> {
    let kind = obj.get("type").and_then(Value::as_str).map(str::to_owned);
    match kind.as_deref() {
        Some("transaction") => match obj.get("data") {
            Some(Value::Array(items)) => Ok(InboundFrame::Transactions(items.clone())),
            Some(data @ Value::Object(_)) => Ok(InboundFrame::Transactions(vec![data.clone()])),
            _ => Err(PayloadError::Unrecognised("transaction frame without data".into())),
        },
        Some("subscribed") => Ok(ack(SubscriptionAction::Subscribe, obj.get("addresses"))),
        Some("unsubscribed") => Ok(ack(SubscriptionAction::Unsubscribe, obj.get("addresses"))),
        Some("pong") => Ok(InboundFrame::Pong),
        Some("error") => Ok(InboundFrame::ProviderError(
            obj.get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified provider error")
                .to_string(),
        )),
        Some(other) => Err(PayloadError::Unrecognised(format!("frame type '{other}'"))),
        None if TRANSACTION_KEYS.iter().any(|k| obj.contains_key(*k)) => {
            Ok(InboundFrame::Transactions(vec![Value::Object(obj)]))
        }
        None => Err(PayloadError::Unrecognised("object without type or transaction fields".into())),
    }
}

fn ack(action: SubscriptionAction, addresses: Option<&Value>) -> InboundFrame {
    let addresses = addresses
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    InboundFrame::Ack { action, addresses }
}

// ─── Push payload shape ───────────────────────────────────────────────────────

/// Enhanced transaction as pushed by the provider. Every field is optional
/// on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushTransaction {
    pub signature: Option<String>,
    /// Block time, unix seconds.
    pub timestamp: Option<i64>,
    pub fee_payer: Option<String>,
    pub account_data: Vec<AccountData>,
    pub token_transfers: Vec<TokenTransfer>,
    pub native_transfers: Vec<NativeTransfer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountData {
    pub account: String,
    /// Lamports.
    pub native_balance_change: i64,
    pub token_balance_changes: Vec<TokenBalanceChange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenBalanceChange {
    pub user_account: String,
    pub mint: String,
    pub raw_token_amount: RawTokenAmount,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTokenAmount {
    /// Signed integer amount in base units, as a string.
    pub token_amount: String,
    pub decimals: u8,
}

impl RawTokenAmount {
    /// Amount in whole tokens, or `None` if the string is not an integer.
    pub fn ui_amount(&self) -> Option<f64> {
        let raw: i128 = self.token_amount.trim().parse().ok()?;
        Some(raw as f64 / 10f64.powi(self.decimals as i32))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenTransfer {
    pub from_user_account: Option<String>,
    pub to_user_account: Option<String>,
    pub mint: String,
    /// Whole tokens.
    pub token_amount: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NativeTransfer {
    pub from_user_account: Option<String>,
    pub to_user_account: Option<String>,
    /// Lamports.
    pub amount: i64,
}

impl PushTransaction {
    /// Every address the payload references, in first-seen order (may repeat).
    pub fn referenced_addresses(&self) -> impl Iterator<Item = &str> {
        let accounts = self.account_data.iter().flat_map(|a| {
            std::iter::once(a.account.as_str())
                .chain(a.token_balance_changes.iter().map(|c| c.user_account.as_str()))
        });
        let token_parties = self.token_transfers.iter().flat_map(|t| {
            t.from_user_account
                .as_deref()
                .into_iter()
                .chain(t.to_user_account.as_deref())
        });
        let native_parties = self.native_transfers.iter().flat_map(|t| {
            t.from_user_account
                .as_deref()
                .into_iter()
                .chain(t.to_user_account.as_deref())
        });
        self.fee_payer
            .as_deref()
            .into_iter()
            .chain(accounts)
            .chain(token_parties)
            .chain(native_parties)
            .filter(|a| !a.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_shape() {
        let frame = ControlFrame::subscribe(vec!["W1".into(), "W2".into()]);
        let v: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["action"], "subscribe");
        assert_eq!(v["addresses"][1], "W2");
        let frame = ControlFrame::unsubscribe(vec!["W1".into()]);
        assert!(frame.to_json().contains("\"unsubscribe\""));
    }

    #[test]
    fn classify_variants() {
        assert_eq!(parse_frame(r#"{"type":"pong"}"#).unwrap(), InboundFrame::Pong);
        assert_eq!(
            parse_frame(r#"{"type":"subscribed","addresses":["W1"]}"#).unwrap(),
            InboundFrame::Ack {
                action: SubscriptionAction::Subscribe,
                addresses: vec!["W1".into()]
            }
        );
        assert!(matches!(
            parse_frame(r#"{"type":"error","message":"bad key"}"#).unwrap(),
            InboundFrame::ProviderError(m) if m == "bad key"
        ));
        match parse_frame(r#"{"type":"transaction","data":[{"signature":"a"},{"signature":"b"}]}"#).unwrap() {
            InboundFrame::Transactions(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        match parse_frame(r#"{"signature":"a","accountData":[]}"#).unwrap() {
            InboundFrame::Transactions(items) => assert_eq!(items.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unsigned_native_transfer_is_a_transaction() {
        let frame = r#"{"nativeTransfers":[{"fromUserAccount":"A","toUserAccount":"B","amount":5}]}"#;
        assert!(matches!(parse_frame(frame).unwrap(), InboundFrame::Transactions(items) if items.len() == 1));
        assert!(matches!(
            parse_frame(r#"{"feePayer":"A"}"#).unwrap(),
            InboundFrame::Transactions(_)
        ));
    }

    #[test]
    fn malformed_frames_error() {
        assert!(matches!(parse_frame("{not json"), Err(PayloadError::Malformed(_))));
        assert!(matches!(parse_frame("42"), Err(PayloadError::Unrecognised(_))));
        assert!(matches!(parse_frame(r#"{"foo":1}"#), Err(PayloadError::Unrecognised(_))));
        assert!(matches!(parse_frame(r#"{"type":"transaction"}"#), Err(PayloadError::Unrecognised(_))));
    }

    #[test]
    fn push_transaction_tolerates_nulls() {
        let tx: PushTransaction = serde_json::from_str(
            r#"{"signature":null,"accountData":[{"account":"A","nativeBalanceChange":-5,"tokenBalanceChanges":[]}],"tokenTransfers":[{"fromUserAccount":null,"toUserAccount":"B","mint":"M","tokenAmount":1.5}]}"#,
        )
        .unwrap();
        assert!(tx.signature.is_none());
        let addrs: Vec<&str> = tx.referenced_addresses().collect();
        assert_eq!(addrs, vec!["A", "B"]);
    }

    #[test]
    fn raw_amount_scaling() {
        let amt = RawTokenAmount {
            token_amount: "-1500000".into(),
            decimals: 6,
        };
        assert_eq!(amt.ui_amount(), Some(-1.5));
        let bad = RawTokenAmount {
            token_amount: "n/a".into(),
            decimals: 6,
        };
        assert_eq!(bad.ui_amount(), None);
    }
}
