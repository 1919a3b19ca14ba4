//! Push payload → [`TransactionRecord`] normalization.
//!
//! For each payload:
//! 1. collect every address the payload references
//! 2. keep only tracked wallets; nothing tracked → payload discarded
//! 3. per wallet, the dominant non-SOL token balance delta gives the side
//!    (increase = BUY, decrease = SELL); no token delta → UNKNOWN with the
//!    wallet's net SOL change as the amount
//! 4. token symbols come from the metadata resolver, `Unknown Token` on failure
//! 5. one record per tracked wallet, all sharing the payload signature

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::PayloadError;
use crate::metadata::MetadataResolver;
use crate::protocol::PushTransaction;
use crate::registry::AddressRegistry;
use crate::types::{Direction, TransactionRecord};

/// Wrapped SOL mint; treated as the SOL leg of a swap, never as the traded token.
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
/// Symbol used when metadata cannot be resolved.
pub const UNKNOWN_TOKEN: &str = "Unknown Token";
/// Prefix of signatures synthesized for payloads that carry none.
pub const MISSING_SIGNATURE_PREFIX: &str = "missing-signature-";

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;
const TOKEN_EPS: f64 = 1e-12;
const SOL_EPS: f64 = 1e-9;

/// What one wallet did in one payload, before symbol resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletActivity {
    pub wallet: String,
    pub direction: Direction,
    /// Traded token mint, if a token delta was found.
    pub mint: Option<String>,
    /// Signed token delta in whole tokens (zero when `mint` is `None`).
    pub token_delta: f64,
    /// Signed net SOL change, if any.
    pub sol_delta: Option<f64>,
}

/// Work out direction and amounts for `wallet` in `tx`.
pub fn analyze_wallet(tx: &PushTransaction, wallet: &str) -> WalletActivity {
    let mut mint_deltas: HashMap<&str, f64> = HashMap::new();

    for change in tx
        .account_data
        .iter()
        .flat_map(|a| a.token_balance_changes.iter())
        .filter(|c| c.user_account == wallet && !c.mint.is_empty())
    {
        if let Some(amount) = change.raw_token_amount.ui_amount() {
            *mint_deltas.entry(change.mint.as_str()).or_default() += amount;
        }
    }

    // Fall back to transfer legs when the provider omitted balance changes.
    if mint_deltas.is_empty() {
        for transfer in tx.token_transfers.iter().filter(|t| !t.mint.is_empty()) {
            if transfer.to_user_account.as_deref() == Some(wallet) {
                *mint_deltas.entry(transfer.mint.as_str()).or_default() += transfer.token_amount;
            }
            if transfer.from_user_account.as_deref() == Some(wallet) {
                *mint_deltas.entry(transfer.mint.as_str()).or_default() -= transfer.token_amount;
            }
        }
    }

    let dominant = mint_deltas
        .iter()
        .filter(|(mint, delta)| **mint != SOL_MINT && delta.abs() > TOKEN_EPS)
        .max_by(|a, b| {
            a.1.abs()
                .partial_cmp(&b.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                // Deterministic tie-break
                .then_with(|| b.0.cmp(a.0))
        })
        .map(|(mint, delta)| (mint.to_string(), *delta));

    let sol_delta = sol_change(tx, wallet, mint_deltas.get(SOL_MINT).copied());

    match dominant {
        Some((mint, delta)) => WalletActivity {
            wallet: wallet.to_string(),
            direction: if delta > 0.0 { Direction::Buy } else { Direction::Sell },
            mint: Some(mint),
            token_delta: delta,
            sol_delta,
        },
        None => WalletActivity {
            wallet: wallet.to_string(),
            direction: Direction::Unknown,
            mint: None,
            token_delta: 0.0,
            sol_delta,
        },
    }
}

fn sol_change(tx: &PushTransaction, wallet: &str, wsol_delta: Option<f64>) -> Option<f64> {
    // i128 so hostile lamport values cannot overflow the sum.
    let native_lamports: i128 = tx
        .account_data
        .iter()
        .filter(|a| a.account == wallet)
        .map(|a| i128::from(a.native_balance_change))
        .sum();

    let lamports = if native_lamports != 0 {
        native_lamports
    } else {
        tx.native_transfers
            .iter()
            .map(|t| {
                let amount = i128::from(t.amount);
                let mut d = 0;
                if t.to_user_account.as_deref() == Some(wallet) {
                    d += amount;
                }
                if t.from_user_account.as_deref() == Some(wallet) {
                    d -= amount;
                }
                d
            })
            .sum()
    };
    let sol = lamports as f64 / LAMPORTS_PER_SOL + wsol_delta.unwrap_or(0.0);

    (sol.abs() > SOL_EPS).then_some(sol)
}

/// Render a signed amount: `+1,250.5` / `-0.000123`.
///
/// Six decimals normally; amounts too small for that get up to twelve so
/// dust never renders as zero.
pub fn format_signed(value: f64) -> String {
    let sign = if value < 0.0 { "-" } else { "+" };
    let magnitude = value.abs();
    let precision = if magnitude > 0.0 && magnitude < 5e-7 { 12 } else { 6 };
    let fixed = format!("{magnitude:.precision$}");
    let fixed = fixed.trim_end_matches('0').trim_end_matches('.');
    let (int_part, frac_part) = match fixed.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (fixed, None),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    match frac_part {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Turns raw provider payloads into canonical records for tracked wallets.
pub struct MessageNormalizer {
    registry: AddressRegistry,
    resolver: Option<Arc<MetadataResolver>>,
    missing_signatures: AtomicU64,
}

impl MessageNormalizer {
    pub fn new(registry: AddressRegistry, resolver: Option<Arc<MetadataResolver>>) -> Self {
        Self {
            registry,
            resolver,
            missing_signatures: AtomicU64::new(0),
        }
    }

    /// Normalize one transaction payload.
    ///
    /// Returns an empty list when the payload touches no tracked wallet.
    /// Metadata failures degrade the symbol; they never drop a record.
    pub async fn normalize(&self, raw: Value) -> Result<Vec<TransactionRecord>, PayloadError> {
        let tx: PushTransaction = serde_json::from_value(raw.clone())?;

        let wallets = self.registry.intersect(tx.referenced_addresses());
        if wallets.is_empty() {
            return Ok(Vec::new());
        }

        let signature = match tx.signature.as_deref().map(str::trim) {
            Some(sig) if !sig.is_empty() => sig.to_string(),
            _ => {
                let n = self.missing_signatures.fetch_add(1, Ordering::Relaxed);
                let synthesized = format!("{MISSING_SIGNATURE_PREFIX}{n}");
                tracing::warn!(signature = %synthesized, "payload without signature");
                synthesized
            }
        };
        let timestamp = tx
            .timestamp
            .and_then(|t| DateTime::from_timestamp(t, 0))
            .unwrap_or_else(Utc::now);

        let activities: Vec<WalletActivity> =
            wallets.iter().map(|w| analyze_wallet(&tx, w)).collect();

        // Lookups for the same mint coalesce inside the resolver.
        let symbols =
            futures::future::join_all(activities.iter().map(|a| self.symbol_for(a.mint.as_deref())))
                .await;

        let raw = Arc::new(raw);
        let records = activities
            .into_iter()
            .zip(symbols)
            .map(|(activity, symbol)| {
                let (token, amount) = match (&activity.mint, activity.sol_delta) {
                    (Some(_), _) => {
                        let amount = format!("{} {symbol}", format_signed(activity.token_delta));
                        (symbol, amount)
                    }
                    (None, Some(sol)) => (symbol, format!("{} SOL", format_signed(sol))),
                    (None, None) => (UNKNOWN_TOKEN.to_string(), "n/a".to_string()),
                };
                TransactionRecord {
                    wallet: activity.wallet,
                    token,
                    mint: activity.mint,
                    buy_sell: activity.direction,
                    amount,
                    signature: signature.clone(),
                    timestamp,
                    raw: Arc::clone(&raw),
                }
            })
            .collect();
        Ok(records)
    }

    async fn symbol_for(&self, mint: Option<&str>) -> String {
        let Some(mint) = mint else {
            return "SOL".to_string();
        };
        let Some(resolver) = &self.resolver else {
            return UNKNOWN_TOKEN.to_string();
        };
        match resolver.resolve(mint).await {
            Ok(meta) if !meta.symbol.trim().is_empty() => meta.symbol,
            Ok(_) => UNKNOWN_TOKEN.to_string(),
            Err(e) => {
                tracing::warn!(mint, error = %e, "token metadata unavailable, using placeholder");
                UNKNOWN_TOKEN.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, MetadataCache};
    use crate::error::MetadataError;
    use crate::metadata::MetadataSource;
    use crate::types::TokenMetadata;
    use async_trait::async_trait;
    use serde_json::json;

    const W1: &str = "W1111111111111111111111111111111";
    const W2: &str = "W2222222222222222222222222222222";
    const BONK: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";

    struct StaticSource;

    #[async_trait]
    impl MetadataSource for StaticSource {
        async fn fetch(&self, mint: &str) -> Result<TokenMetadata, MetadataError> {
            if mint == BONK {
                Ok(TokenMetadata { symbol: "BONK".into(), decimals: 5 })
            } else {
                Err(MetadataError::Unavailable { mint: mint.into(), reason: "unknown".into() })
            }
        }
    }

    fn normalizer(tracked: &[&str]) -> MessageNormalizer {
        let registry = AddressRegistry::new();
        for w in tracked {
            registry.add(w);
        }
        let resolver = MetadataResolver::new(
            Arc::new(MetadataCache::new(&CacheConfig::default())),
            Arc::new(StaticSource),
        );
        MessageNormalizer::new(registry, Some(Arc::new(resolver)))
    }

    fn balance_change(wallet: &str, mint: &str, raw: &str, decimals: u8) -> Value {
        json!({
            "account": "tokenacct",
            "nativeBalanceChange": 0,
            "tokenBalanceChanges": [{
                "userAccount": wallet,
                "mint": mint,
                "rawTokenAmount": {"tokenAmount": raw, "decimals": decimals}
            }]
        })
    }

    #[tokio::test]
    async fn token_increase_is_buy() {
        let n = normalizer(&[W1]);
        let payload = json!({
            "signature": "S1",
            "timestamp": 1_700_000_000,
            "accountData": [
                {"account": W1, "nativeBalanceChange": -500_000_000, "tokenBalanceChanges": []},
                balance_change(W1, BONK, "125050000", 5)
            ]
        });
        let records = n.normalize(payload).await.unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.wallet, W1);
        assert_eq!(r.buy_sell, Direction::Buy);
        assert_eq!(r.token, "BONK");
        assert_eq!(r.amount, "+1,250.5 BONK");
        assert_eq!(r.signature, "S1");
        assert_eq!(r.timestamp.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn token_decrease_is_sell() {
        let n = normalizer(&[W1]);
        let payload = json!({
            "signature": "S2",
            "accountData": [balance_change(W1, BONK, "-100000", 5)]
        });
        let r = &n.normalize(payload).await.unwrap()[0];
        assert_eq!(r.buy_sell, Direction::Sell);
        assert_eq!(r.amount, "-1 BONK");
    }

    #[tokio::test]
    async fn untracked_payload_discarded() {
        let n = normalizer(&[W1]);
        let payload = json!({
            "signature": "S3",
            "accountData": [balance_change(W2, BONK, "100000", 5)]
        });
        assert!(n.normalize(payload).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_record_per_tracked_wallet() {
        let n = normalizer(&[W1, W2]);
        let payload = json!({
            "signature": "S4",
            "tokenTransfers": [
                {"fromUserAccount": W2, "toUserAccount": W1, "mint": BONK, "tokenAmount": 10.0}
            ]
        });
        let records = n.normalize(payload).await.unwrap();
        assert_eq!(records.len(), 2);
        let w1 = records.iter().find(|r| r.wallet == W1).unwrap();
        let w2 = records.iter().find(|r| r.wallet == W2).unwrap();
        assert_eq!(w1.buy_sell, Direction::Buy);
        assert_eq!(w2.buy_sell, Direction::Sell);
        assert_eq!(w1.signature, w2.signature);
    }

    #[tokio::test]
    async fn sol_only_movement_is_unknown_with_sol_amount() {
        let n = normalizer(&[W1]);
        let payload = json!({
            "signature": "S5",
            "nativeTransfers": [
                {"fromUserAccount": W1, "toUserAccount": W2, "amount": 250_000_000}
            ]
        });
        let r = &n.normalize(payload).await.unwrap()[0];
        assert_eq!(r.buy_sell, Direction::Unknown);
        assert_eq!(r.token, "SOL");
        assert_eq!(r.amount, "-0.25 SOL");
        assert!(r.mint.is_none());
    }

    #[tokio::test]
    async fn unresolved_metadata_falls_back() {
        let n = normalizer(&[W1]);
        let payload = json!({
            "signature": "S6",
            "accountData": [balance_change(W1, "MysteryMint1111111111111111111111", "5", 0)]
        });
        let r = &n.normalize(payload).await.unwrap()[0];
        assert_eq!(r.token, UNKNOWN_TOKEN);
        assert_eq!(r.buy_sell, Direction::Buy);
    }

    #[tokio::test]
    async fn missing_signature_is_synthesized() {
        let n = normalizer(&[W1]);
        let payload = json!({"accountData": [balance_change(W1, BONK, "100000", 5)]});
        let r = &n.normalize(payload).await.unwrap()[0];
        assert!(r.signature.starts_with(MISSING_SIGNATURE_PREFIX));
    }

    #[tokio::test]
    async fn huge_lamport_amounts_do_not_overflow() {
        let n = normalizer(&[W1]);
        let payload = json!({
            "signature": "S8",
            "nativeTransfers": [
                {"fromUserAccount": W2, "toUserAccount": W1, "amount": i64::MAX},
                {"fromUserAccount": W2, "toUserAccount": W1, "amount": i64::MAX}
            ],
            "accountData": [
                {"account": W2, "nativeBalanceChange": i64::MIN, "tokenBalanceChanges": []},
                {"account": W2, "nativeBalanceChange": i64::MIN, "tokenBalanceChanges": []}
            ]
        });
        let records = n.normalize(payload).await.unwrap();
        let r = &records[0];
        assert_eq!(r.buy_sell, Direction::Unknown);
        assert!(r.amount.starts_with("+18,446,744,073"));
        assert!(r.amount.ends_with(" SOL"));
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let n = normalizer(&[W1]);
        let payload = json!({"signature": "S7", "accountData": "oops"});
        assert!(matches!(n.normalize(payload).await, Err(PayloadError::Malformed(_))));
    }

    #[test]
    fn wsol_leg_is_not_the_traded_token() {
        let tx: PushTransaction = serde_json::from_value(json!({
            "accountData": [
                balance_change(W1, SOL_MINT, "-2000000000", 9),
                balance_change(W1, BONK, "100000", 5)
            ]
        }))
        .unwrap();
        let activity = analyze_wallet(&tx, W1);
        assert_eq!(activity.mint.as_deref(), Some(BONK));
        assert_eq!(activity.direction, Direction::Buy);
        assert_eq!(activity.sol_delta, Some(-2.0));
    }

    #[test]
    fn signed_formatting() {
        assert_eq!(format_signed(1_234_567.25), "+1,234,567.25");
        assert_eq!(format_signed(-0.000123), "-0.000123");
        assert_eq!(format_signed(100.0), "+100");
        assert_eq!(format_signed(999.0), "+999");
        assert_eq!(format_signed(0.000000042), "+0.000000042");
        assert_eq!(format_signed(-0.000000001), "-0.000000001");
    }
}
