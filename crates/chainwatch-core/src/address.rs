//! Wallet address format check.
//!
//! Addresses are base58-encoded 32-byte public keys. The check is pure: no
//! network access, no registry lookup.

/// Shortest base58 rendering of a 32-byte key.
pub const MIN_ADDRESS_LEN: usize = 32;
/// Longest base58 rendering of a 32-byte key.
pub const MAX_ADDRESS_LEN: usize = 44;

const PUBKEY_BYTES: usize = 32;

/// Returns `true` if `address` is a well-formed wallet address.
pub fn is_valid_address(address: &str) -> bool {
    if !(MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&address.len()) {
        return false;
    }
    match bs58::decode(address).into_vec() {
        Ok(bytes) => bytes.len() == PUBKEY_BYTES,
        Err(_) => false,
    }
}

/// Shorten an address for log output: `AbCd…WxYz`.
pub fn short(address: &str) -> String {
    if address.len() <= 12 || !address.is_ascii() {
        return address.to_string();
    }
    format!("{}…{}", &address[..4], &address[address.len() - 4..])
}
