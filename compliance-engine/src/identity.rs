//! Donor identity and ledger identifier formats
//!
//! Malformed identifiers are rejected here, before any ledger call.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

fn is_prefixed_hex(s: &str, hex_len: usize) -> bool {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(body) => body.len() == hex_len && body.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// 20-byte account address, stored lowercased with `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let s = s.trim();
        if !is_prefixed_hex(s, 40) {
            return Err(EngineError::Validation(format!(
                "wallet address must be 0x followed by 40 hex characters, got '{}'",
                s
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw 20 bytes.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        // Validated on construction
        if let Ok(bytes) = hex::decode(&self.0[2..]) {
            out.copy_from_slice(&bytes);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WalletAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

/// 32-byte transaction hash, stored lowercased with `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash(String);

impl TxHash {
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let s = s.trim();
        if !is_prefixed_hex(s, 64) {
            return Err(EngineError::Validation(format!(
                "transaction hash must be 0x followed by 64 hex characters, got '{}'",
                s
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TxHash {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TxHash {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TxHash> for String {
    fn from(value: TxHash) -> Self {
        value.0
    }
}

/// Stable donor identity: a wallet address or a normalized email.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DonorKey {
    Wallet(WalletAddress),
    Email(String),
}

impl DonorKey {
    /// Parse a wallet address or email, normalizing to lowercase.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let s = s.trim();
        if s.starts_with("0x") || s.starts_with("0X") {
            return WalletAddress::parse(s).map(DonorKey::Wallet);
        }

        let email = s.to_lowercase();
        let valid = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !email.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if !valid {
            return Err(EngineError::Validation(format!(
                "donor key must be a wallet address or an email, got '{}'",
                s
            )));
        }
        Ok(DonorKey::Email(email))
    }

    pub fn as_str(&self) -> &str {
        match self {
            DonorKey::Wallet(w) => w.as_str(),
            DonorKey::Email(e) => e,
        }
    }

    pub fn wallet(&self) -> Option<&WalletAddress> {
        match self {
            DonorKey::Wallet(w) => Some(w),
            DonorKey::Email(_) => None,
        }
    }
}

impl fmt::Display for DonorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DonorKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DonorKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DonorKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DonorKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Alphabet without visually ambiguous characters (0/O, 1/I/L).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Donor-facing receipt identifier, `TXN-XXXXXXXX-XXXX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionCode(String);

impl TransactionCode {
    /// Generate a fresh code. Called once per contribution attempt.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut pick = |n: usize| -> String {
            (0..n)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                .collect()
        };
        let first = pick(8);
        let second = pick(4);
        Self(format!("TXN-{}-{}", first, second))
    }

    /// Stable code for a value, so re-issuing the same payment hits the same
    /// idempotency key.
    pub fn derive(seed: u128) -> Self {
        // Odd multiplier spreads nearby seeds across the alphabet
        let mut n = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15_f39c_c060_5ced_c835);
        let base = CODE_ALPHABET.len() as u128;
        let chars: String = (0..12)
            .map(|_| {
                let c = CODE_ALPHABET[(n % base) as usize] as char;
                n /= base;
                c
            })
            .collect();
        Self(format!("TXN-{}-{}", &chars[..8], &chars[8..]))
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let s = s.trim().to_ascii_uppercase();
        let valid = s.len() == 17
            && s.starts_with("TXN-")
            && s.as_bytes()[12] == b'-'
            && s[4..12]
                .bytes()
                .chain(s[13..].bytes())
                .all(|b| CODE_ALPHABET.contains(&b));
        if !valid {
            return Err(EngineError::Validation(format!(
                "transaction code must look like TXN-XXXXXXXX-XXXX, got '{}'",
                s
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TransactionCode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TransactionCode {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TransactionCode> for String {
    fn from(value: TransactionCode) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_address_normalized() {
        let w = WalletAddress::parse("0xABCDEF0123456789abcdef0123456789ABCDEF01").unwrap();
        assert_eq!(w.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(WalletAddress::from_bytes(&w.to_bytes()), w);
    }

    #[test]
    fn test_wallet_address_rejects_bad_format() {
        assert!(WalletAddress::parse("0x1234").is_err());
        assert!(WalletAddress::parse("abcdef0123456789abcdef0123456789abcdef01").is_err());
        assert!(WalletAddress::parse("0xZZCDEF0123456789abcdef0123456789abcdef01").is_err());
    }

    #[test]
    fn test_tx_hash_format() {
        let h = format!("0x{}", "AB".repeat(32));
        assert_eq!(TxHash::parse(&h).unwrap().as_str(), format!("0x{}", "ab".repeat(32)));
        assert!(TxHash::parse("0xdeadbeef").is_err());
    }

    #[test]
    fn test_donor_key_parsing() {
        assert_eq!(
            DonorKey::parse(" Alice@Example.COM ").unwrap(),
            DonorKey::Email("alice@example.com".into())
        );
        assert!(matches!(
            DonorKey::parse("0xabcdef0123456789abcdef0123456789abcdef01").unwrap(),
            DonorKey::Wallet(_)
        ));
        assert!(DonorKey::parse("not-an-identity").is_err());
        assert!(DonorKey::parse("bob@localhost").is_err());
    }

    #[test]
    fn test_transaction_code_shape() {
        for _ in 0..50 {
            let code = TransactionCode::generate();
            let s = code.as_str();
            assert_eq!(s.len(), 17);
            assert!(s.starts_with("TXN-"));
            assert!(!s[4..].contains(['0', 'O', '1', 'I', 'L']));
            assert_eq!(TransactionCode::parse(s).unwrap(), code);
        }
        assert!(TransactionCode::parse("TXN-12345678-ABCD").is_err());
    }

    #[test]
    fn test_derived_code_is_stable_and_valid() {
        let a = TransactionCode::derive(42);
        assert_eq!(a, TransactionCode::derive(42));
        assert_ne!(a, TransactionCode::derive(43));
        assert_eq!(TransactionCode::parse(a.as_str()).unwrap(), a);
    }
}
