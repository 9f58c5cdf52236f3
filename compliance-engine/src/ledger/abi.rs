//! Campaign contract ABI words
//!
//! Only the handful of calls the engine makes are supported, so selectors and
//! the event topic are precomputed keccak-256 values.

use crate::identity::WalletAddress;

use super::LedgerError;

/// `getContributorInfo(address)`
pub const GET_CONTRIBUTOR_INFO: &str = "0bce8cdf";
/// `canContribute(address,uint256)`
pub const CAN_CONTRIBUTE: &str = "378b6a89";
/// `contribute()`
pub const CONTRIBUTE: &str = "d7bb99ba";
/// `ethPriceUSD()`
pub const ETH_PRICE_USD: &str = "d73d56bb";

/// topic0 of `ContributionAccepted(address,uint256,uint256,uint256,bytes32)`
pub const CONTRIBUTION_ACCEPTED_TOPIC: &str =
    "0xe4df9ac5e79debb2ddfc24de82f980eafdc7da630102548917682ae50804d495";

pub type Word = [u8; 32];

/// A call argument.
#[derive(Debug, Clone)]
pub enum Token<'a> {
    Address(&'a WalletAddress),
    Uint(u128),
}

impl Token<'_> {
    fn encode(&self) -> Word {
        let mut word = [0u8; 32];
        match self {
            Token::Address(addr) => word[12..].copy_from_slice(&addr.to_bytes()),
            Token::Uint(v) => word[16..].copy_from_slice(&v.to_be_bytes()),
        }
        word
    }
}

/// `0x`-prefixed calldata for a selector and static arguments.
pub fn encode_call(selector: &str, args: &[Token<'_>]) -> String {
    let mut out = String::with_capacity(2 + 8 + args.len() * 64);
    out.push_str("0x");
    out.push_str(selector);
    for arg in args {
        out.push_str(&hex::encode(arg.encode()));
    }
    out
}

/// Split return data into 32-byte words.
pub fn decode_words(data: &str) -> Result<Vec<Word>, LedgerError> {
    let body = data.strip_prefix("0x").unwrap_or(data);
    let bytes = hex::decode(body)
        .map_err(|e| LedgerError::InvalidResponse(format!("return data is not hex: {}", e)))?;
    if bytes.len() % 32 != 0 {
        return Err(LedgerError::InvalidResponse(format!(
            "return data length {} is not a whole number of words",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

fn word_at(words: &[Word], index: usize) -> Result<&Word, LedgerError> {
    words.get(index).ok_or_else(|| {
        LedgerError::InvalidResponse(format!("expected at least {} words, got {}", index + 1, words.len()))
    })
}

/// uint256 that must fit in 128 bits.
pub fn word_to_u128(word: &Word) -> Result<u128, LedgerError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(LedgerError::InvalidResponse("uint256 value overflows u128".to_string()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn word_to_u64(word: &Word) -> Result<u64, LedgerError> {
    let v = word_to_u128(word)?;
    u64::try_from(v).map_err(|_| LedgerError::InvalidResponse("uint256 value overflows u64".to_string()))
}

pub fn word_to_bool(word: &Word) -> Result<bool, LedgerError> {
    match word_to_u128(word)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(LedgerError::InvalidResponse(format!("invalid bool word {}", other))),
    }
}

pub fn word_to_address(word: &Word) -> Result<WalletAddress, LedgerError> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(LedgerError::InvalidResponse("address word has dirty high bytes".to_string()));
    }
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Ok(WalletAddress::from_bytes(&bytes))
}

/// Decode the return of a function returning `(uint256, uint256, bool, bool)`.
pub fn decode_contributor_info(data: &str) -> Result<(u128, u128, bool, bool), LedgerError> {
    let words = decode_words(data)?;
    Ok((
        word_to_u128(word_at(&words, 0)?)?,
        word_to_u128(word_at(&words, 1)?)?,
        word_to_bool(word_at(&words, 2)?)?,
        word_to_bool(word_at(&words, 3)?)?,
    ))
}

/// Decode the return of a function returning `(bool, string)`.
pub fn decode_bool_string(data: &str) -> Result<(bool, String), LedgerError> {
    let words = decode_words(data)?;
    let flag = word_to_bool(word_at(&words, 0)?)?;

    let offset = word_to_u64(word_at(&words, 1)?)? as usize;
    if offset % 32 != 0 {
        return Err(LedgerError::InvalidResponse(format!("unaligned string offset {}", offset)));
    }
    let len_index = offset / 32;
    let len = word_to_u64(word_at(&words, len_index)?)? as usize;

    let mut bytes = Vec::with_capacity(len);
    let mut index = len_index + 1;
    while bytes.len() < len {
        let word = word_at(&words, index)?;
        let take = (len - bytes.len()).min(32);
        bytes.extend_from_slice(&word[..take]);
        index += 1;
    }
    let text = String::from_utf8(bytes)
        .map_err(|_| LedgerError::InvalidResponse("string is not utf-8".to_string()))?;
    Ok((flag, text))
}

/// Decode a JSON-RPC hex quantity such as `0x1a`.
pub fn parse_quantity(value: &str) -> Result<u128, LedgerError> {
    let body = value
        .strip_prefix("0x")
        .ok_or_else(|| LedgerError::InvalidResponse(format!("quantity '{}' lacks 0x prefix", value)))?;
    if body.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(body, 16)
        .map_err(|_| LedgerError::InvalidResponse(format!("invalid quantity '{}'", value)))
}

pub fn parse_quantity_u64(value: &str) -> Result<u64, LedgerError> {
    let v = parse_quantity(value)?;
    u64::try_from(v).map_err(|_| LedgerError::InvalidResponse(format!("quantity '{}' overflows u64", value)))
}

/// Encode a JSON-RPC hex quantity (no leading zeros).
pub fn format_quantity(value: u128) -> String {
    format!("0x{:x}", value)
}

/// Left-pad an address into a 32-byte topic.
pub fn address_topic(address: &WalletAddress) -> String {
    format!("0x{}", hex::encode(Token::Address(address).encode()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_hex(v: u128) -> String {
        format!("{:064x}", v)
    }

    #[test]
    fn test_encode_can_contribute_call() {
        let addr = WalletAddress::parse("0x00000000000000000000000000000000000000aa").unwrap();
        let data = encode_call(CAN_CONTRIBUTE, &[Token::Address(&addr), Token::Uint(1_000)]);
        assert_eq!(data.len(), 2 + 8 + 128);
        assert!(data.starts_with("0x378b6a89"));
        assert!(data.ends_with(&word_hex(1_000)));
        assert_eq!(&data[10..74], &word_hex(0xaa));
    }

    #[test]
    fn test_decode_contributor_info() {
        let data = format!(
            "0x{}{}{}{}",
            word_hex(1_100_000_000_000_000_000),
            word_hex(0),
            word_hex(1),
            word_hex(1)
        );
        let (cumulative, remaining, kyc, before) = decode_contributor_info(&data).unwrap();
        assert_eq!(cumulative, 1_100_000_000_000_000_000);
        assert_eq!(remaining, 0);
        assert!(kyc && before);
    }

    #[test]
    fn test_decode_bool_string() {
        let reason = "KYC_REQUIRED";
        let mut padded = hex::encode(reason);
        while padded.len() % 64 != 0 {
            padded.push('0');
        }
        let data = format!(
            "0x{}{}{}{}",
            word_hex(0),
            word_hex(64),
            word_hex(reason.len() as u128),
            padded
        );
        let (ok, text) = decode_bool_string(&data).unwrap();
        assert!(!ok);
        assert_eq!(text, "KYC_REQUIRED");
    }

    #[test]
    fn test_truncated_return_data_is_invalid() {
        let data = format!("0x{}", word_hex(5));
        assert!(matches!(
            decode_contributor_info(&data),
            Err(LedgerError::InvalidResponse(_))
        ));
        assert!(decode_words("0x1234").is_err());
    }

    #[test]
    fn test_quantities() {
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert!(parse_quantity("26").is_err());
        assert_eq!(format_quantity(26), "0x1a");
        assert_eq!(parse_quantity_u64(&format_quantity(12_345)).unwrap(), 12_345);
    }
}
