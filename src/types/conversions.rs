use ethers::types::{Address, H256, U256};
use std::str::FromStr;

// Addresses are stored lowercase so lookups are case-insensitive.
pub fn address_to_string(addr: Address) -> String {
    format!("{:?}", addr).to_lowercase()
}

pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    Address::from_str(s.trim()).map_err(|e| ConversionError::InvalidAddress(format!("{}: {}", s, e)))
}

// Amounts are stored as decimal strings, uint256 does not fit NUMERIC-free columns.
pub fn u256_to_string(value: U256) -> String {
    value.to_string()
}

pub fn string_to_u256(s: &str) -> Result<U256, ConversionError> {
    U256::from_dec_str(s.trim()).map_err(|e| ConversionError::InvalidAmount(format!("{}: {}", s, e)))
}

pub fn h256_to_string(hash: H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

pub fn string_to_h256(s: &str) -> Result<H256, ConversionError> {
    let raw = hex::decode(s.trim().trim_start_matches("0x"))
        .map_err(|e| ConversionError::InvalidHash(format!("{}: {}", s, e)))?;
    if raw.len() != 32 {
        return Err(ConversionError::InvalidHash(format!("{}: expected 32 bytes, got {}", s, raw.len())));
    }
    Ok(H256::from_slice(&raw))
}

/// Human readable token amount, e.g. `1500000` with 6 decimals -> `1.5`.
pub fn format_amount(value: U256, decimals: u8) -> String {
    match ethers::utils::format_units(value, decimals as u32) {
        Ok(s) if s.contains('.') => s.trim_end_matches('0').trim_end_matches('.').to_string(),
        Ok(s) => s,
        Err(_) => value.to_string(),
    }
}

pub fn block_to_i64(block: u64) -> Result<i64, ConversionError> {
    i64::try_from(block).map_err(|_| ConversionError::Overflow)
}

pub fn i64_to_block(value: i64) -> Result<u64, ConversionError> {
    u64::try_from(value).map_err(|_| ConversionError::Overflow)
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid hash: {0}")]
    InvalidHash(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_lowercased() {
        let addr = string_to_address("0x5483DC6abDA5F094865120B2D251b5744fc2ECB5").unwrap();
        assert_eq!(address_to_string(addr), "0x5483dc6abda5f094865120b2d251b5744fc2ecb5");
        assert!(string_to_address("0x1234").is_err());
    }

    #[test]
    fn test_amount_strings() {
        let big = U256::MAX;
        assert_eq!(string_to_u256(&u256_to_string(big)).unwrap(), big);
        assert!(string_to_u256("-1").is_err());
        assert!(string_to_u256("abc").is_err());
    }

    #[test]
    fn test_hash_strings() {
        let h = H256::repeat_byte(0xab);
        let s = h256_to_string(h);
        assert!(s.starts_with("0xabab"));
        assert_eq!(string_to_h256(&s).unwrap(), h);
        assert!(string_to_h256("0x1234").is_err());
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(U256::from(1_500_000u64), 6), "1.5");
        assert_eq!(format_amount(U256::from(10_000_000_000u64), 6), "10000");
        assert_eq!(format_amount(U256::zero(), 18), "0");
        assert_eq!(format_amount(U256::from(10_000u64), 0), "10000");
    }

    #[test]
    fn test_block_conversions() {
        assert_eq!(block_to_i64(18_786_171).unwrap(), 18_786_171);
        assert!(block_to_i64(u64::MAX).is_err());
        assert!(i64_to_block(-1).is_err());
    }
}
