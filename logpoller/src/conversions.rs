use ethers::types::{Address, H256};

pub fn h256_to_bytes(data: &H256) -> Vec<u8> {
    data.as_bytes().to_vec()
}

pub fn address_to_bytes(data: &Address) -> Vec<u8> {
    data.as_bytes().to_vec()
}

/// Left pads or truncates so that malformed rows never panic.
pub fn bytes_to_h256(data: &[u8]) -> H256 {
    let mut word = [0u8; 32];
    let len = data.len().min(32);
    word[32 - len..].copy_from_slice(&data[data.len() - len..]);
    H256(word)
}

pub fn bytes_to_address(data: &[u8]) -> Address {
    Address::from(bytes_to_h256(data))
}

/// Block numbers are stored as BIGINT.
pub fn u64_to_db(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

pub fn db_to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_values_are_left_padded() {
        assert_eq!(bytes_to_h256(&[1, 2]), H256::from_low_u64_be(0x0102));
        let address = Address::repeat_byte(0xab);
        assert_eq!(bytes_to_address(&address_to_bytes(&address)), address);
    }
}
