use std::collections::HashSet;

use ethers::types::Address;

use crate::types::PendingTx;

const SELECTOR_LEN: usize = 4;
const WORD_LEN: usize = 32;
const ADDRESS_OFFSET: usize = WORD_LEN - 20;

/// 자주 쓰이는 스왑 함수 selector
const SWAP_SELECTORS: [[u8; 4]; 4] = [
    [0x38, 0xed, 0x17, 0x39], // swapExactTokensForTokens
    [0x88, 0x03, 0xdb, 0xee], // swapTokensForExactTokens
    [0x7f, 0xf3, 0x6a, 0xb5], // swapExactETHForTokens
    [0x18, 0xcb, 0xaf, 0xe5], // swapExactTokensForETH
];

/// 어떤 감시 토큰과 관련된 트랜잭션인지 판별
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMatch {
    /// `to`가 토큰 컨트랙트
    Direct(Address),
    /// calldata 인자로 토큰 주소가 등장
    Calldata(Address),
}

impl TokenMatch {
    pub fn token(&self) -> Address {
        match self {
            TokenMatch::Direct(a) | TokenMatch::Calldata(a) => *a,
        }
    }
}

/// ABI 인코딩된 calldata에서 주소 형태의 32바이트 워드를 추출
pub fn calldata_addresses(input: &[u8]) -> impl Iterator<Item = Address> + '_ {
    let args = input.get(SELECTOR_LEN..).unwrap_or_default();
    args.chunks_exact(WORD_LEN).filter_map(|word| {
        let (padding, address) = word.split_at(ADDRESS_OFFSET);
        if padding.iter().all(|b| *b == 0) && address.iter().any(|b| *b != 0) {
            Some(Address::from_slice(address))
        } else {
            None
        }
    })
}

pub fn references_monitored_token(tx: &PendingTx, tokens: &HashSet<Address>) -> Option<TokenMatch> {
    if let Some(to) = tx.to {
        if tokens.contains(&to) {
            return Some(TokenMatch::Direct(to));
        }
    }
    calldata_addresses(&tx.input)
        .find(|address| tokens.contains(address))
        .map(TokenMatch::Calldata)
}

pub fn is_swap_call(input: &[u8]) -> bool {
    input
        .get(..SELECTOR_LEN)
        .map(|selector| SWAP_SELECTORS.iter().any(|s| s == selector))
        .unwrap_or(false)
}

pub fn is_own_transaction(tx: &PendingTx, account: Address) -> bool {
    tx.from == account
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, H256, U256};

    fn pending(to: Address, input: Vec<u8>) -> PendingTx {
        PendingTx {
            hash: H256::random(),
            from: Address::random(),
            to: Some(to),
            value: U256::zero(),
            gas_price: None,
            max_fee_per_gas: None,
            gas: U256::from(21_000u64),
            input: Bytes::from(input),
            nonce: U256::zero(),
        }
    }

    fn word(address: Address) -> Vec<u8> {
        let mut word = vec![0u8; 12];
        word.extend_from_slice(address.as_bytes());
        word
    }

    #[test]
    fn test_direct_match() {
        let token = Address::random();
        let tokens = HashSet::from([token]);
        let tx = pending(token, vec![]);
        assert_eq!(references_monitored_token(&tx, &tokens), Some(TokenMatch::Direct(token)));
    }

    #[test]
    fn test_calldata_match() {
        let token = Address::random();
        let tokens = HashSet::from([token]);

        let mut input = SWAP_SELECTORS[0].to_vec();
        input.extend(vec![0u8; 31]);
        input.push(1); // amountIn
        input.extend(word(Address::random()));
        input.extend(word(token));

        let tx = pending(Address::random(), input.clone());
        assert!(is_swap_call(&input));
        assert_eq!(references_monitored_token(&tx, &tokens), Some(TokenMatch::Calldata(token)));
    }

    #[test]
    fn test_unrelated_transaction_discarded() {
        let tokens = HashSet::from([Address::random()]);
        let mut input = vec![0xa9, 0x05, 0x9c, 0xbb];
        input.extend(word(Address::random()));
        input.extend(vec![0xff; 32]);

        let tx = pending(Address::random(), input);
        assert_eq!(references_monitored_token(&tx, &tokens), None);
        assert!(!is_swap_call(&tx.input));
    }

    #[test]
    fn test_truncated_calldata_ignored() {
        let token = Address::random();
        let tokens = HashSet::from([token]);
        let mut input = vec![0x38, 0xed, 0x17, 0x39];
        input.extend(&word(token)[..20]);
        assert_eq!(calldata_addresses(&input).count(), 0);
        assert_eq!(references_monitored_token(&pending(Address::random(), input), &tokens), None);
    }
}
