// Transfer Event Extractor - decodes ERC20 Transfer logs into TransferEvent values
// Logs come straight from eth_getLogs. Logs from other contracts or with another
// topic0 are skipped; a Transfer from the tracked token that cannot be decoded
// fails the whole batch, since dropping it would corrupt every later balance.

use crate::types::TransferEvent;
use anyhow::{bail, Result};
use ethers::types::{Address, Filter, Log, H256, U256};
use ethers::utils::keccak256;
use tracing::{debug, error};

pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// keccak256("Transfer(address,address,uint256)")
pub fn transfer_topic() -> H256 {
    H256::from(keccak256(TRANSFER_EVENT_SIGNATURE))
}

/// `eth_getLogs` filter for the token's Transfer events in `[from_block, to_block]`.
pub fn transfer_filter(token: Address, from_block: u64, to_block: u64) -> Filter {
    Filter::new()
        .address(token)
        .topic0(transfer_topic())
        .from_block(from_block)
        .to_block(to_block)
}

/// Decodes one log. `Ok(None)` for logs that are not Transfers of `token`;
/// an error for a token Transfer that is removed, pending or malformed.
pub fn decode_transfer_log(token: Address, log: &Log) -> Result<Option<TransferEvent>> {
    if log.address != token {
        debug!("🔍 [TransferEvents] Ignoring log from foreign contract {:?}", log.address);
        return Ok(None);
    }
    if log.topics.first() != Some(&transfer_topic()) {
        return Ok(None);
    }

    let tx = log.transaction_hash;
    if log.removed == Some(true) {
        error!("❌ [TransferEvents] Removed Transfer log in tx {:?}", tx);
        bail!("Transfer log in tx {:?} was removed by a reorg", tx);
    }
    if log.topics.len() != 3 {
        error!("❌ [TransferEvents] Transfer log with {} topics in tx {:?}", log.topics.len(), tx);
        bail!("Transfer log in tx {:?} has {} topics, expected 3", tx, log.topics.len());
    }
    if log.data.len() != 32 {
        error!("❌ [TransferEvents] Transfer log with {} data bytes in tx {:?}", log.data.len(), tx);
        bail!("Transfer log in tx {:?} has {} data bytes, expected 32", tx, log.data.len());
    }
    let block_number = match log.block_number {
        Some(b) => b.as_u64(),
        None => bail!("Transfer log in tx {:?} has no block number", tx),
    };

    Ok(Some(TransferEvent {
        block_number,
        log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
        from: Address::from_slice(&log.topics[1].as_bytes()[12..]),
        to: Address::from_slice(&log.topics[2].as_bytes()[12..]),
        value: U256::from_big_endian(log.data.as_ref()),
    }))
}

/// Decodes a batch of logs and puts them in chain order (block, then log index).
pub fn decode_transfer_logs(token: Address, logs: &[Log]) -> Result<Vec<TransferEvent>> {
    let mut events = Vec::with_capacity(logs.len());
    for log in logs {
        if let Some(event) = decode_transfer_log(token, log)? {
            events.push(event);
        }
    }
    events.sort_by_key(|e| (e.block_number, e.log_index));
    if events.len() != logs.len() {
        debug!(
            "🔍 [TransferEvents] Decoded {} transfers out of {} logs",
            events.len(),
            logs.len()
        );
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};

    fn topic_for(addr: Address) -> H256 {
        H256::from(addr)
    }

    fn transfer_log(token: Address, block: u64, index: u64, from: Address, to: Address, value: u64) -> Log {
        let mut data = [0u8; 32];
        U256::from(value).to_big_endian(&mut data);
        Log {
            address: token,
            topics: vec![transfer_topic(), topic_for(from), topic_for(to)],
            data: Bytes::from(data.to_vec()),
            block_number: Some(U64::from(block)),
            log_index: Some(U256::from(index)),
            ..Default::default()
        }
    }

    #[test]
    fn test_transfer_topic() {
        assert_eq!(
            format!("{:?}", transfer_topic()),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_decode_and_order() {
        let token = Address::from_low_u64_be(0x70);
        let a = Address::from_low_u64_be(0xA);
        let b = Address::from_low_u64_be(0xB);
        let logs = vec![
            transfer_log(token, 11, 0, b, a, 5),
            transfer_log(token, 10, 3, a, b, 40),
            transfer_log(token, 10, 1, Address::zero(), a, 100),
        ];
        let events = decode_transfer_logs(token, &logs).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!((events[0].block_number, events[0].log_index), (10, 1));
        assert_eq!(events[0].from, Address::zero());
        assert_eq!(events[1].value, U256::from(40));
        assert_eq!(events[1].from, a);
        assert_eq!(events[1].to, b);
        assert_eq!(events[2].block_number, 11);
    }

    #[test]
    fn test_skips_logs_of_other_contracts_and_events() {
        let token = Address::from_low_u64_be(0x70);
        let other = Address::from_low_u64_be(0x71);
        let a = Address::from_low_u64_be(0xA);

        let foreign = transfer_log(other, 1, 0, a, a, 1);
        assert!(decode_transfer_log(token, &foreign).unwrap().is_none());

        let mut approval = transfer_log(token, 1, 0, a, a, 1);
        approval.topics[0] = H256::from(keccak256("Approval(address,address,uint256)"));
        assert!(decode_transfer_log(token, &approval).unwrap().is_none());

        let events = decode_transfer_logs(token, &[foreign, approval, transfer_log(token, 2, 0, a, a, 7)]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, U256::from(7));
    }

    #[test]
    fn test_malformed_token_transfer_fails_batch() {
        let token = Address::from_low_u64_be(0x70);
        let a = Address::from_low_u64_be(0xA);
        let b = Address::from_low_u64_be(0xB);

        let mut short = transfer_log(token, 10, 0, a, b, 1);
        short.data = Bytes::from(vec![0u8; 31]);
        let batch = vec![transfer_log(token, 9, 0, Address::zero(), a, 5), short.clone()];
        let err = decode_transfer_logs(token, &batch).unwrap_err();
        assert!(err.to_string().contains("31 data bytes"));

        let mut removed = transfer_log(token, 10, 0, a, b, 1);
        removed.removed = Some(true);
        assert!(decode_transfer_log(token, &removed).is_err());

        let mut no_index_topics = transfer_log(token, 10, 0, a, b, 1);
        no_index_topics.topics.truncate(1);
        assert!(decode_transfer_log(token, &no_index_topics).is_err());

        let mut pending = transfer_log(token, 10, 0, a, b, 1);
        pending.block_number = None;
        assert!(decode_transfer_log(token, &pending).is_err());
    }
}
