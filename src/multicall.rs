use crate::metrics;
pub use anyhow::Result;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// A single contract read to be batched in a multicall.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Call {
    /// Target contract address
    pub target: Address,
    /// Encoded function call data
    pub call_data: Bytes,
}

impl Call {
    pub fn new(target: Address, call_data: Bytes) -> Self {
        Self { target, call_data }
    }
}

/// Multicall3 `aggregate3` executor.
///
/// Batches contract reads into a single `eth_call`, optionally pinned to a
/// block, so every value in a batch comes from the same state.
///
/// ## Features
///
/// - **Coalescing**: identical `(target, calldata)` pairs are sent once
/// - **Batching**: at most `batch_size` calls per request (capped at 200)
/// - **Strict results**: a reverted sub-call fails the whole run unless
///   [`Multicall::allow_failure`] is set
#[derive(Clone)]
pub struct Multicall<M: Middleware> {
    pub provider: Arc<M>,
    multicall_address: Address,
    batch_size: usize,
    timeout_seconds: u64,
    allow_failure: bool,
}

impl<M: Middleware + 'static> Multicall<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address, batch_size: usize) -> Self {
        // Providers reject oversized aggregate calls
        let validated_batch_size = batch_size.clamp(1, 200);

        if batch_size > 200 {
            warn!(
                "⚠️ Batch size {} exceeds recommended maximum (200), capping to 200",
                batch_size
            );
        }

        Self {
            provider,
            multicall_address,
            batch_size: validated_batch_size,
            timeout_seconds: 30,
            allow_failure: false,
        }
    }

    /// Set custom timeout for each aggregate call
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Return empty bytes for reverted sub-calls instead of failing.
    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    /// Runs a batch of calls, optionally at a specific block.
    /// Results come back in the order of `calls`.
    pub async fn run(&self, calls: Vec<Call>, block: Option<BlockId>) -> Result<Vec<Bytes>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce identical calls to reduce load
        let mut unique_calls = indexmap::IndexMap::new();
        let mut original_indices = vec![0; calls.len()];
        for (i, call) in calls.iter().enumerate() {
            let (index, _) = unique_calls.insert_full((call.target, call.call_data.clone()), ());
            original_indices[i] = index;
        }

        let unique_call_vec: Vec<_> = unique_calls
            .into_keys()
            .map(|(target, call_data)| Call { target, call_data })
            .collect();
        debug!(
            "Multicall coalesced {} calls into {}",
            calls.len(),
            unique_call_vec.len()
        );

        let mut all_results_unique: Vec<Bytes> = Vec::with_capacity(unique_call_vec.len());

        for call_chunk in unique_call_vec.chunks(self.batch_size) {
            metrics::record_multicall_batch_size(call_chunk.len());
            metrics::increment_rpc_call("eth_call");

            let return_data = self.execute_multicall3(call_chunk, block).await?;
            if return_data.len() != call_chunk.len() {
                anyhow::bail!(
                    "multicall returned {} results for {} calls",
                    return_data.len(),
                    call_chunk.len()
                );
            }
            all_results_unique.extend(return_data);
        }

        // Reconstruct the full result set in the original order
        original_indices
            .into_iter()
            .map(|index| {
                all_results_unique
                    .get(index)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("missing multicall result {}", index))
            })
            .collect()
    }

    async fn execute_multicall3(&self, calls: &[Call], block: Option<BlockId>) -> Result<Vec<Bytes>> {
        // aggregate3(Call3[] calls) returns (Result[] returnData)
        // Call3: (address target, bool allowFailure, bytes callData)
        // Result: (bool success, bytes returnData)
        let call_tokens: Vec<Token> = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(self.allow_failure),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();

        let calldata = aggregate3().encode_input(&[Token::Array(call_tokens)])?;

        let tx_request = TransactionRequest::new().to(self.multicall_address).data(calldata);
        let typed_tx: TypedTransaction = tx_request.into();

        let response = tokio::time::timeout(
            Duration::from_secs(self.timeout_seconds),
            self.provider.call(&typed_tx, block),
        )
        .await
        .map_err(|_| anyhow::anyhow!("multicall timed out after {}s", self.timeout_seconds))?
        .map_err(|e| anyhow::anyhow!("multicall eth_call failed: {}", e))?;

        let decoded = ethers::abi::decode(&[result_array_type()], &response)?;

        let results_array = decoded
            .into_iter()
            .next()
            .and_then(|t| t.into_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid multicall response format"))?;

        let mut return_data = Vec::with_capacity(results_array.len());
        for (i, result_token) in results_array.into_iter().enumerate() {
            let mut tuple = result_token
                .into_tuple()
                .ok_or_else(|| anyhow::anyhow!("Invalid multicall result {}", i))?;
            let data = tuple.pop().and_then(|t| t.into_bytes()).unwrap_or_default();
            let success = tuple.pop().and_then(|t| t.into_bool()).unwrap_or(false);
            if !success && !self.allow_failure {
                anyhow::bail!("multicall sub-call to {:?} reverted", calls[i].target);
            }
            return_data.push(Bytes::from(data));
        }

        Ok(return_data)
    }
}

fn result_array_type() -> ParamType {
    ParamType::Array(Box::new(ParamType::Tuple(vec![ParamType::Bool, ParamType::Bytes])))
}

#[allow(deprecated)]
fn aggregate3() -> Function {
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: result_array_type(),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate3_selector() {
        let selector = aggregate3().short_signature();
        assert_eq!(hex::encode(selector), "82ad56cb");
    }
}
