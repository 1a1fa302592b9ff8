//! Error taxonomy shared by every pipeline stage.
//!
//! Everything except [`PipelineError::Collaborator`] and
//! [`PipelineError::IntegrityMismatch`] is a pre-commit guard: it is raised
//! before any persistence write happens.

use ethers::types::{Address, U256};

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid block range: to_block {to_block} < from_block {from_block}")]
    InvalidRange { from_block: u64, to_block: u64 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("stale round for chain {chain_id} token {token:?}: requested block {requested} but a round already exists at block {existing}")]
    StaleRound {
        chain_id: u64,
        token: Address,
        requested: u64,
        existing: u64,
    },

    #[error("no eligible holders: total shares is 0")]
    EmptyEligibleSet,

    #[error("budget {budget} too small: every holder share rounds down to 0")]
    ZeroBudget { budget: U256 },

    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("collaborator failure ({context}): {source:#}")]
    Collaborator {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    /// Wraps an opaque collaborator failure with the block range or address involved.
    pub fn collaborator(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::Collaborator {
            context: context.into(),
            source: source.into(),
        }
    }

    /// True for the guards that fire before anything is persisted.
    pub fn is_pre_commit(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidRange { .. }
                | PipelineError::Validation(_)
                | PipelineError::StaleRound { .. }
                | PipelineError::EmptyEligibleSet
                | PipelineError::ZeroBudget { .. }
        )
    }
}

/// Attaches collaborator context to any `anyhow`-style result.
pub trait CollaboratorContext<T> {
    fn collaborator(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> CollaboratorContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn collaborator(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| PipelineError::collaborator(context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_commit_classification() {
        assert!(PipelineError::InvalidRange { from_block: 2, to_block: 1 }.is_pre_commit());
        assert!(PipelineError::EmptyEligibleSet.is_pre_commit());
        assert!(!PipelineError::IntegrityMismatch("x".into()).is_pre_commit());
        assert!(!PipelineError::collaborator("blocks 1..=2", anyhow::anyhow!("timeout")).is_pre_commit());
    }

    #[test]
    fn test_collaborator_context_is_rendered() {
        let res: std::result::Result<(), anyhow::Error> = Err(anyhow::anyhow!("connection reset"));
        let err = res.collaborator(|| "eth_getLogs blocks 10..=19".to_string()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("eth_getLogs blocks 10..=19"));
        assert!(msg.contains("connection reset"));
    }
}
