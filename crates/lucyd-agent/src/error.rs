use thiserror::Error;

use lucyd_core::provider::ProviderError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("agentic loop produced no response")]
    NoResponse,
}

impl AgentError {
    /// Mirror of [`ProviderError::is_transient`] at the loop boundary.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Provider(e) => e.is_transient(),
            AgentError::NoResponse => false,
        }
    }
}
