//! Processing engine error types

use thiserror::Error;

/// Reserved engine status codes
pub mod codes {
    /// Inclusive range of business codes that mean "try again later"
    pub const BUSINESS_RANGE_START: u32 = 3000;
    pub const BUSINESS_RANGE_END: u32 = 4000;

    /// Not enough energy/bandwidth/gas on the source to pay for the transfer
    pub const INSUFFICIENT_RESOURCES: u32 = 3001;
    /// Source address is already used by another in-flight transfer
    pub const ADDRESS_TAKEN: u32 = 3002;
    /// Explorer/node for the blockchain is disabled on the engine side
    pub const BLOCKCHAIN_DISABLED: u32 = 3003;

    #[inline]
    pub fn is_business(code: u32) -> bool {
        (BUSINESS_RANGE_START..=BUSINESS_RANGE_END).contains(&code)
    }
}

/// Errors returned by a [`super::ProcessingClient`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Transport failure, nothing reached the engine
    #[error("Processing engine unavailable: {0}")]
    Unavailable(String),

    /// The call may or may not have been applied
    #[error("Processing engine deadline exceeded")]
    DeadlineExceeded,

    #[error("Processing engine error {code}: {message}")]
    Status { code: u32, message: String },
}

impl EngineError {
    pub fn status(code: u32, message: impl Into<String>) -> Self {
        EngineError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unavailable(_) => "ENGINE_UNAVAILABLE",
            EngineError::DeadlineExceeded => "ENGINE_DEADLINE_EXCEEDED",
            EngineError::Status { code, .. } if codes::is_business(*code) => "ENGINE_BUSINESS",
            EngineError::Status { .. } => "ENGINE_ERROR",
        }
    }
}
