//! Classification of funds-withdrawal results.
//!
//! Both the sweep path and the processing-withdrawal path consume the same
//! [`Outcome`], so neither matches on raw codes.
//!
//! ```text
//! Err(Unavailable)                 → Retry      (no record)
//! Err(DeadlineExceeded)            → Retry      (no record)
//! Err(Status 3000..=4000)          → Retry      (no record)
//! Err(Status other)                → Failure    (failed record)
//! Ok(receipt)                      → Success    (new record)
//! ```

use std::fmt;

use super::FundsWithdrawalReceipt;
use super::error::{EngineError, codes};

/// Why an attempt must be retried on a later tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    Unavailable(String),
    DeadlineExceeded,
    /// Business code in the reserved range (resources, contention)
    Contended { code: u32, message: String },
    /// Engine has the chain's explorer switched off
    BlockchainDisabled(String),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Unavailable(msg) => write!(f, "engine unavailable: {}", msg),
            RetryReason::DeadlineExceeded => write!(f, "engine deadline exceeded"),
            RetryReason::Contended { code, message } => {
                write!(f, "engine busy ({}): {}", code, message)
            }
            RetryReason::BlockchainDisabled(msg) => write!(f, "blockchain disabled: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing is recorded, the unit of work stays eligible
    Retry(RetryReason),
    /// Engine rejected the request; recorded as a failed transfer
    Failure(String),
    Success(FundsWithdrawalReceipt),
}

impl RetryReason {
    /// The single classification point for engine errors.
    ///
    /// `Err` hands back errors that must be recorded as failures.
    pub fn from_error(err: EngineError) -> Result<Self, EngineError> {
        match err {
            EngineError::Unavailable(msg) => Ok(RetryReason::Unavailable(msg)),
            EngineError::DeadlineExceeded => Ok(RetryReason::DeadlineExceeded),
            EngineError::Status { code, message } if code == codes::BLOCKCHAIN_DISABLED => {
                Ok(RetryReason::BlockchainDisabled(message))
            }
            EngineError::Status { code, message } if codes::is_business(code) => {
                Ok(RetryReason::Contended { code, message })
            }
            other => Err(other),
        }
    }
}

impl Outcome {
    pub fn classify(result: Result<FundsWithdrawalReceipt, EngineError>) -> Self {
        match result {
            Ok(receipt) => Outcome::Success(receipt),
            Err(err) => match RetryReason::from_error(err) {
                Ok(reason) => Outcome::Retry(reason),
                Err(err) => Outcome::Failure(err.to_string()),
            },
        }
    }

    #[inline]
    pub fn is_retry(&self) -> bool {
        matches!(self, Outcome::Retry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt() -> FundsWithdrawalReceipt {
        FundsWithdrawalReceipt {
            tx_hash: Some("0xabc".into()),
            message: None,
        }
    }

    #[test]
    fn test_success() {
        assert_eq!(Outcome::classify(Ok(receipt())), Outcome::Success(receipt()));
    }

    #[test]
    fn test_transport_failures_retry() {
        assert_eq!(
            Outcome::classify(Err(EngineError::Unavailable("refused".into()))),
            Outcome::Retry(RetryReason::Unavailable("refused".into()))
        );
        assert_eq!(
            Outcome::classify(Err(EngineError::DeadlineExceeded)),
            Outcome::Retry(RetryReason::DeadlineExceeded)
        );
    }

    #[test]
    fn test_business_range_retry() {
        let outcome = Outcome::classify(Err(EngineError::status(
            codes::INSUFFICIENT_RESOURCES,
            "not enough energy",
        )));
        assert_eq!(
            outcome,
            Outcome::Retry(RetryReason::Contended {
                code: codes::INSUFFICIENT_RESOURCES,
                message: "not enough energy".into()
            })
        );
        assert!(Outcome::classify(Err(EngineError::status(3999, "x"))).is_retry());
    }

    #[test]
    fn test_blockchain_disabled_is_distinguished() {
        assert_eq!(
            Outcome::classify(Err(EngineError::status(codes::BLOCKCHAIN_DISABLED, "tron off"))),
            Outcome::Retry(RetryReason::BlockchainDisabled("tron off".into()))
        );
    }

    #[test]
    fn test_other_codes_fail() {
        assert_eq!(
            Outcome::classify(Err(EngineError::status(3, "invalid address"))),
            Outcome::Failure("Processing engine error 3: invalid address".into())
        );
        assert!(!Outcome::classify(Err(EngineError::status(4001, "x"))).is_retry());
    }

    #[test]
    fn test_from_error_returns_terminal_errors() {
        assert_eq!(
            RetryReason::from_error(EngineError::status(codes::ADDRESS_TAKEN, "busy")),
            Ok(RetryReason::Contended {
                code: codes::ADDRESS_TAKEN,
                message: "busy".into()
            })
        );
        assert_eq!(
            RetryReason::from_error(EngineError::status(5, "invalid argument")),
            Err(EngineError::status(5, "invalid argument"))
        );
    }
}
