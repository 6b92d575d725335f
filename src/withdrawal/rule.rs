//! Multi-Withdrawal Rule Resolver

use rand::seq::SliceRandom;
use std::sync::Arc;

use super::error::WithdrawalError;
use crate::models::{Currency, MultiWithdrawalMode, MultiWithdrawalRule, User};
use crate::processing::ProcessingClient;

/// Parse a stored or user-supplied rule mode
pub fn parse_mode(mode: &str) -> Result<MultiWithdrawalMode, WithdrawalError> {
    mode.parse()
        .map_err(|_| WithdrawalError::UnknownRuleMode(mode.to_string()))
}

/// Check a rule before it is saved.
///
/// Manual rules need an address that is on the approved list.
pub fn validate_rule(
    mode: MultiWithdrawalMode,
    manual_address: Option<&str>,
    approved: &[String],
) -> Result<(), WithdrawalError> {
    if mode == MultiWithdrawalMode::Manual {
        ensure_manual_approved(manual_address, approved)?;
    }
    Ok(())
}

fn ensure_manual_approved<'a>(
    manual_address: Option<&'a str>,
    approved: &[String],
) -> Result<&'a str, WithdrawalError> {
    let address = manual_address
        .filter(|a| !a.is_empty())
        .ok_or(WithdrawalError::ManualAddressNotSet)?;
    if !approved.iter().any(|a| a == address) {
        return Err(WithdrawalError::ManualAddressNotApproved(address.to_string()));
    }
    Ok(address)
}

/// Uniform pick from the approved list
pub(crate) fn pick_random(approved: &[String]) -> Result<String, WithdrawalError> {
    approved
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or(WithdrawalError::EmptyApprovedAddresses)
}

pub struct RuleResolver {
    engine: Arc<dyn ProcessingClient>,
}

impl RuleResolver {
    pub fn new(engine: Arc<dyn ProcessingClient>) -> Self {
        Self { engine }
    }

    /// Destination of a consolidation sweep under the rule's mode
    pub async fn resolve_destination(
        &self,
        user: &User,
        rule: &MultiWithdrawalRule,
        currency: &Currency,
        approved: &[String],
    ) -> Result<String, WithdrawalError> {
        match rule.mode {
            MultiWithdrawalMode::Manual => {
                ensure_manual_approved(rule.manual_address.as_deref(), approved).map(str::to_string)
            }
            MultiWithdrawalMode::Processing => {
                let owner_id = user
                    .processing_owner_id
                    .ok_or(WithdrawalError::NoProcessingOwner(user.id))?;
                let address = self
                    .engine
                    .get_owner_processing_wallet(owner_id, currency.blockchain)
                    .await?;
                Ok(address)
            }
            MultiWithdrawalMode::Random => pick_random(approved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Blockchain;
    use crate::processing::{EngineError, MockProcessingClient};
    use std::collections::HashSet;
    use uuid::Uuid;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "merchant@example.com".into(),
            processing_owner_id: Some(Uuid::new_v4()),
            rate_source: "binance".into(),
        }
    }

    fn btc() -> Currency {
        Currency {
            id: "BTC".into(),
            code: "BTC".into(),
            blockchain: Blockchain::Bitcoin,
            contract_address: None,
            is_stablecoin: false,
            precision: 8,
        }
    }

    fn rule(mode: MultiWithdrawalMode, manual_address: Option<&str>) -> MultiWithdrawalRule {
        MultiWithdrawalRule {
            id: Uuid::new_v4(),
            withdrawal_wallet_id: Uuid::new_v4(),
            mode,
            manual_address: manual_address.map(str::to_string),
        }
    }

    fn approved() -> Vec<String> {
        vec!["cold-a".to_string(), "cold-b".to_string(), "cold-c".to_string()]
    }

    #[tokio::test]
    async fn test_manual_returns_approved_address() {
        let engine = Arc::new(MockProcessingClient::new());
        let resolver = RuleResolver::new(engine.clone());
        let destination = resolver
            .resolve_destination(
                &user(),
                &rule(MultiWithdrawalMode::Manual, Some("cold-b")),
                &btc(),
                &approved(),
            )
            .await
            .unwrap();
        assert_eq!(destination, "cold-b");
        assert_eq!(engine.processing_wallet_calls(), 0);
    }

    #[tokio::test]
    async fn test_manual_not_in_whitelist() {
        let resolver = RuleResolver::new(Arc::new(MockProcessingClient::new()));
        let err = resolver
            .resolve_destination(
                &user(),
                &rule(MultiWithdrawalMode::Manual, Some("cold-x")),
                &btc(),
                &approved(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, WithdrawalError::ManualAddressNotApproved("cold-x".into()));
    }

    #[tokio::test]
    async fn test_manual_unset() {
        let resolver = RuleResolver::new(Arc::new(MockProcessingClient::new()));
        let err = resolver
            .resolve_destination(
                &user(),
                &rule(MultiWithdrawalMode::Manual, None),
                &btc(),
                &approved(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, WithdrawalError::ManualAddressNotSet);
    }

    #[tokio::test]
    async fn test_processing_mode_queries_engine() {
        let engine = Arc::new(MockProcessingClient::new());
        engine.set_processing_wallet(Blockchain::Bitcoin, "1ProcessingWallet");
        let resolver = RuleResolver::new(engine.clone());

        let destination = resolver
            .resolve_destination(
                &user(),
                &rule(MultiWithdrawalMode::Processing, None),
                &btc(),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(destination, "1ProcessingWallet");
        assert_eq!(engine.processing_wallet_calls(), 1);
    }

    #[tokio::test]
    async fn test_processing_mode_propagates_engine_error() {
        let engine = Arc::new(MockProcessingClient::new());
        engine.set_processing_wallet_error(Some(EngineError::Unavailable("down".into())));
        let resolver = RuleResolver::new(engine);

        let err = resolver
            .resolve_destination(
                &user(),
                &rule(MultiWithdrawalMode::Processing, None),
                &btc(),
                &[],
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_random_with_empty_list_makes_no_engine_call() {
        let engine = Arc::new(MockProcessingClient::new());
        let resolver = RuleResolver::new(engine.clone());
        let err = resolver
            .resolve_destination(&user(), &rule(MultiWithdrawalMode::Random, None), &btc(), &[])
            .await
            .unwrap_err();
        assert_eq!(err, WithdrawalError::EmptyApprovedAddresses);
        assert_eq!(engine.processing_wallet_calls(), 0);
        assert_eq!(engine.withdrawal_count(), 0);
    }

    #[tokio::test]
    async fn test_random_stays_within_approved() {
        let resolver = RuleResolver::new(Arc::new(MockProcessingClient::new()));
        let approved = approved();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let destination = resolver
                .resolve_destination(
                    &user(),
                    &rule(MultiWithdrawalMode::Random, None),
                    &btc(),
                    &approved,
                )
                .await
                .unwrap();
            assert!(approved.contains(&destination));
            seen.insert(destination);
        }
        assert_eq!(seen.len(), approved.len());
    }

    #[test]
    fn test_validate_rule() {
        let approved = approved();
        assert!(validate_rule(MultiWithdrawalMode::Manual, Some("cold-a"), &approved).is_ok());
        assert_eq!(
            validate_rule(MultiWithdrawalMode::Manual, Some(""), &approved),
            Err(WithdrawalError::ManualAddressNotSet)
        );
        assert_eq!(
            validate_rule(MultiWithdrawalMode::Manual, Some("cold-z"), &approved),
            Err(WithdrawalError::ManualAddressNotApproved("cold-z".into()))
        );
        assert!(validate_rule(MultiWithdrawalMode::Random, None, &[]).is_ok());
    }

    #[test]
    fn test_unknown_mode() {
        assert_eq!(
            parse_mode("round_robin"),
            Err(WithdrawalError::UnknownRuleMode("round_robin".into()))
        );
        assert_eq!(parse_mode("manual"), Ok(MultiWithdrawalMode::Manual));
    }
}
