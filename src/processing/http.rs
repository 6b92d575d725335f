//! JSON-over-HTTP processing engine adapter

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    CreateHotWalletRequest, EngineError, FundsWithdrawalReceipt, FundsWithdrawalRequest,
    OwnerResources, ProcessingClient,
};
use crate::core_types::{Blockchain, OwnerId};

/// Error body returned by the engine on non-2xx responses
#[derive(Deserialize)]
struct ErrorBody {
    code: u32,
    message: String,
}

#[derive(Deserialize)]
struct AddressBody {
    address: String,
}

#[derive(Serialize)]
struct DirtyWalletBody<'a> {
    blockchain: Blockchain,
    address: &'a str,
}

#[derive(Serialize)]
struct ColdWalletsBody<'a> {
    blockchain: Blockchain,
    addresses: &'a [String],
    totp: &'a str,
}

pub struct HttpProcessingClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProcessingClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, EngineError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        debug!(path, "Processing engine POST");
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    async fn post_empty<B>(&self, path: &str, body: &B) -> Result<(), EngineError>
    where
        B: Serialize + ?Sized,
    {
        debug!(path, "Processing engine POST");
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, EngineError> {
        debug!(path, "Processing engine GET");
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }
}

fn transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::DeadlineExceeded
    } else {
        EngineError::Unavailable(e.to_string())
    }
}

/// Map a non-2xx HTTP response to an engine error
fn status_error(http_status: u16, body: &str) -> EngineError {
    match http_status {
        502 | 503 => EngineError::Unavailable(format!("HTTP {}", http_status)),
        504 => EngineError::DeadlineExceeded,
        _ => match serde_json::from_str::<ErrorBody>(body) {
            Ok(err) => EngineError::Status {
                code: err.code,
                message: err.message,
            },
            Err(_) => EngineError::Status {
                code: u32::from(http_status),
                message: body.to_string(),
            },
        },
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.map_err(transport_error)?;
    Err(status_error(status.as_u16(), &body))
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, EngineError> {
    let body = check_status(response).await?.text().await.map_err(|e| {
        warn!(error = %e, "Failed to read processing engine response");
        EngineError::DeadlineExceeded
    })?;
    parse_accepted(&body)
}

/// Body of a 2xx response. The engine took the call, so an unreadable reply
/// leaves the outcome unknown rather than failed.
fn parse_accepted<R: DeserializeOwned>(body: &str) -> Result<R, EngineError> {
    serde_json::from_str(body).map_err(|e| {
        warn!(error = %e, "Failed to parse processing engine response");
        EngineError::DeadlineExceeded
    })
}

#[async_trait]
impl ProcessingClient for HttpProcessingClient {
    async fn funds_withdrawal(
        &self,
        request: FundsWithdrawalRequest,
    ) -> Result<FundsWithdrawalReceipt, EngineError> {
        self.post("withdrawals", &request).await
    }

    async fn get_owner_processing_wallet(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
    ) -> Result<String, EngineError> {
        let body: AddressBody = self
            .get(&format!("owners/{}/{}/processing-wallet", owner_id, blockchain))
            .await?;
        Ok(body.address)
    }

    async fn create_owner_hot_wallet(
        &self,
        request: CreateHotWalletRequest,
    ) -> Result<String, EngineError> {
        let body: AddressBody = self
            .post(&format!("owners/{}/hot-wallets", request.owner_id), &request)
            .await?;
        Ok(body.address)
    }

    async fn mark_dirty_hot_wallet(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
        address: &str,
    ) -> Result<(), EngineError> {
        self.post_empty(
            &format!("owners/{}/hot-wallets/dirty", owner_id),
            &DirtyWalletBody {
                blockchain,
                address,
            },
        )
        .await
    }

    async fn attach_owner_cold_wallets(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
        addresses: &[String],
        totp: &str,
    ) -> Result<(), EngineError> {
        self.post_empty(
            &format!("owners/{}/cold-wallets", owner_id),
            &ColdWalletsBody {
                blockchain,
                addresses,
                totp,
            },
        )
        .await
    }

    async fn get_owner_resources(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
    ) -> Result<OwnerResources, EngineError> {
        self.get(&format!("owners/{}/{}/resources", owner_id, blockchain))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{Outcome, codes};

    #[test]
    fn test_gateway_statuses() {
        assert!(matches!(status_error(503, ""), EngineError::Unavailable(_)));
        assert!(matches!(status_error(502, ""), EngineError::Unavailable(_)));
        assert_eq!(status_error(504, ""), EngineError::DeadlineExceeded);
    }

    #[test]
    fn test_error_body_is_decoded() {
        let err = status_error(409, r#"{"code":3002,"message":"address taken"}"#);
        assert_eq!(err, EngineError::status(codes::ADDRESS_TAKEN, "address taken"));
    }

    #[test]
    fn test_unparseable_body_keeps_http_status() {
        let err = status_error(400, "bad request");
        assert_eq!(err, EngineError::status(400, "bad request"));
    }

    #[test]
    fn test_accepted_response_is_decoded() {
        let receipt: FundsWithdrawalReceipt = parse_accepted(r#"{"tx_hash":"0xabc"}"#).unwrap();
        assert_eq!(receipt.tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(receipt.message, None);
    }

    #[test]
    fn test_unreadable_accepted_response_is_ambiguous() {
        let err = parse_accepted::<FundsWithdrawalReceipt>("<html>proxy</html>").unwrap_err();
        assert_eq!(err, EngineError::DeadlineExceeded);
        assert!(Outcome::classify(Err(err)).is_retry());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client =
            HttpProcessingClient::new("http://engine:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("withdrawals"), "http://engine:8080/v1/withdrawals");
    }
}
