//! Payment gateway seam.

use serde::{Deserialize, Serialize};

use crate::pricing::Money;

/// A created charge: where to send the passenger to complete it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeHandle {
    pub reference: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Transport(String),
    #[error("gateway rejected the charge: {0}")]
    Rejected(String),
    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

pub trait PaymentGateway: Send + Sync {
    /// Creates a charge for `amount`. `reference` is stable per ride, so
    /// repeating the call for the same ride must not charge twice.
    fn create_charge(&self, amount: Money, reference: &str) -> Result<ChargeHandle, GatewayError>;
}

#[cfg(feature = "gateway-http")]
pub mod http {
    use std::time::Duration;

    use reqwest::blocking::Client;
    use serde::{Deserialize, Serialize};

    use super::{ChargeHandle, GatewayError, PaymentGateway};
    use crate::pricing::Money;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Serialize)]
    struct ChargeRequest<'a> {
        amount: Money,
        reference: &'a str,
    }

    #[derive(Deserialize)]
    struct ChargeResponse {
        redirect_url: String,
    }

    /// `POST {endpoint}/charges` with the reference doubling as the
    /// idempotency key.
    #[derive(Debug, Clone)]
    pub struct HttpPaymentGateway {
        client: Client,
        endpoint: String,
    }

    impl HttpPaymentGateway {
        pub fn new(endpoint: &str) -> Result<Self, GatewayError> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|err| GatewayError::Transport(err.to_string()))?;
            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
            })
        }
    }

    impl PaymentGateway for HttpPaymentGateway {
        fn create_charge(
            &self,
            amount: Money,
            reference: &str,
        ) -> Result<ChargeHandle, GatewayError> {
            let response = self
                .client
                .post(format!("{}/charges", self.endpoint))
                .header("Idempotency-Key", reference)
                .json(&ChargeRequest { amount, reference })
                .send()
                .map_err(|err| GatewayError::Transport(err.to_string()))?;
            let status = response.status();
            if status.is_server_error() {
                return Err(GatewayError::Transport(format!("HTTP {status}")));
            }
            if !status.is_success() {
                return Err(GatewayError::Rejected(format!("HTTP {status}")));
            }
            let body: ChargeResponse = response
                .json()
                .map_err(|err| GatewayError::Malformed(err.to_string()))?;
            Ok(ChargeHandle {
                reference: reference.to_string(),
                redirect_url: body.redirect_url,
            })
        }
    }
}
