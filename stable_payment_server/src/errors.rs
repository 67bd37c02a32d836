use actix_web::{
    error::ResponseError,
    http::{header::ContentType, StatusCode},
    HttpResponse,
};
use log::error;
use serde_json::json;
use stable_payment_engine::PaymentGatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Could not read request body: {0}")]
    InvalidRequestBody(String),
    #[error("The Idempotency-Key header is required for this endpoint")]
    MissingIdempotencyKey,
    #[error("This Idempotency-Key was already used with a different request body")]
    IdempotencyKeyReuse,
    #[error("Missing or invalid API key")]
    Unauthorized,
    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,
    #[error("Resource not found")]
    NotFound,
    #[error("Payment engine error: {0}")]
    BackendError(#[from] PaymentGatewayError),
    #[error("An I/O error happened in the server. {0}")]
    IOError(#[from] std::io::Error),
    #[error("Invalid server configuration. {0}")]
    ConfigurationError(String),
    #[error("Could not initialize the server. {0}")]
    InitializeError(String),
    #[error("UnspecifiedError. {0}")]
    Unspecified(String),
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequestBody(_) | Self::MissingIdempotencyKey => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidWebhookSignature => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::IdempotencyKeyReuse => StatusCode::CONFLICT,
            Self::BackendError(e) => match e {
                PaymentGatewayError::Validation(_) | PaymentGatewayError::OptionNotAllowed { .. } => {
                    StatusCode::BAD_REQUEST
                },
                PaymentGatewayError::InvoiceAlreadyExists(_)
                | PaymentGatewayError::InvoiceNotPayable(_)
                | PaymentGatewayError::InvoiceNotCancellable(_)
                | PaymentGatewayError::DepositAddressBusy(_) => StatusCode::CONFLICT,
                PaymentGatewayError::InvoiceNotFound(_)
                | PaymentGatewayError::InvoiceIdNotFound(_)
                | PaymentGatewayError::IntentNotFound
                | PaymentGatewayError::MerchantNotFound => StatusCode::NOT_FOUND,
                PaymentGatewayError::NoDepositAddressAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error bodies carry a stable shape and never leak internals; 5xx
    /// details go to the logs only.
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if status.is_server_error() {
            error!("💻️ Internal error serving request: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        HttpResponse::build(status)
            .insert_header(ContentType::json())
            .json(json!({ "error": message }))
    }
}
