//! Request handler definitions
//!
//! Define each route and its handler here. Handlers that are more than a
//! line or two MUST go into a separate function. Keep this module neat and
//! tidy 🙏
//!
//! Any long, non-cpu-bound operation (I/O, database calls, the payment flow)
//! is expressed as an async function so worker threads keep serving other
//! requests while it is in flight.
use actix_web::{get, http::StatusCode, post, web, HttpRequest, HttpResponse, Responder};
use chrono::{Duration, Utc};
use log::*;
use spg_common::FiatCents;
use stable_payment_engine::{
    db_types::{
        IdempotencyRecord,
        IdempotencyScope,
        InvoiceId,
        Merchant,
        NewInvoice,
        PaymentOption,
        TransferEvent,
    },
    helpers::IDEMPOTENCY_KEY_HEADER,
    traits::{CancellationResult, UsdParityPricer},
    InvoiceFlowApi,
    PaymentGatewayDatabase,
    PaymentGatewayError,
    SqliteDatabase,
};

use crate::{
    config::ServerConfig,
    data_objects::{
        IntentResponse,
        InvoiceCreatedResponse,
        InvoiceView,
        JsonResponse,
        NewIntentRequest,
        NewInvoiceRequest,
        StatusResponse,
    },
    errors::ServerError,
    helpers::{sha256_hex, verify_webhook_signature},
};

pub const API_KEY_HEADER: &str = "X-Api-Key";

// ----------------------------------------------   Health  ----------------------------------------------------

#[get("/health")]
pub async fn health() -> impl Responder {
    trace!("💻️ Received health check request");
    HttpResponse::Ok().body("👍️\n")
}

// ----------------------------------------------  Invoices ----------------------------------------------------

/// `POST /api/invoices`
///
/// Creates an invoice for the authenticated merchant. The `Idempotency-Key`
/// header is required: replaying the same key with the same body returns the
/// original response byte-for-byte; the same key with a different body is a
/// conflict.
#[post("/invoices")]
pub async fn create_invoice(
    req: HttpRequest,
    body: web::Bytes,
    api: web::Data<InvoiceFlowApi<SqliteDatabase>>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, ServerError> {
    let merchant = authenticate_merchant(&req, &api).await?;
    let idempotency_key = req
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(ServerError::MissingIdempotencyKey)?;
    // Keys are scoped per merchant so tenants cannot collide with each other.
    let scoped_key = format!("{}:{idempotency_key}", merchant.id);
    let fingerprint = sha256_hex(&body);
    if let Some(record) =
        api.db().fetch_idempotency_record(IdempotencyScope::CreateInvoice, &scoped_key).await?
    {
        if record.fingerprint == fingerprint {
            debug!("💻️ Replaying stored response for idempotency key {scoped_key}");
            return Ok(replay_response(&record));
        }
        return Err(ServerError::IdempotencyKeyReuse);
    }

    let request: NewInvoiceRequest = serde_json::from_slice(&body)
        .map_err(|e| ServerError::InvalidRequestBody(e.to_string()))?;
    let expiry_seconds =
        request.expiry_seconds.unwrap_or(config.invoice.default_expiry.as_secs() as i64);
    let invoice = api
        .create_invoice(NewInvoice {
            merchant_id: merchant.id,
            merchant_order_id: request.merchant_order_id,
            fiat_amount: FiatCents::from(request.fiat_amount),
            currency: request.currency,
            callback_url: request.callback_url,
            allowed_options: request.allowed_options,
            expires_at: Utc::now() + Duration::seconds(expiry_seconds),
        })
        .await?;

    let response = InvoiceCreatedResponse::new(&invoice, &config.public_base_url);
    let response_body =
        serde_json::to_string(&response).map_err(|e| ServerError::Unspecified(e.to_string()))?;
    let stored = api
        .db()
        .store_idempotency_record(IdempotencyRecord {
            scope: IdempotencyScope::CreateInvoice,
            key: scoped_key.clone(),
            fingerprint,
            response_status: StatusCode::CREATED.as_u16() as i64,
            response_body: response_body.clone(),
            expires_at: Utc::now() + Duration::hours(config.invoice.idempotency_ttl_hours),
            created_at: Utc::now(),
        })
        .await?;
    if !stored {
        // A concurrent request with the same key beat us to the store; honour
        // the first writer so both callers see identical bytes.
        if let Some(record) =
            api.db().fetch_idempotency_record(IdempotencyScope::CreateInvoice, &scoped_key).await?
        {
            return Ok(replay_response(&record));
        }
    }
    Ok(HttpResponse::Created().content_type("application/json").body(response_body))
}

/// `GET /api/invoices/{id}`
#[get("/invoices/{id}")]
pub async fn get_invoice(
    req: HttpRequest,
    path: web::Path<String>,
    api: web::Data<InvoiceFlowApi<SqliteDatabase>>,
) -> Result<HttpResponse, ServerError> {
    let merchant = authenticate_merchant(&req, &api).await?;
    let invoice = fetch_owned_invoice(&api, &merchant, &path).await?;
    let options = api.invoice_options(&invoice).await?;
    let intents = api.invoice_intents(&invoice).await?;
    Ok(HttpResponse::Ok().json(InvoiceView::new(&invoice, options, intents)))
}

/// `GET /api/invoices/{id}/status` — lightweight poll.
#[get("/invoices/{id}/status")]
pub async fn invoice_status(
    req: HttpRequest,
    path: web::Path<String>,
    api: web::Data<InvoiceFlowApi<SqliteDatabase>>,
) -> Result<HttpResponse, ServerError> {
    let merchant = authenticate_merchant(&req, &api).await?;
    let invoice = fetch_owned_invoice(&api, &merchant, &path).await?;
    Ok(HttpResponse::Ok().json(StatusResponse {
        invoice_id: invoice.invoice_id.clone(),
        status: invoice.status.callback_code().to_string(),
    }))
}

/// `POST /api/invoices/{id}/intents`
///
/// The buyer picked a (token, chain) option; allocate a deposit address and
/// quote the atomic amount. Requesting the same option again returns the
/// existing intent.
#[post("/invoices/{id}/intents")]
pub async fn create_intent(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<NewIntentRequest>,
    api: web::Data<InvoiceFlowApi<SqliteDatabase>>,
    pricer: web::Data<UsdParityPricer>,
) -> Result<HttpResponse, ServerError> {
    let merchant = authenticate_merchant(&req, &api).await?;
    let invoice = fetch_owned_invoice(&api, &merchant, &path).await?;
    let request = body.into_inner();
    let option = PaymentOption { token: request.token, chain: request.chain };
    let (invoice, created) = api.create_intent(&invoice.invoice_id, option, pricer.as_ref()).await?;
    let response = IntentResponse::new(&created.intent, &invoice);
    if created.existing {
        Ok(HttpResponse::Ok().json(response))
    } else {
        Ok(HttpResponse::Created().json(response))
    }
}

/// `POST /api/invoices/{id}/cancel` — administrative cancel. No-op on
/// terminal invoices; a paid invoice cannot be cancelled.
#[post("/invoices/{id}/cancel")]
pub async fn cancel_invoice(
    req: HttpRequest,
    path: web::Path<String>,
    api: web::Data<InvoiceFlowApi<SqliteDatabase>>,
) -> Result<HttpResponse, ServerError> {
    let merchant = authenticate_merchant(&req, &api).await?;
    let invoice = fetch_owned_invoice(&api, &merchant, &path).await?;
    let result = api.cancel_invoice(&invoice.invoice_id).await?;
    let invoice = match result {
        CancellationResult::Cancelled(invoice) => invoice,
        CancellationResult::AlreadyTerminal(invoice) => invoice,
    };
    Ok(HttpResponse::Ok().json(StatusResponse {
        invoice_id: invoice.invoice_id.clone(),
        status: invoice.status.callback_code().to_string(),
    }))
}

// ----------------------------------------------  Webhook  ----------------------------------------------------

/// `POST /webhooks/provider`
///
/// Ingests a normalized transfer event from the blockchain provider. The
/// envelope is authenticated with the shared webhook secret using the same
/// HMAC scheme as outbound callbacks. Success means the event is durably
/// recorded; replays of the same `(chain, txHash, logIndex)` are a 200 no-op
/// so the provider stops retrying.
#[post("/provider")]
pub async fn provider_webhook(
    req: HttpRequest,
    body: web::Bytes,
    api: web::Data<InvoiceFlowApi<SqliteDatabase>>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, ServerError> {
    verify_webhook_signature(&req, &body, config.provider.webhook_secret.reveal(), Utc::now().timestamp())?;
    let event: TransferEvent =
        serde_json::from_slice(&body).map_err(|e| ServerError::InvalidRequestBody(e.to_string()))?;
    trace!("💻️ Provider event {} for {}#{}", event.provider_event_id.as_deref().unwrap_or("-"), event.tx_hash, event.log_index);
    match api.process_transfer_event(event).await {
        Ok(_) => Ok(HttpResponse::Ok().json(JsonResponse::success("Event recorded"))),
        Err(e @ PaymentGatewayError::Validation(_)) => Err(ServerError::BackendError(e)),
        Err(e) => {
            // Transient or invariant failure: signal the provider to retry
            // (the event was not durably recorded).
            warn!("💻️ Could not ingest provider event: {e}");
            Err(ServerError::BackendError(e))
        },
    }
}

// ----------------------------------------------  Support  ----------------------------------------------------

async fn authenticate_merchant(
    req: &HttpRequest,
    api: &InvoiceFlowApi<SqliteDatabase>,
) -> Result<Merchant, ServerError> {
    let api_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(ServerError::Unauthorized)?;
    let hash = sha256_hex(api_key.as_bytes());
    api.db().fetch_merchant_by_api_key_hash(&hash).await?.ok_or(ServerError::Unauthorized)
}

/// Fetch an invoice by its external id, hiding other tenants' invoices
/// behind a 404.
async fn fetch_owned_invoice(
    api: &InvoiceFlowApi<SqliteDatabase>,
    merchant: &Merchant,
    invoice_id: &str,
) -> Result<stable_payment_engine::db_types::Invoice, ServerError> {
    let id = InvoiceId::from(invoice_id.to_string());
    let invoice = api.fetch_invoice(&id).await?.ok_or(ServerError::NotFound)?;
    if invoice.merchant_id != merchant.id {
        return Err(ServerError::NotFound);
    }
    Ok(invoice)
}

fn replay_response(record: &IdempotencyRecord) -> HttpResponse {
    let status = StatusCode::from_u16(record.response_status as u16).unwrap_or(StatusCode::OK);
    HttpResponse::build(status).content_type("application/json").body(record.response_body.clone())
}
