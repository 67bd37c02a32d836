use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spg_common::{AtomicAmount, FiatCents};
use stable_payment_engine::db_types::{
    Address,
    Chain,
    IntentId,
    Invoice,
    InvoiceId,
    PaymentIntent,
    PaymentOption,
    Token,
};
use std::fmt::Display;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonResponse {
    pub success: bool,
    pub message: String,
}

impl JsonResponse {
    pub fn success<S: Display>(message: S) -> Self {
        Self { success: true, message: message.to_string() }
    }

    pub fn failure<S: Display>(message: S) -> Self {
        Self { success: false, message: message.to_string() }
    }
}

//--------------------------------------   Merchant API   -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInvoiceRequest {
    pub merchant_order_id: String,
    /// Integer cents. Floating point never appears in the money path.
    pub fiat_amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub allowed_options: Vec<PaymentOption>,
    pub callback_url: String,
    pub expiry_seconds: Option<i64>,
}

fn default_currency() -> String {
    spg_common::USD_CURRENCY_CODE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceCreatedResponse {
    pub invoice_id: InvoiceId,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub pay_url: String,
}

impl InvoiceCreatedResponse {
    pub fn new(invoice: &Invoice, public_base_url: &str) -> Self {
        Self {
            invoice_id: invoice.invoice_id.clone(),
            status: invoice.status.callback_code().to_string(),
            expires_at: invoice.expires_at,
            pay_url: format!("{}/pay/{}", public_base_url.trim_end_matches('/'), invoice.invoice_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceView {
    pub invoice_id: InvoiceId,
    pub merchant_order_id: String,
    pub status: String,
    pub fiat_amount: FiatCents,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub allowed_options: Vec<PaymentOption>,
    pub intents: Vec<IntentView>,
}

impl InvoiceView {
    pub fn new(invoice: &Invoice, options: Vec<PaymentOption>, intents: Vec<PaymentIntent>) -> Self {
        Self {
            invoice_id: invoice.invoice_id.clone(),
            merchant_order_id: invoice.merchant_order_id.clone(),
            status: invoice.status.callback_code().to_string(),
            fiat_amount: invoice.fiat_amount,
            currency: invoice.currency.clone(),
            expires_at: invoice.expires_at,
            created_at: invoice.created_at,
            allowed_options: options,
            intents: intents.iter().map(IntentView::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentView {
    pub intent_id: IntentId,
    pub token: Token,
    pub chain: Chain,
    pub deposit_address: Address,
    pub atomic_amount: AtomicAmount,
    pub credited_amount: AtomicAmount,
    pub status: String,
}

impl From<&PaymentIntent> for IntentView {
    fn from(intent: &PaymentIntent) -> Self {
        Self {
            intent_id: intent.intent_id.clone(),
            token: intent.token.clone(),
            chain: intent.chain.clone(),
            deposit_address: intent.deposit_address.clone(),
            atomic_amount: intent.target_amount,
            credited_amount: intent.credited_amount,
            status: intent.status.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIntentRequest {
    pub token: Token,
    pub chain: Chain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub intent_id: IntentId,
    pub deposit_address: Address,
    pub atomic_amount: AtomicAmount,
    pub token: Token,
    pub chain: Chain,
    pub expires_at: DateTime<Utc>,
}

impl IntentResponse {
    pub fn new(intent: &PaymentIntent, invoice: &Invoice) -> Self {
        Self {
            intent_id: intent.intent_id.clone(),
            deposit_address: intent.deposit_address.clone(),
            atomic_amount: intent.target_amount,
            token: intent.token.clone(),
            chain: intent.chain.clone(),
            expires_at: invoice.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub invoice_id: InvoiceId,
    pub status: String,
}
