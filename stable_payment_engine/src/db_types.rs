use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use spg_common::{AtomicAmount, FiatCents};
use sqlx::{FromRow, Type};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
#[error("Invalid value: {0}")]
pub struct ConversionError(pub String);

//--------------------------------------        Chain        ---------------------------------------------------------

/// A lightweight wrapper around a chain identifier, e.g. "arbitrum".
/// Normalised to lowercase at every boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct Chain(String);

impl<'de> Deserialize<'de> for Chain {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Chain::from)
    }
}

impl Chain {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for Chain {
    fn from(value: S) -> Self {
        Self(value.into().to_lowercase())
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--------------------------------------        Token        ---------------------------------------------------------

/// A stablecoin code, e.g. "USDT". The set of accepted tokens is configuration.
/// Normalised to uppercase at every boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct Token(String);

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Token::from)
    }
}

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(value: S) -> Self {
        Self(value.into().to_uppercase())
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--------------------------------------       Address       ---------------------------------------------------------

/// An EVM address in lowercase hex. Normalising the case at the boundary lets
/// the database compare addresses byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct Address(String);

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Address::from)
    }
}

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for Address {
    fn from(value: S) -> Self {
        Self(value.into().to_lowercase())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--------------------------------------      InvoiceId      ---------------------------------------------------------

/// The opaque, externally visible invoice identifier (a UUID string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct InvoiceId(pub String);

impl InvoiceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for InvoiceId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for InvoiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for InvoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--------------------------------------      IntentId       ---------------------------------------------------------

/// The opaque, externally visible payment-intent identifier (a UUID string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct IntentId(pub String);

impl IntentId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IntentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--------------------------------------    InvoiceStatus    ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum InvoiceStatus {
    /// The invoice has been created and no qualifying funds have been received.
    Pending,
    /// Some funds have arrived, but less than the target amount. Still payable.
    Underpaid,
    /// The target amount has been received, confirmations are still accumulating.
    Paid,
    /// Every funding transfer has cleared the confirmation threshold. Terminal.
    Confirmed,
    /// The expiry instant passed before the invoice was paid. Terminal.
    Expired,
    /// An administrator cancelled the invoice. Terminal.
    Cancelled,
}

impl InvoiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Confirmed | InvoiceStatus::Expired | InvoiceStatus::Cancelled)
    }

    /// The wire form used in merchant callbacks and API responses.
    pub fn callback_code(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Underpaid => "UNDERPAID",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Confirmed => "CONFIRMED",
            InvoiceStatus::Expired => "EXPIRED",
            InvoiceStatus::Cancelled => "CANCELLED",
        }
    }
}

impl Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvoiceStatus::Pending => write!(f, "Pending"),
            InvoiceStatus::Underpaid => write!(f, "Underpaid"),
            InvoiceStatus::Paid => write!(f, "Paid"),
            InvoiceStatus::Confirmed => write!(f, "Confirmed"),
            InvoiceStatus::Expired => write!(f, "Expired"),
            InvoiceStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Underpaid" => Ok(Self::Underpaid),
            "Paid" => Ok(Self::Paid),
            "Confirmed" => Ok(Self::Confirmed),
            "Expired" => Ok(Self::Expired),
            "Cancelled" => Ok(Self::Cancelled),
            s => Err(ConversionError(format!("Invalid invoice status: {s}"))),
        }
    }
}

impl From<String> for InvoiceStatus {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|_| {
            error!("Invalid invoice status: {value}. But this conversion cannot fail. Defaulting to Pending");
            InvoiceStatus::Pending
        })
    }
}

//--------------------------------------    IntentStatus     ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum IntentStatus {
    /// The intent has been created and no funds have arrived at its deposit address.
    AwaitingFunds,
    /// Credited funds cover part of the target amount.
    PartiallyFunded,
    /// Credited funds exactly match the target amount.
    Funded,
    /// Credited funds exceed the target amount.
    Overfunded,
    /// Every funding transfer has cleared the confirmation threshold. Terminal.
    Confirmed,
    /// The owning invoice expired. Terminal.
    Expired,
    /// The owning invoice was cancelled. Terminal.
    Cancelled,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentStatus::Confirmed | IntentStatus::Expired | IntentStatus::Cancelled)
    }
}

impl Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentStatus::AwaitingFunds => write!(f, "AwaitingFunds"),
            IntentStatus::PartiallyFunded => write!(f, "PartiallyFunded"),
            IntentStatus::Funded => write!(f, "Funded"),
            IntentStatus::Overfunded => write!(f, "Overfunded"),
            IntentStatus::Confirmed => write!(f, "Confirmed"),
            IntentStatus::Expired => write!(f, "Expired"),
            IntentStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl FromStr for IntentStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AwaitingFunds" => Ok(Self::AwaitingFunds),
            "PartiallyFunded" => Ok(Self::PartiallyFunded),
            "Funded" => Ok(Self::Funded),
            "Overfunded" => Ok(Self::Overfunded),
            "Confirmed" => Ok(Self::Confirmed),
            "Expired" => Ok(Self::Expired),
            "Cancelled" => Ok(Self::Cancelled),
            s => Err(ConversionError(format!("Invalid intent status: {s}"))),
        }
    }
}

//--------------------------------------      Merchant       ---------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct Merchant {
    pub id: i64,
    pub merchant_id: String,
    pub api_key_hash: String,
    pub callback_secret: String,
    pub suppress_info_callbacks: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMerchant {
    /// SHA-256 hex of the merchant's API key. The key itself is never stored.
    pub api_key_hash: String,
    /// Shared secret used to sign callbacks to this merchant.
    pub callback_secret: String,
    pub suppress_info_callbacks: bool,
}

//--------------------------------------   PaymentOption     ---------------------------------------------------------

/// A (token, chain) pair the buyer is allowed to pay with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, FromRow, Serialize, Deserialize)]
pub struct PaymentOption {
    pub token: Token,
    pub chain: Chain,
}

//--------------------------------------       Invoice       ---------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct Invoice {
    pub id: i64,
    pub invoice_id: InvoiceId,
    pub merchant_id: i64,
    pub merchant_order_id: String,
    pub fiat_amount: FiatCents,
    pub currency: String,
    pub callback_url: String,
    pub status: InvoiceStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub merchant_id: i64,
    /// The merchant's own order reference. Unique per merchant.
    pub merchant_order_id: String,
    pub fiat_amount: FiatCents,
    pub currency: String,
    pub callback_url: String,
    pub allowed_options: Vec<PaymentOption>,
    pub expires_at: DateTime<Utc>,
}

//--------------------------------------    PaymentIntent    ---------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct PaymentIntent {
    pub id: i64,
    pub intent_id: IntentId,
    pub invoice_id: i64,
    pub token: Token,
    pub chain: Chain,
    pub deposit_address: Address,
    pub target_amount: AtomicAmount,
    pub credited_amount: AtomicAmount,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentIntent {
    pub invoice_id: i64,
    pub token: Token,
    pub chain: Chain,
    pub deposit_address: Address,
    pub target_amount: AtomicAmount,
}

//--------------------------------------      Transfer       ---------------------------------------------------------

/// An observed on-chain credit towards a deposit address. Append-only.
#[derive(Debug, Clone, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub chain: Chain,
    pub tx_hash: String,
    pub log_index: i64,
    pub token: Token,
    pub to_address: Address,
    pub amount: AtomicAmount,
    pub block_number: i64,
    pub provider_event_id: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// The normalized ingress event shape pushed by the provider webhook (or a poller).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub chain: Chain,
    pub tx_hash: String,
    pub log_index: i64,
    pub token: Token,
    pub to: Address,
    pub amount: AtomicAmount,
    pub block_number: i64,
    #[serde(default)]
    pub provider_event_id: Option<String>,
}

//--------------------------------------     IntentFund      ---------------------------------------------------------

/// Immutable link from a transfer to the intent it was credited to.
#[derive(Debug, Clone, FromRow)]
pub struct IntentFund {
    pub id: i64,
    pub intent_id: i64,
    pub transfer_id: i64,
    pub credited: AtomicAmount,
    pub created_at: DateTime<Utc>,
}

//--------------------------------------     OutboxKind      ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum OutboxKind {
    /// The invoice changed status; deliver a signed callback to the merchant.
    InvoiceStatusChanged,
    /// The invoice is paid; poll the chain until every funding transfer clears the threshold.
    PaidAwaitingConfirmation,
    /// Funds above the target arrived. Informational.
    Overpayment,
    /// Funds arrived after the invoice reached a terminal state. Informational.
    LateFunds,
    /// A confirmed transfer dropped below the threshold after the merchant was notified. Informational.
    ChargebackSuspected,
    /// A partial payment was still present when the invoice expired. Informational.
    ExpiredWithPartial,
}

impl OutboxKind {
    /// Informational kinds can be suppressed per merchant; state-change callbacks cannot.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            OutboxKind::Overpayment
                | OutboxKind::LateFunds
                | OutboxKind::ChargebackSuspected
                | OutboxKind::ExpiredWithPartial
        )
    }
}

impl Display for OutboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxKind::InvoiceStatusChanged => write!(f, "InvoiceStatusChanged"),
            OutboxKind::PaidAwaitingConfirmation => write!(f, "PaidAwaitingConfirmation"),
            OutboxKind::Overpayment => write!(f, "Overpayment"),
            OutboxKind::LateFunds => write!(f, "LateFunds"),
            OutboxKind::ChargebackSuspected => write!(f, "ChargebackSuspected"),
            OutboxKind::ExpiredWithPartial => write!(f, "ExpiredWithPartial"),
        }
    }
}

impl FromStr for OutboxKind {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InvoiceStatusChanged" => Ok(Self::InvoiceStatusChanged),
            "PaidAwaitingConfirmation" => Ok(Self::PaidAwaitingConfirmation),
            "Overpayment" => Ok(Self::Overpayment),
            "LateFunds" => Ok(Self::LateFunds),
            "ChargebackSuspected" => Ok(Self::ChargebackSuspected),
            "ExpiredWithPartial" => Ok(Self::ExpiredWithPartial),
            s => Err(ConversionError(format!("Invalid outbox kind: {s}"))),
        }
    }
}

//--------------------------------------    OutboxStatus     ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Done,
    Dead,
}

impl Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxStatus::Pending => write!(f, "Pending"),
            OutboxStatus::InFlight => write!(f, "InFlight"),
            OutboxStatus::Done => write!(f, "Done"),
            OutboxStatus::Dead => write!(f, "Dead"),
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "InFlight" => Ok(Self::InFlight),
            "Done" => Ok(Self::Done),
            "Dead" => Ok(Self::Dead),
            s => Err(ConversionError(format!("Invalid outbox status: {s}"))),
        }
    }
}

//--------------------------------------    OutboxRecord     ---------------------------------------------------------

/// A pending side effect, co-committed with the state change that produced it.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    /// Stable across every delivery attempt; sent as the Idempotency-Key header.
    pub delivery_id: String,
    pub invoice_id: i64,
    pub kind: OutboxKind,
    pub payload: String,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub claim_token: Option<String>,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub delivery_id: String,
    pub invoice_id: i64,
    pub kind: OutboxKind,
    pub payload: serde_json::Value,
    pub next_attempt_at: DateTime<Utc>,
}

impl NewOutboxRecord {
    pub fn new(invoice_id: i64, kind: OutboxKind, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self { delivery_id: Uuid::new_v4().to_string(), invoice_id, kind, payload, next_attempt_at: now }
    }
}

//--------------------------------------  CallbackPayload    ---------------------------------------------------------

/// The body POSTed to the merchant's callback URL. `delivery_id` is filled in
/// by the dispatcher from the outbox row so every retry carries the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    pub invoice_id: InvoiceId,
    pub merchant_order_id: String,
    pub status: String,
    pub paid_amount_atomic: AtomicAmount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<Chain>,
    pub tx_hashes: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

//-------------------------------------- IdempotencyRecord   ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type)]
pub enum IdempotencyScope {
    CreateInvoice,
    ProviderWebhook,
    CallbackDelivery,
}

impl Display for IdempotencyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdempotencyScope::CreateInvoice => write!(f, "CreateInvoice"),
            IdempotencyScope::ProviderWebhook => write!(f, "ProviderWebhook"),
            IdempotencyScope::CallbackDelivery => write!(f, "CallbackDelivery"),
        }
    }
}

impl FromStr for IdempotencyScope {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CreateInvoice" => Ok(Self::CreateInvoice),
            "ProviderWebhook" => Ok(Self::ProviderWebhook),
            "CallbackDelivery" => Ok(Self::CallbackDelivery),
            s => Err(ConversionError(format!("Invalid idempotency scope: {s}"))),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyRecord {
    pub scope: IdempotencyScope,
    pub key: String,
    pub fingerprint: String,
    pub response_status: i64,
    pub response_body: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
