//! # Database management and control.
//!
//! This module defines the interface contracts of the payment engine's
//! *backends* and external collaborators.
//!
//! * [`PaymentGatewayDatabase`] is the highest-level behaviour a storage
//!   backend must expose: invoice/intent lifecycle, transfer ingress with the
//!   credit rule, the transactional outbox and its claim protocol, and the
//!   supporting idempotency/lease bookkeeping.
//! * [`ChainProvider`] is the read interface onto the upstream blockchain
//!   provider (the chain tip, used by confirmation tracking).
//! * [`TokenPricer`] converts fiat amounts into atomic token targets.
//! * [`AddressAllocator`] hands out deposit addresses for new intents.
mod allocator;
mod chain_provider;
mod data_objects;
mod payment_gateway_database;
mod pricing;

pub use allocator::{AddressAllocator, AllocatorError};
pub use chain_provider::{ChainProvider, ChainProviderError};
pub use data_objects::{
    CancellationResult,
    ConfirmationContext,
    ConfirmationResult,
    ExpirySweepResult,
    IngressOutcome,
    IntentCreated,
};
pub use payment_gateway_database::{PaymentGatewayDatabase, PaymentGatewayError};
pub use pricing::{PricingError, TokenPricer, UsdParityPricer};
