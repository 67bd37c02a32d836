use thiserror::Error;

use crate::db_types::{Address, Chain};

#[derive(Debug, Clone, Error)]
pub enum AllocatorError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("No free deposit address is available on chain {0}")]
    Exhausted(String),
}

/// The deposit-address allocator. External collaborator; only this interface
/// is part of the core. The SQLite backend implements it against an
/// administratively seeded address pool, handing out addresses that no live
/// intent currently holds.
#[allow(async_fn_in_trait)]
pub trait AddressAllocator: Clone {
    /// Reserve a deposit address on `chain` for a new intent.
    async fn allocate_address(&self, chain: &Chain) -> Result<Address, AllocatorError>;

    /// Add addresses to the pool. Existing entries are left untouched.
    async fn seed_addresses(&self, chain: &Chain, addresses: &[Address]) -> Result<u64, AllocatorError>;
}
