mod amount;

pub mod op;
mod secret;

pub use amount::{AtomicAmount, AtomicAmountConversionError, FiatCents, USD_CURRENCY_CODE};
pub use secret::Secret;
