use std::collections::HashMap;

use spg_common::{AtomicAmount, FiatCents};
use thiserror::Error;

use crate::db_types::{Chain, PaymentOption, Token};

#[derive(Debug, Clone, Error)]
pub enum PricingError {
    #[error("({token}, {chain}) is not in the configured stablecoin set")]
    UnknownOption { token: String, chain: String },
    #[error("Unsupported invoice currency: {0}")]
    UnsupportedCurrency(String),
}

/// The fiat → token pricing calculator. External collaborator; only this
/// interface is part of the core.
pub trait TokenPricer: Clone + Send + Sync {
    /// The atomic target amount a buyer must transfer to settle `fiat` using
    /// the given option.
    fn quote(&self, fiat: FiatCents, currency: &str, token: &Token, chain: &Chain)
        -> Result<AtomicAmount, PricingError>;

    /// The (token, chain) pairs this pricer can quote.
    fn supported_options(&self) -> Vec<PaymentOption>;
}

/// Prices USD-pegged stablecoins at parity: one dollar buys exactly one
/// token, so cents scale straight into atomic units by the token's decimals.
#[derive(Debug, Clone)]
pub struct UsdParityPricer {
    decimals: HashMap<PaymentOption, u32>,
}

impl UsdParityPricer {
    pub fn new(decimals: HashMap<PaymentOption, u32>) -> Self {
        Self { decimals }
    }

    /// USDT and USDC at 6 decimals on the given chain.
    pub fn usdt_usdc_on(chain: &Chain) -> Self {
        let mut decimals = HashMap::new();
        decimals.insert(PaymentOption { token: Token::from("USDT"), chain: chain.clone() }, 6);
        decimals.insert(PaymentOption { token: Token::from("USDC"), chain: chain.clone() }, 6);
        Self::new(decimals)
    }
}

impl TokenPricer for UsdParityPricer {
    fn quote(
        &self,
        fiat: FiatCents,
        currency: &str,
        token: &Token,
        chain: &Chain,
    ) -> Result<AtomicAmount, PricingError> {
        if currency != spg_common::USD_CURRENCY_CODE {
            return Err(PricingError::UnsupportedCurrency(currency.to_string()));
        }
        let option = PaymentOption { token: token.clone(), chain: chain.clone() };
        let decimals = self.decimals.get(&option).ok_or_else(|| PricingError::UnknownOption {
            token: token.to_string(),
            chain: chain.to_string(),
        })?;
        // cents * 10^decimals / 100, in integer arithmetic.
        let unit = 10i128.pow(*decimals);
        Ok(AtomicAmount::from(fiat.value() as i128 * unit / 100))
    }

    fn supported_options(&self) -> Vec<PaymentOption> {
        self.decimals.keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ten_dollars_is_ten_million_atomic_units_at_six_decimals() {
        let pricer = UsdParityPricer::usdt_usdc_on(&Chain::from("arbitrum"));
        let quote = pricer
            .quote(FiatCents::from(1000), "USD", &Token::from("USDT"), &Chain::from("arbitrum"))
            .unwrap();
        assert_eq!(quote, AtomicAmount::from(10_000_000i64));
    }

    #[test]
    fn unknown_options_and_currencies_are_rejected() {
        let pricer = UsdParityPricer::usdt_usdc_on(&Chain::from("arbitrum"));
        assert!(pricer.quote(FiatCents::from(1000), "USD", &Token::from("DAI"), &Chain::from("arbitrum")).is_err());
        assert!(pricer.quote(FiatCents::from(1000), "EUR", &Token::from("USDT"), &Chain::from("arbitrum")).is_err());
    }
}
