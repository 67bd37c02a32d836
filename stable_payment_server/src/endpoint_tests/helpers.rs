use spg_common::Secret;
use stable_payment_engine::{
    db_types::{Address, Chain, Merchant, NewMerchant},
    traits::AddressAllocator,
    PaymentGatewayDatabase,
    SqliteDatabase,
};

use crate::helpers::sha256_hex;

pub const TEST_API_KEY: &str = "sk_test_merchant_key";
pub const TEST_CALLBACK_SECRET: &str = "whsec_callback_secret";
pub const TEST_WEBHOOK_SECRET: &str = "whsec_provider_secret";
pub const TEST_CHAIN: &str = "arbitrum";
pub const TEST_ADDRESS: &str = "0xd000000000000000000000000000000000000001";

pub async fn setup() -> (SqliteDatabase, crate::config::ServerConfig, Merchant) {
    let _ = env_logger::try_init();
    let db = SqliteDatabase::new_with_url("sqlite::memory:", 1).await.expect("Error creating test database");
    db.run_migrations().await.expect("Error running migrations");
    let merchant = db
        .create_merchant(NewMerchant {
            api_key_hash: sha256_hex(TEST_API_KEY.as_bytes()),
            callback_secret: TEST_CALLBACK_SECRET.into(),
            suppress_info_callbacks: false,
        })
        .await
        .expect("Error creating test merchant");
    db.seed_addresses(&Chain::from(TEST_CHAIN), &[Address::from(TEST_ADDRESS)])
        .await
        .expect("Error seeding addresses");
    let mut config = crate::config::ServerConfig::default();
    config.provider.webhook_secret = Secret::new(TEST_WEBHOOK_SECRET.to_string());
    config.confirmations.insert(Chain::from(TEST_CHAIN), 6);
    (db, config, merchant)
}

/// Build the full service under test: real handlers, real store, real config.
macro_rules! test_app {
    ($db:expr, $config:expr) => {{
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data(actix_web::web::Data::new(stable_payment_engine::InvoiceFlowApi::new($db.clone())))
                .app_data(actix_web::web::Data::new(crate::server::pricer_for(&$config)))
                .app_data(actix_web::web::Data::new($config.clone()))
                .service(crate::routes::health)
                .service(
                    actix_web::web::scope("/api")
                        .service(crate::routes::create_invoice)
                        .service(crate::routes::get_invoice)
                        .service(crate::routes::invoice_status)
                        .service(crate::routes::create_intent)
                        .service(crate::routes::cancel_invoice),
                )
                .service(actix_web::web::scope("/webhooks").service(crate::routes::provider_webhook)),
        )
        .await
    }};
}

pub(crate) use test_app;

pub fn invoice_body(order_id: &str) -> serde_json::Value {
    serde_json::json!({
        "merchantOrderId": order_id,
        "fiatAmount": 1000,
        "currency": "USD",
        "allowedOptions": [{ "token": "USDT", "chain": TEST_CHAIN }],
        "callbackUrl": "https://merchant.example/callback",
        "expirySeconds": 900
    })
}
