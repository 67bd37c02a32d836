use std::time::Duration;

use actix_web::{dev::Server, http::KeepAlive, middleware::Logger, web, App, HttpServer};
use log::*;
use stable_payment_engine::{db_types::Chain, traits::UsdParityPricer, InvoiceFlowApi, SqliteDatabase};

use crate::{
    config::ServerConfig,
    dispatcher::OutboxDispatcher,
    errors::ServerError,
    expiry_worker::start_expiry_worker,
    provider::RpcChainProvider,
    routes::{cancel_invoice, create_intent, create_invoice, get_invoice, health, invoice_status, provider_webhook},
};

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let db = SqliteDatabase::new_with_url(&config.database_url, 25)
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    db.run_migrations().await.map_err(|e| ServerError::InitializeError(e.to_string()))?;

    let provider = RpcChainProvider::new(&config.provider);
    let _dispatcher = OutboxDispatcher::new(db.clone(), provider, config.clone()).start();
    let _sweeper = start_expiry_worker(db.clone(), config.sweeper.clone());

    let srv = create_server_instance(config, db)?;
    srv.await.map_err(|e| ServerError::Unspecified(e.to_string()))
}

pub fn create_server_instance(config: ServerConfig, db: SqliteDatabase) -> Result<Server, ServerError> {
    let host = config.host.clone();
    let port = config.port;
    let srv = HttpServer::new(move || {
        let flow_api = InvoiceFlowApi::new(db.clone());
        let pricer = pricer_for(&config);
        App::new()
            .wrap(Logger::new("%t (%D ms) %s %a %{Host}i %U").log_target("payment_gateway"))
            .app_data(web::Data::new(flow_api))
            .app_data(web::Data::new(pricer))
            .app_data(web::Data::new(config.clone()))
            .service(health)
            .service(
                web::scope("/api")
                    .service(create_invoice)
                    .service(get_invoice)
                    .service(invoice_status)
                    .service(create_intent)
                    .service(cancel_invoice),
            )
            .service(web::scope("/webhooks").service(provider_webhook))
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(600)))
    .bind((host.as_str(), port))?
    .run();
    info!("💻️ Server listening on {host}:{port}");
    Ok(srv)
}

/// USDT/USDC at parity (6 decimals) on every configured chain.
pub fn pricer_for(config: &ServerConfig) -> UsdParityPricer {
    use std::collections::HashMap;

    use stable_payment_engine::db_types::{PaymentOption, Token};

    let mut decimals = HashMap::new();
    for chain in config.confirmations.keys() {
        decimals.insert(PaymentOption { token: Token::from("USDT"), chain: chain.clone() }, 6);
        decimals.insert(PaymentOption { token: Token::from("USDC"), chain: chain.clone() }, 6);
    }
    if decimals.is_empty() {
        return UsdParityPricer::usdt_usdc_on(&Chain::from("arbitrum"));
    }
    UsdParityPricer::new(decimals)
}
