use dotenvy::dotenv;
use log::{error, info};
use stable_payment_server::{config::ServerConfig, server::run_server};

#[actix_web::main]
async fn main() {
    dotenv().ok();
    env_logger::init();
    let config = ServerConfig::from_env_or_default();
    if !preflight_check(&config) {
        eprintln!("🚀️ Preflight check failed. Exiting. Check the logs for details.");
        return;
    }

    info!("🚀️ Starting server on {}:{}", config.host, config.port);
    match run_server(config).await {
        Ok(_) => println!("Bye!"),
        Err(e) => eprintln!("{e}"),
    }
}

fn preflight_check(config: &ServerConfig) -> bool {
    if std::env::var("SPG_SKIP_PREFLIGHT").ok() == Some("Yes".to_string()) {
        info!("🚦️ Skipping preflight checks. I hope you know what you're doing!");
        return true;
    }
    let mut result = true;
    info!("🚦️ Running preflight checks...");
    if config.provider.webhook_secret.reveal().is_empty() {
        error!(
            "🚦️ SPG_PROVIDER_WEBHOOK_SECRET is not set. Provider webhooks cannot be authenticated without it, \
             and anyone could inject transfer events."
        );
        result = false;
    }
    if config.confirmations.is_empty() {
        error!(
            "🚦️ No confirmation thresholds are configured. Set SPG_CONFIRMATIONS_<CHAIN> (e.g. \
             SPG_CONFIRMATIONS_ARBITRUM=6) for every chain you accept."
        );
        result = false;
    }
    for chain in config.confirmations.keys() {
        if !config.provider.rpc_urls.contains_key(chain) {
            error!(
                "🚦️ No RPC endpoint configured for chain {chain}. Set SPG_PROVIDER_RPC_URL_{} so confirmations \
                 can be tracked.",
                chain.as_str().to_uppercase()
            );
            result = false;
        }
    }
    if config.database_url.is_empty() {
        error!("🚦️ SPG_DATABASE_URL is not set. Please set it to the URL for the gateway database.");
        return false;
    }
    if result {
        info!("🚦️ Preflight check PASSED.");
    } else {
        error!("🚦️ Preflight check FAILED: Please fix the issues above before starting the server.");
        info!(
            "🚦️ If you really know what you're doing and want to skip the preflight check, set \
             `SPG_SKIP_PREFLIGHT` to `Yes` in your environment variables"
        );
    }
    result
}
