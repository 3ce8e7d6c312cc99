use std::sync::Arc;

use finmail_lib::state::AppState;
use finmail_lib::types::load_config;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let state = match AppState::from_config(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            log::error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = finmail_lib::run(state).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
