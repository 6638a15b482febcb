//! The read API: serves recent blocks and transactions over HTTP.

use block_metrics::utils::logging::{self, LogLevel};
use block_metrics::{api, Config, MetricsError, Result};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

async fn run() -> Result<()> {
    let conf = Config::from_env()?;

    let pool = block_metrics::connect(conf.pg_connect_options()?).await?;
    let app = api::router(pool);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", conf.port))
        .await
        .map_err(|err| MetricsError::Internal(err.to_string()).wrap("bind"))?;
    logging::log(LogLevel::Info, &format!("serving API on port {}", conf.port));

    axum::serve(listener, app)
        .await
        .map_err(|err| MetricsError::Internal(err.to_string()).wrap("serve"))
}
