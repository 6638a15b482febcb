//! The collector: wires configuration from the environment, bootstraps the
//! schema, dials Tendermint, and mirrors blocks until stopped.

use block_metrics::utils::logging::{self, LogLevel};
use block_metrics::{sync, Config, MetricsError, Result, Store, TendermintClient};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let conf = match Config::from_env() {
        Ok(conf) => conf,
        Err(err) => exit_fatal(&err),
    };
    if let Err(err) = run(conf).await {
        exit_fatal(&err);
    }
}

fn exit_fatal(err: &MetricsError) -> ! {
    eprintln!("{err}");
    std::process::exit(2);
}

async fn run(conf: Config) -> Result<()> {
    logging::log_startup(&conf.tendermint_ws_uri, &conf.postgres_uri);

    let pool = block_metrics::connect(conf.pg_connect_options()?).await?;
    block_metrics::ensure_schema(&pool)
        .await
        .map_err(|err| err.wrap("ensure schema"))?;
    let store = Store::new(pool);

    let client = TendermintClient::dial(&conf.tendermint_ws_uri)
        .await
        .map_err(|err| err.wrap("dial tendermint"))?;

    let shutdown = CancellationToken::new();
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });
    }

    let (inserted, err) = sync(&shutdown, &client, &store).await;
    logging::log(LogLevel::Info, &format!("inserted: {inserted}"));
    client.close().await;

    if err.is_cancelled() {
        logging::log(LogLevel::Success, "shut down cleanly");
        Ok(())
    } else {
        Err(err.wrap("sync"))
    }
}
