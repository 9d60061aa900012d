use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use modelgateway::app::AppState;
use modelgateway::config::{self, EnvSettings};
use modelgateway::server;
use modelgateway::stats::StatsSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let env = EnvSettings::from_env();
	let default_level = if env.debug { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
		)
		.init();

	let raw = config::load_config(&env).await?;
	let sink = StatsSink::connect(&env).await?;
	let state = AppState::new(raw, env.clone(), sink.clone());

	// Expired raw-data columns are nulled hourly, starting immediately.
	if !env.disable_database {
		let sweeper_sink = sink.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(3600));
			loop {
				interval.tick().await;
				match sweeper_sink.sweep_expired_raw_data().await {
					Ok(0) => {},
					Ok(n) => info!(rows = n, "cleaned expired raw data"),
					Err(e) => error!(error = %e, "raw data sweep failed"),
				}
			}
		});
	}

	let app = server::router(state);
	let addr = format!("0.0.0.0:{}", env.port);
	info!(%addr, "listening");
	let listener = tokio::net::TcpListener::bind(&addr).await?;
	axum::serve(listener, app).await?;
	Ok(())
}
