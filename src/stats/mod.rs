//! Statistics sink: append-only request/attempt records plus the aggregate
//! queries built on them.
//!
//! One `RequestStat` per inbound request, one `ChannelStat` per attempt,
//! joined by `request_id`. Writes serialize behind a semaphore (sqlite gets a
//! single writer, postgres fifty) and retry with exponential backoff when the
//! database reports a lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::{AnyPool, Row};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::config::EnvSettings;

const WRITE_MAX_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY_MS: u64 = 500;

/// The per-request record, filled in as the request progresses and written
/// exactly once at finalization.
#[derive(Debug, Clone)]
pub struct RequestInfo {
	pub request_id: String,
	pub endpoint: String,
	pub client_ip: String,
	pub start_time: Instant,
	pub process_time: f64,
	pub first_response_time: f64,
	pub content_start_time: Option<f64>,
	pub provider: Option<String>,
	pub model: String,
	pub api_key: String,
	pub api_key_name: Option<String>,
	pub api_key_group: Option<String>,
	pub success: bool,
	pub status_code: i64,
	pub is_flagged: bool,
	pub prompt_tokens: i64,
	pub completion_tokens: i64,
	pub total_tokens: i64,
	pub prompt_price: f64,
	pub completion_price: f64,
	pub provider_id: Option<String>,
	pub provider_key_index: Option<i64>,
	pub retry_count: i64,
	pub retry_path: Option<String>,
	pub request_headers: Option<String>,
	pub request_body: Option<String>,
	pub upstream_request_body: Option<String>,
	pub upstream_response_body: Option<String>,
	pub response_body: Option<String>,
	pub raw_data_expires_at: Option<i64>,
	pub finalized: bool,
}

impl RequestInfo {
	pub fn new(endpoint: &str, client_ip: &str) -> Self {
		RequestInfo {
			request_id: uuid::Uuid::new_v4().to_string(),
			endpoint: endpoint.to_string(),
			client_ip: client_ip.to_string(),
			start_time: Instant::now(),
			process_time: 0.0,
			first_response_time: -1.0,
			content_start_time: None,
			provider: None,
			model: String::new(),
			api_key: String::new(),
			api_key_name: None,
			api_key_group: None,
			success: false,
			status_code: 500,
			is_flagged: false,
			prompt_tokens: 0,
			completion_tokens: 0,
			total_tokens: 0,
			prompt_price: 0.0,
			completion_price: 0.0,
			provider_id: None,
			provider_key_index: None,
			retry_count: 0,
			retry_path: None,
			request_headers: None,
			request_body: None,
			upstream_request_body: None,
			upstream_response_body: None,
			response_body: None,
			raw_data_expires_at: None,
			finalized: false,
		}
	}
}

pub type SharedRequestInfo = Arc<Mutex<RequestInfo>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbKind {
	Sqlite,
	Postgres,
}

impl DbKind {
	fn placeholder(&self, index: usize) -> String {
		match self {
			DbKind::Sqlite => "?".to_string(),
			DbKind::Postgres => format!("${index}"),
		}
	}

	fn placeholders(&self, count: usize) -> String {
		(1..=count)
			.map(|i| self.placeholder(i))
			.collect::<Vec<_>>()
			.join(", ")
	}
}

struct Backend {
	pool: AnyPool,
	kind: DbKind,
	semaphore: Semaphore,
}

/// Handle to the stats store. With `DISABLE_DATABASE` the sink exists but
/// every write is a no-op.
#[derive(Clone)]
pub struct StatsSink {
	backend: Option<Arc<Backend>>,
}

fn sanitize(s: &str) -> String {
	// Postgres rejects NUL bytes in text columns.
	if s.contains('\0') {
		s.replace('\0', "")
	} else {
		s.to_string()
	}
}

fn sanitize_opt(s: &Option<String>) -> Option<String> {
	s.as_ref().map(|v| sanitize(v))
}

fn is_lock_error(e: &sqlx::Error) -> bool {
	let msg = e.to_string();
	msg.contains("database is locked") || msg.contains("busy")
}

impl StatsSink {
	pub fn disabled() -> Self {
		StatsSink { backend: None }
	}

	pub async fn connect(env: &EnvSettings) -> anyhow::Result<Self> {
		if env.disable_database {
			info!("database disabled");
			return Ok(Self::disabled());
		}
		install_default_drivers();
		let (url, kind, writers) = match env.db_type.as_str() {
			"postgres" => (
				format!(
					"postgres://{}:{}@{}:{}/{}",
					env.db_user, env.db_password, env.db_host, env.db_port, env.db_name
				),
				DbKind::Postgres,
				50,
			),
			_ => {
				if let Some(dir) = std::path::Path::new(&env.db_path).parent() {
					tokio::fs::create_dir_all(dir).await.ok();
				}
				(
					format!("sqlite://{}?mode=rwc", env.db_path),
					DbKind::Sqlite,
					1,
				)
			},
		};
		info!(db = %env.db_type, "connecting stats database");
		let pool = AnyPoolOptions::new()
			.max_connections(if kind == DbKind::Sqlite { 4 } else { 50 })
			.connect(&url)
			.await?;
		if kind == DbKind::Sqlite {
			sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await.ok();
			sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await.ok();
		}
		let sink = StatsSink {
			backend: Some(Arc::new(Backend {
				pool,
				kind,
				semaphore: Semaphore::new(writers),
			})),
		};
		sink.create_tables().await?;
		Ok(sink)
	}

	async fn create_tables(&self) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};
		let id_column = match backend.kind {
			DbKind::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
			DbKind::Postgres => "id BIGSERIAL PRIMARY KEY",
		};
		let float = match backend.kind {
			DbKind::Sqlite => "REAL",
			DbKind::Postgres => "DOUBLE PRECISION",
		};
		let request_stats = format!(
			"CREATE TABLE IF NOT EXISTS request_stats (
				{id_column},
				request_id TEXT,
				endpoint TEXT,
				client_ip TEXT,
				process_time {float},
				first_response_time {float},
				content_start_time {float},
				provider TEXT,
				model TEXT,
				api_key TEXT,
				success BOOLEAN,
				status_code BIGINT,
				is_flagged BOOLEAN,
				prompt_tokens BIGINT,
				completion_tokens BIGINT,
				total_tokens BIGINT,
				prompt_price {float},
				completion_price {float},
				timestamp BIGINT,
				provider_id TEXT,
				provider_key_index BIGINT,
				api_key_name TEXT,
				api_key_group TEXT,
				retry_count BIGINT,
				retry_path TEXT,
				request_headers TEXT,
				request_body TEXT,
				upstream_request_body TEXT,
				upstream_response_body TEXT,
				response_body TEXT,
				raw_data_expires_at BIGINT
			)"
		);
		let channel_stats = format!(
			"CREATE TABLE IF NOT EXISTS channel_stats (
				{id_column},
				request_id TEXT,
				provider TEXT,
				model TEXT,
				api_key TEXT,
				provider_api_key TEXT,
				success BOOLEAN,
				timestamp BIGINT
			)"
		);
		sqlx::query(&request_stats).execute(&backend.pool).await?;
		sqlx::query(&channel_stats).execute(&backend.pool).await?;
		Ok(())
	}

	async fn execute_with_retry<F, Fut>(&self, backend: &Backend, run: F) -> Result<(), sqlx::Error>
	where
		F: Fn() -> Fut,
		Fut: std::future::Future<Output = Result<(), sqlx::Error>>,
	{
		let _permit = backend.semaphore.acquire().await.expect("semaphore open");
		let mut attempt = 0u32;
		loop {
			match run().await {
				Ok(()) => return Ok(()),
				Err(e) if is_lock_error(&e) && attempt < WRITE_MAX_RETRIES => {
					let delay = WRITE_RETRY_DELAY_MS * 2u64.pow(attempt);
					attempt += 1;
					tokio::time::sleep(Duration::from_millis(delay)).await;
				},
				Err(e) => return Err(e),
			}
		}
	}

	pub async fn write_request_stat(&self, info: &RequestInfo) {
		let Some(backend) = &self.backend else {
			return;
		};
		let sql = format!(
			"INSERT INTO request_stats (
				request_id, endpoint, client_ip, process_time, first_response_time,
				content_start_time, provider, model, api_key, success, status_code,
				is_flagged, prompt_tokens, completion_tokens, total_tokens,
				prompt_price, completion_price, timestamp, provider_id,
				provider_key_index, api_key_name, api_key_group, retry_count,
				retry_path, request_headers, request_body, upstream_request_body,
				upstream_response_body, response_body, raw_data_expires_at
			) VALUES ({})",
			backend.kind.placeholders(30)
		);
		let now = chrono::Utc::now().timestamp();
		let result = self
			.execute_with_retry(backend, async || {
				sqlx::query(&sql)
					.bind(sanitize(&info.request_id))
					.bind(sanitize(&info.endpoint))
					.bind(sanitize(&info.client_ip))
					.bind(info.process_time)
					.bind(info.first_response_time)
					.bind(info.content_start_time)
					.bind(sanitize_opt(&info.provider))
					.bind(sanitize(&info.model))
					.bind(sanitize(&info.api_key))
					.bind(info.success)
					.bind(info.status_code)
					.bind(info.is_flagged)
					.bind(info.prompt_tokens)
					.bind(info.completion_tokens)
					.bind(info.total_tokens)
					.bind(info.prompt_price)
					.bind(info.completion_price)
					.bind(now)
					.bind(sanitize_opt(&info.provider_id))
					.bind(info.provider_key_index)
					.bind(sanitize_opt(&info.api_key_name))
					.bind(sanitize_opt(&info.api_key_group))
					.bind(info.retry_count)
					.bind(sanitize_opt(&info.retry_path))
					.bind(sanitize_opt(&info.request_headers))
					.bind(sanitize_opt(&info.request_body))
					.bind(sanitize_opt(&info.upstream_request_body))
					.bind(sanitize_opt(&info.upstream_response_body))
					.bind(sanitize_opt(&info.response_body))
					.bind(info.raw_data_expires_at)
					.execute(&backend.pool)
					.await
					.map(|_| ())
			})
			.await;
		if let Err(e) = result {
			error!(error = %e, "failed to write request stat");
		}
	}

	pub async fn write_channel_stat(
		&self,
		request_id: &str,
		provider: &str,
		model: &str,
		api_key: &str,
		provider_api_key: Option<&str>,
		success: bool,
	) {
		let Some(backend) = &self.backend else {
			return;
		};
		let sql = format!(
			"INSERT INTO channel_stats (
				request_id, provider, model, api_key, provider_api_key, success, timestamp
			) VALUES ({})",
			backend.kind.placeholders(7)
		);
		let now = chrono::Utc::now().timestamp();
		let result = self
			.execute_with_retry(backend, async || {
				sqlx::query(&sql)
					.bind(sanitize(request_id))
					.bind(sanitize(provider))
					.bind(sanitize(model))
					.bind(sanitize(api_key))
					.bind(provider_api_key.map(sanitize))
					.bind(success)
					.bind(now)
					.execute(&backend.pool)
					.await
					.map(|_| ())
			})
			.await;
		if let Err(e) = result {
			error!(error = %e, "failed to write channel stat");
		}
	}

	/// Token usage grouped by `(api_key, model)` within `[start, end)`. Cost
	/// sums per row against the prices snapshotted at write time.
	pub async fn token_usage(
		&self,
		start: i64,
		end: i64,
	) -> Result<Vec<TokenUsageRow>, sqlx::Error> {
		let Some(backend) = &self.backend else {
			return Ok(vec![]);
		};
		let sql = format!(
			"SELECT api_key, model,
				CAST(SUM(prompt_tokens) AS BIGINT) AS prompt_tokens,
				CAST(SUM(completion_tokens) AS BIGINT) AS completion_tokens,
				CAST(SUM(total_tokens) AS BIGINT) AS total_tokens,
				CAST(SUM(prompt_tokens * prompt_price + completion_tokens * completion_price) / 1000000.0
					AS DOUBLE PRECISION) AS cost,
				COUNT(*) AS requests
			FROM request_stats
			WHERE timestamp >= {} AND timestamp < {}
			GROUP BY api_key, model",
			backend.kind.placeholder(1),
			backend.kind.placeholder(2),
		);
		let rows = sqlx::query(&sql)
			.bind(start)
			.bind(end)
			.fetch_all(&backend.pool)
			.await?;
		Ok(
			rows
				.into_iter()
				.map(|row| TokenUsageRow {
					api_key: row.try_get("api_key").unwrap_or_default(),
					model: row.try_get("model").unwrap_or_default(),
					prompt_tokens: row.try_get("prompt_tokens").unwrap_or_default(),
					completion_tokens: row.try_get("completion_tokens").unwrap_or_default(),
					total_tokens: row.try_get("total_tokens").unwrap_or_default(),
					cost: row.try_get("cost").unwrap_or_default(),
					requests: row.try_get("requests").unwrap_or_default(),
				})
				.collect(),
		)
	}

	/// Success ranking of a provider's upstream keys over a window.
	pub async fn channel_key_rankings(
		&self,
		provider: &str,
		since: i64,
	) -> Result<Vec<ChannelKeyRanking>, sqlx::Error> {
		let Some(backend) = &self.backend else {
			return Ok(vec![]);
		};
		let sql = format!(
			"SELECT provider_api_key,
				COUNT(*) AS total_requests,
				CAST(SUM(CASE WHEN success THEN 1 ELSE 0 END) AS BIGINT) AS success_count
			FROM channel_stats
			WHERE provider = {} AND timestamp >= {} AND provider_api_key IS NOT NULL
			GROUP BY provider_api_key",
			backend.kind.placeholder(1),
			backend.kind.placeholder(2),
		);
		let rows = sqlx::query(&sql)
			.bind(provider)
			.bind(since)
			.fetch_all(&backend.pool)
			.await?;
		let mut rankings: Vec<ChannelKeyRanking> = rows
			.into_iter()
			.map(|row| {
				let total: i64 = row.try_get("total_requests").unwrap_or_default();
				let success: i64 = row.try_get("success_count").unwrap_or_default();
				ChannelKeyRanking {
					api_key: row.try_get("provider_api_key").unwrap_or_default(),
					total_requests: total,
					success_count: success,
					success_rate: if total > 0 {
						success as f64 / total as f64
					} else {
						0.0
					},
				}
			})
			.collect();
		rankings.sort_by(|a, b| {
			(b.success_rate, b.total_requests)
				.partial_cmp(&(a.success_rate, a.total_requests))
				.unwrap_or(std::cmp::Ordering::Equal)
		});
		Ok(rankings)
	}

	/// Null out raw-body columns whose retention has expired. Returns the
	/// number of rows touched.
	pub async fn sweep_expired_raw_data(&self) -> Result<u64, sqlx::Error> {
		let Some(backend) = &self.backend else {
			return Ok(0);
		};
		let sql = format!(
			"UPDATE request_stats SET
				request_headers = NULL,
				request_body = NULL,
				upstream_request_body = NULL,
				upstream_response_body = NULL,
				response_body = NULL
			WHERE raw_data_expires_at IS NOT NULL
			  AND raw_data_expires_at < {}
			  AND (request_headers IS NOT NULL
				OR request_body IS NOT NULL
				OR response_body IS NOT NULL)",
			backend.kind.placeholder(1),
		);
		let now = chrono::Utc::now().timestamp();
		let result = sqlx::query(&sql).bind(now).execute(&backend.pool).await?;
		Ok(result.rows_affected())
	}
}

#[derive(Debug, Clone)]
pub struct TokenUsageRow {
	pub api_key: String,
	pub model: String,
	pub prompt_tokens: i64,
	pub completion_tokens: i64,
	pub total_tokens: i64,
	pub cost: f64,
	pub requests: i64,
}

#[derive(Debug, Clone)]
pub struct ChannelKeyRanking {
	pub api_key: String,
	pub total_requests: i64,
	pub success_count: i64,
	pub success_rate: f64,
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn sqlite_sink(dir: &tempfile::TempDir) -> StatsSink {
		let env = EnvSettings {
			db_type: "sqlite".to_string(),
			db_path: dir
				.path()
				.join("stats.db")
				.to_string_lossy()
				.to_string(),
			disable_database: false,
			..blank_env()
		};
		StatsSink::connect(&env).await.unwrap()
	}

	fn blank_env() -> EnvSettings {
		EnvSettings {
			port: 8000,
			timeout: 600,
			debug: false,
			db_type: "sqlite".to_string(),
			db_path: "./data/stats.db".to_string(),
			db_user: String::new(),
			db_password: String::new(),
			db_host: String::new(),
			db_port: String::new(),
			db_name: String::new(),
			disable_database: true,
			config_url: None,
		}
	}

	fn info_with(model: &str, p: i64, c: i64, pp: f64, cp: f64) -> RequestInfo {
		let mut info = RequestInfo::new("/v1/chat/completions", "127.0.0.1");
		info.model = model.to_string();
		info.api_key = "sk-user".to_string();
		info.prompt_tokens = p;
		info.completion_tokens = c;
		info.total_tokens = p + c;
		info.prompt_price = pp;
		info.completion_price = cp;
		info.success = true;
		info.status_code = 200;
		info
	}

	#[tokio::test]
	async fn cost_rollup_uses_snapshotted_prices() {
		let dir = tempfile::tempdir().unwrap();
		let sink = sqlite_sink(&dir).await;
		// same model, two price epochs: the rollup must honor each row's own
		// snapshot, not any current price
		sink.write_request_stat(&info_with("gpt-4o", 1_000_000, 500_000, 5.0, 15.0))
			.await;
		sink.write_request_stat(&info_with("gpt-4o", 1_000_000, 500_000, 2.5, 10.0))
			.await;
		let now = chrono::Utc::now().timestamp();
		let usage = sink.token_usage(now - 60, now + 60).await.unwrap();
		assert_eq!(usage.len(), 1);
		let row = &usage[0];
		assert_eq!(row.prompt_tokens, 2_000_000);
		assert_eq!(row.requests, 2);
		let expected = (5.0 + 0.5 * 15.0) + (2.5 + 0.5 * 10.0);
		assert!((row.cost - expected).abs() < 1e-6);
	}

	#[tokio::test]
	async fn channel_rankings_sort_by_success_rate() {
		let dir = tempfile::tempdir().unwrap();
		let sink = sqlite_sink(&dir).await;
		for _ in 0..3 {
			sink
				.write_channel_stat("r1", "p1", "m", "sk-user", Some("key-good"), true)
				.await;
		}
		sink
			.write_channel_stat("r2", "p1", "m", "sk-user", Some("key-bad"), false)
			.await;
		sink
			.write_channel_stat("r3", "p1", "m", "sk-user", Some("key-bad"), true)
			.await;
		let now = chrono::Utc::now().timestamp();
		let rankings = sink.channel_key_rankings("p1", now - 60).await.unwrap();
		assert_eq!(rankings.len(), 2);
		assert_eq!(rankings[0].api_key, "key-good");
		assert!((rankings[0].success_rate - 1.0).abs() < f64::EPSILON);
		assert!((rankings[1].success_rate - 0.5).abs() < f64::EPSILON);
	}

	#[tokio::test]
	async fn sweeper_nulls_expired_raw_columns() {
		let dir = tempfile::tempdir().unwrap();
		let sink = sqlite_sink(&dir).await;
		let mut expired = info_with("m", 1, 1, 0.3, 1.0);
		expired.request_body = Some("{\"secret\": true}".to_string());
		expired.raw_data_expires_at = Some(chrono::Utc::now().timestamp() - 10);
		sink.write_request_stat(&expired).await;
		let mut fresh = info_with("m", 1, 1, 0.3, 1.0);
		fresh.request_body = Some("{\"keep\": true}".to_string());
		fresh.raw_data_expires_at = Some(chrono::Utc::now().timestamp() + 3600);
		sink.write_request_stat(&fresh).await;

		let touched = sink.sweep_expired_raw_data().await.unwrap();
		assert_eq!(touched, 1);
	}

	#[tokio::test]
	async fn nul_bytes_are_stripped() {
		assert_eq!(sanitize("a\0b"), "ab");
		assert_eq!(sanitize("clean"), "clean");
	}

	#[tokio::test]
	async fn disabled_sink_is_a_noop() {
		let sink = StatsSink::disabled();
		sink.write_request_stat(&info_with("m", 1, 1, 0.3, 1.0)).await;
		assert!(sink.token_usage(0, i64::MAX).await.unwrap().is_empty());
	}
}
