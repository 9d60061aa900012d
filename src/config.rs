//! Configuration model for `api.yaml` plus the runtime snapshot built from it.
//!
//! Raw entries deserialize once per load. The derived [`RuntimeConfig`] (model
//! maps, key lists, preference tables) is immutable and swapped atomically on
//! reload; in-flight requests keep their old snapshot.

use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::scheduling::CircularList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAlgorithm {
	#[default]
	FixedPriority,
	RoundRobin,
	Random,
	Weighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
	One(T),
	Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
	pub fn to_vec(&self) -> Vec<T> {
		match self {
			OneOrMany::One(v) => vec![v.clone()],
			OneOrMany::Many(v) => v.clone(),
		}
	}
}

/// A rate-limit spec: `"N/unit"` or `"N/<k>unit"`, or a list of such strings
/// that must all hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateSpec {
	One(String),
	Many(Vec<String>),
}

impl RateSpec {
	pub fn windows(&self) -> Vec<(u64, u64)> {
		match self {
			RateSpec::One(s) => parse_rate_limit(s).into_iter().collect(),
			RateSpec::Many(list) => list.iter().flat_map(|s| parse_rate_limit(s)).collect(),
		}
	}
}

/// Either a single spec for every model or a per-model map with prefix and
/// `default` resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateLimitConfig {
	Simple(RateSpec),
	PerModel(HashMap<String, RateSpec>),
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		RateLimitConfig::Simple(RateSpec::One("999999/min".to_string()))
	}
}

impl RateLimitConfig {
	/// Resolve the windows for an upstream model name: exact key first, then
	/// the longest key that prefixes the model, then the `*` wildcard, then
	/// `default`.
	pub fn resolve(&self, model: &str) -> Vec<(u64, u64)> {
		match self {
			RateLimitConfig::Simple(spec) => spec.windows(),
			RateLimitConfig::PerModel(map) => {
				if let Some(spec) = map.get(model) {
					return spec.windows();
				}
				let mut best: Option<(&String, &RateSpec)> = None;
				for (k, v) in map {
					if k != "default" && k != "*" && model.starts_with(k.as_str()) {
						match best {
							Some((bk, _)) if bk.len() >= k.len() => {},
							_ => best = Some((k, v)),
						}
					}
				}
				if let Some((_, spec)) = best {
					return spec.windows();
				}
				map
					.get("*")
					.or_else(|| map.get("default"))
					.map(|s| s.windows())
					.unwrap_or_else(|| parse_rate_limit("999999/min"))
			},
		}
	}
}

/// Parse `"N/unit"` / `"N/<k>unit"` into `(limit, period_seconds)` pairs.
/// Unknown specs resolve to an effectively-unbounded window.
pub fn parse_rate_limit(spec: &str) -> Vec<(u64, u64)> {
	let Some((count, period)) = spec.split_once('/') else {
		warn!(spec, "invalid rate limit spec");
		return vec![(999_999, 60)];
	};
	let Ok(n) = count.trim().parse::<u64>() else {
		warn!(spec, "invalid rate limit count");
		return vec![(999_999, 60)];
	};
	let period = period.trim();
	let split = period
		.find(|c: char| !c.is_ascii_digit())
		.unwrap_or(period.len());
	let (mult, unit) = period.split_at(split);
	let mult: u64 = if mult.is_empty() {
		1
	} else {
		mult.parse().unwrap_or(1)
	};
	let unit_secs = match unit.trim_end_matches('s') {
		"" | "s" | "sec" | "second" => 1,
		"m" | "min" | "minute" => 60,
		"h" | "hour" => 3600,
		"d" | "day" => 86400,
		other => {
			warn!(spec, unit = other, "unknown rate limit unit");
			60
		},
	};
	vec![(n, mult * unit_secs)]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrMap {
	Int(u64),
	Map(HashMap<String, u64>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPreferences {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub proxy: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub headers: Option<HashMap<String, String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system_prompt: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_key_rate_limit: Option<RateLimitConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_key_cooldown_period: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_key_schedule_algorithm: Option<ScheduleAlgorithm>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub post_body_parameter_overrides: Option<serde_json::Map<String, Value>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_timeout: Option<HashMap<String, u64>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub keepalive_interval: Option<HashMap<String, u64>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub enabled_plugins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
	pub provider: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub engine: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub base_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api: Option<OneOrMany<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub project_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub private_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cf_account_id: Option<String>,
	#[serde(default)]
	pub model: Vec<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_prefix: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tools: Option<bool>,
	#[serde(default, alias = "group", skip_serializing_if = "Option::is_none")]
	pub groups: Option<OneOrMany<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub enabled: Option<bool>,
	#[serde(default)]
	pub preferences: ProviderPreferences,
}

impl ProviderConfig {
	pub fn enabled(&self) -> bool {
		self.enabled.unwrap_or(true)
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeyPreferences {
	#[serde(
		default,
		alias = "SCHEDULING_ALGORITHM",
		skip_serializing_if = "Option::is_none"
	)]
	pub scheduling_algorithm: Option<ScheduleAlgorithm>,
	#[serde(default, alias = "AUTO_RETRY", skip_serializing_if = "Option::is_none")]
	pub auto_retry: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rate_limit: Option<RateLimitConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub credits: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
	pub api: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<Vec<Value>>,
	#[serde(default, alias = "group", skip_serializing_if = "Option::is_none")]
	pub groups: Option<OneOrMany<String>>,
	#[serde(default)]
	pub preferences: ApiKeyPreferences,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_timeout: Option<IntOrMap>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub keepalive_interval: Option<IntOrMap>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cooldown_period: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rate_limit: Option<RateSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_retry_count: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_triggers: Option<Vec<String>>,
	/// `model prefix -> "prompt_price,completion_price"` per million tokens.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_price: Option<HashMap<String, String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub proxy: Option<String>,
	/// Retention window for raw request/response capture; unset disables it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub raw_data_retention_hours: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub providers: Vec<ProviderConfig>,
	#[serde(default)]
	pub api_keys: Vec<ApiKeyConfig>,
	#[serde(default)]
	pub preferences: Preferences,
}

pub const DEFAULT_TIMEOUT: u64 = 600;
pub const KEEPALIVE_DISABLED: u64 = 99_999;
const DEFAULT_PRICE: (f64, f64) = (0.3, 1.0);

/// Model-keyed preference lookups (timeouts, keepalive intervals). Resolution
/// order: channel entry for the request alias, channel entry for the upstream
/// model, the global table, the global default.
#[derive(Debug, Clone, Default)]
pub struct PreferenceTable {
	pub global: HashMap<String, u64>,
	pub per_provider: HashMap<String, HashMap<String, u64>>,
}

fn lookup_fuzzy(map: &HashMap<String, u64>, model: &str) -> Option<u64> {
	let model = model.to_lowercase();
	if let Some(v) = map.get(&model) {
		return Some(*v);
	}
	for (k, v) in map {
		if k != "default" && model.contains(&k.to_lowercase()) {
			return Some(*v);
		}
	}
	None
}

impl PreferenceTable {
	pub fn build(prefs: &Option<IntOrMap>, providers: &[ProviderConfig], key: &str, default: u64) -> Self {
		let mut global = HashMap::new();
		match prefs {
			Some(IntOrMap::Int(v)) => {
				global.insert("default".to_string(), *v);
			},
			Some(IntOrMap::Map(map)) => {
				for (k, v) in map {
					global.insert(k.to_lowercase(), *v);
				}
				global.entry("default".to_string()).or_insert(default);
			},
			None => {
				global.insert("default".to_string(), default);
			},
		}
		let mut per_provider = HashMap::new();
		for p in providers {
			let table = match key {
				"model_timeout" => p.preferences.model_timeout.as_ref(),
				"keepalive_interval" => p.preferences.keepalive_interval.as_ref(),
				_ => None,
			};
			if let Some(map) = table {
				let lowered: HashMap<String, u64> =
					map.iter().map(|(k, v)| (k.to_lowercase(), *v)).collect();
				per_provider.insert(p.provider.clone(), lowered);
			}
		}
		PreferenceTable {
			global,
			per_provider,
		}
	}

	pub fn get(&self, provider: &str, original_model: &str, request_model: &str, default: u64) -> u64 {
		let channel = self.per_provider.get(provider).unwrap_or(&self.global);
		lookup_fuzzy(channel, request_model)
			.or_else(|| lookup_fuzzy(channel, original_model))
			.or_else(|| channel.get("default").copied())
			.or_else(|| lookup_fuzzy(&self.global, original_model))
			.or_else(|| self.global.get("default").copied())
			.unwrap_or(default)
	}
}

/// A provider entry after load: resolved key list, alias map, groups.
#[derive(Debug, Clone)]
pub struct ProviderRuntime {
	pub config: ProviderConfig,
	/// alias -> upstream model name (identity when no mapping)
	pub model_map: HashMap<String, String>,
	/// aliases in declaration order, for listing
	pub model_aliases: Vec<String>,
	pub groups: Vec<String>,
	pub keys: Vec<String>,
	pub disabled_keys: HashSet<String>,
}

impl ProviderRuntime {
	fn build(config: &ProviderConfig) -> Self {
		let mut config = config.clone();
		// Credentialed Google/Cloudflare providers get their fixed API host.
		if config.project_id.is_some()
			&& !config
				.base_url
				.as_deref()
				.unwrap_or_default()
				.contains("google-vertex-ai")
		{
			config.base_url = Some("https://aiplatform.googleapis.com/".to_string());
		}
		if config.cf_account_id.is_some() {
			config.base_url = Some("https://api.cloudflare.com/".to_string());
		}

		let (keys, disabled_keys) = match &config.api {
			Some(api) => parse_api_keys(&api.to_vec()),
			None => (vec![], HashSet::new()),
		};

		let prefix = config.model_prefix.clone().unwrap_or_default();
		let mut model_map = HashMap::new();
		let mut model_aliases = Vec::new();
		for entry in &config.model {
			match entry {
				Value::String(name) => {
					let alias = format!("{prefix}{name}");
					model_map.insert(alias.clone(), name.clone());
					model_aliases.push(alias);
				},
				Value::Object(map) => {
					// `{upstream: alias}` renames the upstream model.
					for (upstream, alias) in map {
						let Some(alias) = alias.as_str() else { continue };
						let alias = format!("{prefix}{alias}");
						model_map.insert(alias.clone(), upstream.clone());
						model_aliases.push(alias);
					}
				},
				_ => warn!(provider = %config.provider, "unsupported model entry"),
			}
		}

		let groups = normalize_groups(&config.groups);
		ProviderRuntime {
			config,
			model_map,
			model_aliases,
			groups,
			keys,
			disabled_keys,
		}
	}

	pub fn name(&self) -> &str {
		&self.config.provider
	}

	pub fn base_url(&self) -> &str {
		self.config.base_url.as_deref().unwrap_or_default()
	}
}

fn normalize_groups(groups: &Option<OneOrMany<String>>) -> Vec<String> {
	let list = groups.as_ref().map(|g| g.to_vec()).unwrap_or_default();
	if list.is_empty() {
		vec!["default".to_string()]
	} else {
		list
	}
}

/// `!`-prefixed values are disabled keys: kept in the list (so indexes stay
/// stable) but never selected.
fn parse_api_keys(raw: &[String]) -> (Vec<String>, HashSet<String>) {
	let mut keys = Vec::new();
	let mut disabled = HashSet::new();
	for key in raw {
		let key = key.trim();
		if let Some(stripped) = key.strip_prefix('!') {
			keys.push(stripped.to_string());
			disabled.insert(stripped.to_string());
		} else {
			keys.push(key.to_string());
		}
	}
	(keys, disabled)
}

#[derive(Debug, Clone)]
pub struct ApiKeyRuntime {
	pub config: ApiKeyConfig,
	pub groups: Vec<String>,
	/// model patterns: `*`, `all`, alias, `provider/*`, `provider/alias`
	pub models: Vec<String>,
	/// `provider/alias -> weight` for the weighted algorithm
	pub weights: HashMap<String, u32>,
}

impl ApiKeyRuntime {
	fn build(config: &ApiKeyConfig) -> Self {
		let groups = normalize_groups(&config.groups);
		let mut models = Vec::new();
		let mut weights = HashMap::new();
		match &config.model {
			None => models.push("all".to_string()),
			Some(entries) => {
				for entry in entries {
					match entry {
						Value::String(s) => models.push(s.clone()),
						Value::Object(map) => {
							for (k, v) in map {
								if let Some(w) = v.as_u64() {
									weights.insert(k.clone(), w as u32);
								}
								models.push(k.clone());
							}
						},
						_ => {},
					}
				}
				if models.is_empty() {
					models.push("all".to_string());
				}
			},
		}
		ApiKeyRuntime {
			config: config.clone(),
			groups,
			models,
			weights,
		}
	}

	pub fn scheduling_algorithm(&self) -> ScheduleAlgorithm {
		self
			.config
			.preferences
			.scheduling_algorithm
			.unwrap_or_default()
	}

	pub fn auto_retry(&self) -> bool {
		self.config.preferences.auto_retry.unwrap_or(true)
	}
}

/// Immutable snapshot derived from one config load. Swapped under an
/// `ArcSwap`; readers clone the `Arc` and never observe a partial reload.
pub struct RuntimeConfig {
	pub raw: Config,
	pub providers: Vec<Arc<ProviderRuntime>>,
	pub api_keys: Vec<ApiKeyRuntime>,
	pub api_list: Vec<String>,
	pub key_lists: HashMap<String, Arc<CircularList>>,
	pub user_rate_limits: HashMap<String, Arc<CircularList>>,
	pub global_rate_limit: Arc<CircularList>,
	pub timeouts: PreferenceTable,
	pub keepalive: PreferenceTable,
	pub cooldown_period: u64,
	pub error_triggers: Vec<String>,
	pub max_retry_count: u32,
	pub proxy: Option<String>,
}

impl RuntimeConfig {
	pub fn build(raw: Config) -> Self {
		let providers: Vec<Arc<ProviderRuntime>> = raw
			.providers
			.iter()
			.map(|p| Arc::new(ProviderRuntime::build(p)))
			.collect();
		let api_keys: Vec<ApiKeyRuntime> = raw.api_keys.iter().map(ApiKeyRuntime::build).collect();
		let api_list: Vec<String> = api_keys.iter().map(|k| k.config.api.clone()).collect();

		let mut key_lists = HashMap::new();
		for p in &providers {
			if p.keys.is_empty() {
				continue;
			}
			let rate_limit = p
				.config
				.preferences
				.api_key_rate_limit
				.clone()
				.unwrap_or_default();
			let algorithm = p
				.config
				.preferences
				.api_key_schedule_algorithm
				.unwrap_or(ScheduleAlgorithm::RoundRobin);
			key_lists.insert(
				p.name().to_string(),
				Arc::new(CircularList::new(
					p.keys.clone(),
					rate_limit,
					algorithm,
					p.disabled_keys.clone(),
				)),
			);
		}

		let mut user_rate_limits = HashMap::new();
		for key in &api_keys {
			let rate_limit = key
				.config
				.preferences
				.rate_limit
				.clone()
				.unwrap_or_default();
			user_rate_limits.insert(
				key.config.api.clone(),
				Arc::new(CircularList::new(
					vec![key.config.api.clone()],
					rate_limit,
					ScheduleAlgorithm::RoundRobin,
					HashSet::new(),
				)),
			);
		}

		let global_rate_limit = Arc::new(CircularList::new(
			vec!["global".to_string()],
			raw
				.preferences
				.rate_limit
				.clone()
				.map(RateLimitConfig::Simple)
				.unwrap_or_default(),
			ScheduleAlgorithm::RoundRobin,
			HashSet::new(),
		));

		let timeouts = PreferenceTable::build(
			&raw.preferences.model_timeout,
			&raw.providers,
			"model_timeout",
			DEFAULT_TIMEOUT,
		);
		let keepalive = PreferenceTable::build(
			&raw.preferences.keepalive_interval,
			&raw.providers,
			"keepalive_interval",
			KEEPALIVE_DISABLED,
		);

		RuntimeConfig {
			providers,
			api_keys,
			api_list,
			key_lists,
			user_rate_limits,
			global_rate_limit,
			timeouts,
			keepalive,
			cooldown_period: raw.preferences.cooldown_period.unwrap_or(300),
			error_triggers: raw.preferences.error_triggers.clone().unwrap_or_default(),
			max_retry_count: raw.preferences.max_retry_count.unwrap_or(10).max(1),
			proxy: raw.preferences.proxy.clone(),
			raw,
		}
	}

	pub fn api_index(&self, token: &str) -> Option<usize> {
		self.api_list.iter().position(|k| k == token)
	}

	pub fn provider_by_name(&self, name: &str) -> Option<Arc<ProviderRuntime>> {
		self.providers.iter().find(|p| p.name() == name).cloned()
	}

	/// Per-million prices snapshotted onto each stat row: longest matching
	/// prefix of the model name, default `0.3,1`.
	pub fn price_for(&self, model: &str) -> (f64, f64) {
		let Some(map) = &self.raw.preferences.model_price else {
			return DEFAULT_PRICE;
		};
		let mut best: Option<(&String, &String)> = None;
		for (k, v) in map {
			if model.starts_with(k.as_str()) {
				match best {
					Some((bk, _)) if bk.len() >= k.len() => {},
					_ => best = Some((k, v)),
				}
			}
		}
		let Some((_, spec)) = best else {
			return DEFAULT_PRICE;
		};
		let mut parts = spec.split(',');
		let prompt = parts.next().and_then(|p| p.trim().parse().ok());
		let completion = parts.next().and_then(|p| p.trim().parse().ok());
		match (prompt, completion) {
			(Some(p), Some(c)) => (p, c),
			_ => DEFAULT_PRICE,
		}
	}
}

/// Process environment, read once at startup.
#[derive(Debug, Clone)]
pub struct EnvSettings {
	pub port: u16,
	pub timeout: u64,
	pub debug: bool,
	pub db_type: String,
	pub db_path: String,
	pub db_user: String,
	pub db_password: String,
	pub db_host: String,
	pub db_port: String,
	pub db_name: String,
	pub disable_database: bool,
	pub config_url: Option<String>,
}

impl EnvSettings {
	pub fn from_env() -> Self {
		let get = |k: &str, d: &str| env::var(k).unwrap_or_else(|_| d.to_string());
		EnvSettings {
			port: get("PORT", "8000").parse().unwrap_or(8000),
			timeout: get("TIMEOUT", "600").parse().unwrap_or(DEFAULT_TIMEOUT),
			debug: !get("DEBUG", "").is_empty(),
			db_type: get("DB_TYPE", "sqlite").to_lowercase(),
			db_path: get("DB_PATH", "./data/stats.db"),
			db_user: get("DB_USER", "postgres"),
			db_password: get("DB_PASSWORD", "mysecretpassword"),
			db_host: get("DB_HOST", "localhost"),
			db_port: get("DB_PORT", "5432"),
			db_name: get("DB_NAME", "postgres"),
			disable_database: get("DISABLE_DATABASE", "false").to_lowercase() == "true",
			config_url: env::var("CONFIG_URL").ok(),
		}
	}
}

pub const API_YAML_PATH: &str = "./api.yaml";

/// Load `api.yaml`, falling back to `CONFIG_URL` when the local file is
/// absent.
pub async fn load_config(env: &EnvSettings) -> anyhow::Result<Config> {
	match tokio::fs::read_to_string(API_YAML_PATH).await {
		Ok(contents) => {
			let config: Config = serde_yaml::from_str(&contents).context("parsing api.yaml")?;
			Ok(config)
		},
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			let Some(url) = &env.config_url else {
				anyhow::bail!("api.yaml not found and CONFIG_URL unset");
			};
			info!(url, "fetching config");
			let body = reqwest::Client::new()
				.get(url)
				.send()
				.await
				.context("fetching CONFIG_URL")?
				.error_for_status()?
				.text()
				.await?;
			let config: Config = serde_yaml::from_str(&body).context("parsing remote config")?;
			Ok(config)
		},
		Err(e) => Err(e).context("reading api.yaml"),
	}
}

/// Persist a config. serde only knows the declared fields, so runtime-only
/// `_`-prefixed keys never reach the file, and the YAML emitter quotes any
/// scalar containing `:`.
pub async fn save_config(config: &Config, path: &str) -> anyhow::Result<()> {
	let yaml = serde_yaml::to_string(config)?;
	tokio::fs::write(path, yaml).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn rate_limit_units() {
		assert_eq!(parse_rate_limit("2/min"), vec![(2, 60)]);
		assert_eq!(parse_rate_limit("10/s"), vec![(10, 1)]);
		assert_eq!(parse_rate_limit("100/5min"), vec![(100, 300)]);
		assert_eq!(parse_rate_limit("5/hour"), vec![(5, 3600)]);
		assert_eq!(parse_rate_limit("1/day"), vec![(1, 86400)]);
		assert_eq!(parse_rate_limit("3/2h"), vec![(3, 7200)]);
	}

	#[test]
	fn rate_limit_resolution_prefers_exact_then_longest_prefix() {
		let cfg: RateLimitConfig = serde_yaml::from_str(
			r#"
gpt-4: "2/min"
gpt-4-turbo: "5/min"
default: "100/min"
"#,
		)
		.unwrap();
		assert_eq!(cfg.resolve("gpt-4"), vec![(2, 60)]);
		assert_eq!(cfg.resolve("gpt-4-turbo-preview"), vec![(5, 60)]);
		assert_eq!(cfg.resolve("gpt-4o"), vec![(2, 60)]);
		assert_eq!(cfg.resolve("claude-3"), vec![(100, 60)]);
	}

	#[test]
	fn rate_limit_list_must_all_hold() {
		let cfg: RateLimitConfig = serde_yaml::from_str(r#"default: ["2/s", "10/min"]"#).unwrap();
		assert_eq!(cfg.resolve("anything"), vec![(2, 1), (10, 60)]);
	}

	#[test]
	fn rate_limit_wildcard_matches_any_model() {
		let cfg: RateLimitConfig = serde_yaml::from_str(
			r#"
gpt-4: "2/min"
"*": "30/min"
"#,
		)
		.unwrap();
		assert_eq!(cfg.resolve("gpt-4-turbo"), vec![(2, 60)]);
		assert_eq!(cfg.resolve("claude-3"), vec![(30, 60)]);

		// explicit default still wins over the hardcoded sentinel, and the
		// wildcard takes precedence over it
		let cfg: RateLimitConfig = serde_yaml::from_str(
			r#"
"*": "30/min"
default: "5/min"
"#,
		)
		.unwrap();
		assert_eq!(cfg.resolve("anything"), vec![(30, 60)]);
	}

	#[test]
	fn disabled_keys_are_parsed() {
		let (keys, disabled) =
			parse_api_keys(&["sk-a".to_string(), "!sk-b".to_string(), " sk-c ".to_string()]);
		assert_eq!(keys, vec!["sk-a", "sk-b", "sk-c"]);
		assert!(disabled.contains("sk-b"));
		assert!(!disabled.contains("sk-a"));
	}

	#[test]
	fn model_map_supports_rename_and_prefix() {
		let provider: ProviderConfig = serde_json::from_value(json!({
			"provider": "p1",
			"base_url": "https://api.openai.com",
			"model": ["gpt-4o", {"claude-3-5-sonnet-20241022": "claude-3.5-sonnet"}],
			"model_prefix": "团队/"
		}))
		.unwrap();
		let runtime = ProviderRuntime::build(&provider);
		assert_eq!(runtime.model_map.get("团队/gpt-4o").unwrap(), "gpt-4o");
		assert_eq!(
			runtime.model_map.get("团队/claude-3.5-sonnet").unwrap(),
			"claude-3-5-sonnet-20241022"
		);
		assert_eq!(runtime.model_aliases.len(), 2);
	}

	#[test]
	fn preference_table_resolution_order() {
		let providers: Vec<ProviderConfig> = serde_json::from_value(json!([
			{"provider": "p1", "model": [], "preferences": {"model_timeout": {"gpt-4": 120, "default": 30}}}
		]))
		.unwrap();
		let table = PreferenceTable::build(
			&Some(IntOrMap::Map(HashMap::from([
				("o1".to_string(), 900),
				("default".to_string(), 600),
			]))),
			&providers,
			"model_timeout",
			DEFAULT_TIMEOUT,
		);
		// channel-level fuzzy match on the request alias
		assert_eq!(table.get("p1", "gpt-4-0613", "my-gpt-4", 600), 120);
		// channel default
		assert_eq!(table.get("p1", "claude-3", "claude-3", 600), 30);
		// unknown provider falls back to the global table
		assert_eq!(table.get("p2", "o1-mini", "o1-mini", 600), 900);
		assert_eq!(table.get("p2", "other", "other", 600), 600);
	}

	#[test]
	fn api_key_weights_are_extracted() {
		let key: ApiKeyConfig = serde_json::from_value(json!({
			"api": "sk-user",
			"model": ["gpt-4o", {"p1/claude-3.5-sonnet": 3}],
			"preferences": {"SCHEDULING_ALGORITHM": "weighted"}
		}))
		.unwrap();
		let runtime = ApiKeyRuntime::build(&key);
		assert_eq!(runtime.models, vec!["gpt-4o", "p1/claude-3.5-sonnet"]);
		assert_eq!(runtime.weights.get("p1/claude-3.5-sonnet"), Some(&3));
		assert_eq!(runtime.scheduling_algorithm(), ScheduleAlgorithm::Weighted);
	}

	#[test]
	fn price_longest_prefix_with_default() {
		let raw: Config = serde_yaml::from_str(
			r#"
preferences:
  model_price:
    gpt-4: "5,15"
    gpt-4o: "2.5,10"
"#,
		)
		.unwrap();
		let rc = RuntimeConfig::build(raw);
		assert_eq!(rc.price_for("gpt-4o-mini"), (2.5, 10.0));
		assert_eq!(rc.price_for("gpt-4-turbo"), (5.0, 15.0));
		assert_eq!(rc.price_for("claude-3"), (0.3, 1.0));
	}
}
