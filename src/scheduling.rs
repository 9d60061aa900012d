//! Round-robin / weighted selection over upstream API keys with per-item
//! cooldown and per-(item, model) sliding-window rate limits.
//!
//! One list per provider; every mutation happens under the list's own async
//! mutex, so concurrent requests see window slots ordered by the moment their
//! `next()` succeeded.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::Mutex;

use crate::config::{RateLimitConfig, ScheduleAlgorithm};

#[derive(Debug, thiserror::Error)]
#[error("All API keys are rate limited and stop auto retry!")]
pub struct AllRateLimited;

fn now_secs() -> f64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs_f64()
}

#[derive(Default)]
struct State {
	cursor: usize,
	/// item -> unix ts until which it is excluded
	cooling: HashMap<String, f64>,
	/// item -> model -> request timestamps
	requests: HashMap<String, HashMap<String, Vec<f64>>>,
	last_returned: Option<String>,
}

pub struct CircularList {
	items: Vec<String>,
	weights: Vec<u32>,
	rate_limit: RateLimitConfig,
	algorithm: ScheduleAlgorithm,
	disabled: HashSet<String>,
	state: Mutex<State>,
}

impl CircularList {
	pub fn new(
		items: Vec<String>,
		rate_limit: RateLimitConfig,
		algorithm: ScheduleAlgorithm,
		disabled: HashSet<String>,
	) -> Self {
		let weights = vec![1; items.len()];
		CircularList {
			items,
			weights,
			rate_limit,
			algorithm,
			disabled,
			state: Mutex::new(State::default()),
		}
	}

	pub fn get_items_count(&self) -> usize {
		self.items.len()
	}

	pub fn items(&self) -> &[String] {
		&self.items
	}

	pub fn index_of(&self, item: &str) -> Option<usize> {
		self.items.iter().position(|i| i == item)
	}

	fn usable(&self, state: &State, item: &str, now: f64) -> bool {
		if self.disabled.contains(item) {
			return false;
		}
		if let Some(until) = state.cooling.get(item)
			&& now < *until
		{
			return false;
		}
		true
	}

	fn within_limits(state: &State, item: &str, model: &str, windows: &[(u64, u64)], now: f64) -> bool {
		let Some(log) = state.requests.get(item).and_then(|m| m.get(model)) else {
			return true;
		};
		for (limit, period) in windows {
			let cutoff = now - *period as f64;
			let recent = log.iter().filter(|ts| **ts > cutoff).count() as u64;
			if recent >= *limit {
				return false;
			}
		}
		true
	}

	/// Pick the next usable item for `model`, appending a request-log entry on
	/// success. One full pass without a winner fails.
	pub async fn next(&self, model: &str) -> Result<String, AllRateLimited> {
		if self.items.is_empty() {
			return Err(AllRateLimited);
		}
		let windows = self.rate_limit.resolve(model);
		let now = now_secs();
		let mut state = self.state.lock().await;

		let n = self.items.len();
		for attempt in 0..n {
			let idx = match self.algorithm {
				ScheduleAlgorithm::FixedPriority => attempt,
				ScheduleAlgorithm::RoundRobin => {
					let idx = state.cursor % n;
					state.cursor = state.cursor.wrapping_add(1);
					idx
				},
				ScheduleAlgorithm::Random => rand::rng().random_range(0..n),
				ScheduleAlgorithm::Weighted => {
					if attempt == 0 {
						self.weighted_pick()
					} else {
						// Cursor-stable fallback after a failed weighted pick.
						let idx = state.cursor % n;
						state.cursor = state.cursor.wrapping_add(1);
						idx
					}
				},
			};
			let item = &self.items[idx];
			if !self.usable(&state, item, now) {
				continue;
			}
			if !Self::within_limits(&state, item, model, &windows, now) {
				continue;
			}
			// Prune entries older than the longest window while we hold the lock.
			let max_period = windows.iter().map(|(_, p)| *p).max().unwrap_or(60) as f64;
			let log = state
				.requests
				.entry(item.clone())
				.or_default()
				.entry(model.to_string())
				.or_default();
			log.retain(|ts| *ts > now - max_period);
			log.push(now);
			state.last_returned = Some(item.clone());
			return Ok(item.clone());
		}
		Err(AllRateLimited)
	}

	fn weighted_pick(&self) -> usize {
		let total: u32 = self.weights.iter().sum();
		if total == 0 {
			return 0;
		}
		let mut roll = rand::rng().random_range(0..total);
		for (idx, w) in self.weights.iter().enumerate() {
			if roll < *w {
				return idx;
			}
			roll -= w;
		}
		0
	}

	/// The most recently returned item; used to apply cooldown after a failed
	/// attempt.
	pub async fn after_next_current(&self) -> Option<String> {
		self.state.lock().await.last_returned.clone()
	}

	pub async fn set_cooling(&self, item: &str, seconds: u64) {
		let mut state = self.state.lock().await;
		state
			.cooling
			.insert(item.to_string(), now_secs() + seconds as f64);
	}

	/// Quick check without advancing the cursor or recording a request.
	pub async fn is_all_rate_limited(&self, model: &str) -> bool {
		if self.items.is_empty() {
			return true;
		}
		let windows = self.rate_limit.resolve(model);
		let now = now_secs();
		let state = self.state.lock().await;
		self.items.iter().all(|item| {
			!self.usable(&state, item, now) || !Self::within_limits(&state, item, model, &windows, now)
		})
	}

	/// Drop the newest request-log entry for `(item, model)`. Used when an
	/// attempt failed in a way that means the request never really happened.
	pub async fn pop_last_request_log(&self, item: &str, model: &str) {
		let mut state = self.state.lock().await;
		if let Some(log) = state
			.requests
			.get_mut(item)
			.and_then(|models| models.get_mut(model))
		{
			log.pop();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{RateSpec, ScheduleAlgorithm};

	fn list(items: &[&str], algorithm: ScheduleAlgorithm, rate: RateLimitConfig) -> CircularList {
		CircularList::new(
			items.iter().map(|s| s.to_string()).collect(),
			rate,
			algorithm,
			HashSet::new(),
		)
	}

	fn unlimited() -> RateLimitConfig {
		RateLimitConfig::default()
	}

	#[tokio::test]
	async fn round_robin_is_fair() {
		let l = list(&["k1", "k2", "k3"], ScheduleAlgorithm::RoundRobin, unlimited());
		let mut picks = Vec::new();
		for _ in 0..6 {
			picks.push(l.next("modelA").await.unwrap());
		}
		assert_eq!(picks, vec!["k1", "k2", "k3", "k1", "k2", "k3"]);
	}

	#[tokio::test]
	async fn per_model_rate_limit_is_isolated() {
		let rate: RateLimitConfig = serde_yaml::from_str(
			r#"
gpt-4: "2/min"
default: "100/min"
"#,
		)
		.unwrap();
		let l = list(&["k1"], ScheduleAlgorithm::RoundRobin, rate);
		assert_eq!(l.next("gpt-4").await.unwrap(), "k1");
		assert_eq!(l.next("gpt-4").await.unwrap(), "k1");
		assert!(l.next("gpt-4").await.is_err());
		assert!(l.is_all_rate_limited("gpt-4").await);
		// other models still pass at the same moment
		assert_eq!(l.next("other-model").await.unwrap(), "k1");
		assert!(!l.is_all_rate_limited("other-model").await);
	}

	#[tokio::test]
	async fn multi_window_spec_must_all_hold() {
		let l = list(
			&["k1"],
			ScheduleAlgorithm::RoundRobin,
			RateLimitConfig::Simple(RateSpec::Many(vec!["1/s".into(), "10/min".into()])),
		);
		assert!(l.next("m").await.is_ok());
		assert!(l.next("m").await.is_err());
	}

	#[tokio::test]
	async fn cooling_excludes_until_expiry() {
		let l = list(&["k1", "k2"], ScheduleAlgorithm::RoundRobin, unlimited());
		assert_eq!(l.next("m").await.unwrap(), "k1");
		assert_eq!(l.after_next_current().await.as_deref(), Some("k1"));
		l.set_cooling("k1", 3600).await;
		for _ in 0..4 {
			assert_eq!(l.next("m").await.unwrap(), "k2");
		}
	}

	#[tokio::test]
	async fn all_cooling_fails() {
		let l = list(&["k1"], ScheduleAlgorithm::RoundRobin, unlimited());
		l.set_cooling("k1", 3600).await;
		assert!(l.next("m").await.is_err());
		assert!(l.is_all_rate_limited("m").await);
	}

	#[tokio::test]
	async fn disabled_keys_never_selected() {
		let l = CircularList::new(
			vec!["k1".into(), "k2".into()],
			unlimited(),
			ScheduleAlgorithm::RoundRobin,
			HashSet::from(["k1".to_string()]),
		);
		for _ in 0..4 {
			assert_eq!(l.next("m").await.unwrap(), "k2");
		}
	}

	#[tokio::test]
	async fn pop_last_request_log_refunds_a_slot() {
		let rate: RateLimitConfig = serde_yaml::from_str(r#"default: "1/min""#).unwrap();
		let l = list(&["k1"], ScheduleAlgorithm::RoundRobin, rate);
		assert!(l.next("m").await.is_ok());
		assert!(l.next("m").await.is_err());
		l.pop_last_request_log("k1", "m").await;
		assert!(l.next("m").await.is_ok());
	}

	#[tokio::test]
	async fn fixed_priority_prefers_first_usable() {
		let l = list(&["k1", "k2"], ScheduleAlgorithm::FixedPriority, unlimited());
		assert_eq!(l.next("m").await.unwrap(), "k1");
		assert_eq!(l.next("m").await.unwrap(), "k1");
		l.set_cooling("k1", 3600).await;
		assert_eq!(l.next("m").await.unwrap(), "k2");
	}
}
