//! Temporary per-(provider, model) blacklist.
//!
//! The handler excludes a channel/model pair after a non-exempt failure when
//! other providers can still serve the request; the routing policy consults
//! the blacklist during eligibility checks. Entries expire lazily.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct ChannelManager {
	pub cooldown_period: u64,
	excluded: Mutex<HashMap<(String, String), Instant>>,
}

impl ChannelManager {
	pub fn new(cooldown_period: u64) -> Self {
		ChannelManager {
			cooldown_period,
			excluded: Mutex::new(HashMap::new()),
		}
	}

	pub async fn exclude_model(&self, provider: &str, model: &str) {
		if self.cooldown_period == 0 {
			return;
		}
		let until = Instant::now() + Duration::from_secs(self.cooldown_period);
		self
			.excluded
			.lock()
			.await
			.insert((provider.to_string(), model.to_string()), until);
	}

	pub async fn is_excluded(&self, provider: &str, model: &str) -> bool {
		let mut excluded = self.excluded.lock().await;
		let key = (provider.to_string(), model.to_string());
		match excluded.get(&key) {
			Some(until) if Instant::now() < *until => true,
			Some(_) => {
				excluded.remove(&key);
				false
			},
			None => false,
		}
	}
}
