//! Shared application state: the atomically-swappable config snapshot plus
//! the long-lived managers (clients, channel blacklist, stats sink, plugins).

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use crate::client::ClientManager;
use crate::config::{Config, EnvSettings, RuntimeConfig};
use crate::cooldown::ChannelManager;
use crate::plugins::PluginRegistry;
use crate::stats::StatsSink;

pub struct AppState {
	pub config: ArcSwap<RuntimeConfig>,
	pub env: EnvSettings,
	pub clients: ClientManager,
	pub channels: ChannelManager,
	pub sink: StatsSink,
	pub plugins: PluginRegistry,
	/// Per-model rotation cursor for non-fixed scheduling.
	pub rotation: Mutex<HashMap<String, usize>>,
}

impl AppState {
	pub fn new(raw: Config, env: EnvSettings, sink: StatsSink) -> Arc<Self> {
		let cooldown = raw.preferences.cooldown_period.unwrap_or(300);
		let runtime = RuntimeConfig::build(raw);
		Arc::new(AppState {
			config: ArcSwap::from_pointee(runtime),
			env,
			clients: ClientManager::new(),
			channels: ChannelManager::new(cooldown),
			sink,
			plugins: PluginRegistry::with_builtin(),
			rotation: Mutex::new(HashMap::new()),
		})
	}

	/// Replace the config snapshot. In-flight requests keep the snapshot they
	/// loaded; new requests see the new one.
	pub fn reload(&self, raw: Config) {
		self.config.store(Arc::new(RuntimeConfig::build(raw)));
	}

	pub fn snapshot(&self) -> Arc<RuntimeConfig> {
		self.config.load_full()
	}
}
