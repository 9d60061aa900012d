//! Pooled upstream HTTP clients, keyed by `(origin, proxy)`.
//!
//! A client per origin keeps connection pools warm across requests while an
//! optional per-provider proxy gets its own client. SSE must arrive as plain
//! bytes, so Accept-Encoding is pinned to identity.

use std::collections::HashMap;
use std::time::Duration;

use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use url::Url;

pub const USER_AGENT: &str = "curl/7.68.0";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const POOL_MAX_IDLE_PER_HOST: usize = 100;

pub struct ClientManager {
	clients: Mutex<HashMap<(String, Option<String>), reqwest::Client>>,
}

impl Default for ClientManager {
	fn default() -> Self {
		Self::new()
	}
}

impl ClientManager {
	pub fn new() -> Self {
		ClientManager {
			clients: Mutex::new(HashMap::new()),
		}
	}

	/// Client for `url`, optionally routed through `proxy`. Clients are cheap
	/// clones over a shared pool, so handing one out by value is fine.
	pub fn get_client(&self, url: &str, proxy: Option<&str>) -> reqwest::Client {
		let origin = Url::parse(url)
			.ok()
			.and_then(|u| {
				u.host_str()
					.map(|h| format!("{}://{}:{}", u.scheme(), h, u.port_or_known_default().unwrap_or(443)))
			})
			.unwrap_or_else(|| url.to_string());
		let key = (origin, proxy.map(str::to_string));
		let mut clients = self.clients.lock();
		if let Some(client) = clients.get(&key) {
			return client.clone();
		}
		let client = build_client(proxy);
		clients.insert(key, client.clone());
		client
	}
}

fn build_client(proxy: Option<&str>) -> reqwest::Client {
	let mut headers = HeaderMap::new();
	headers.insert(http::header::ACCEPT, HeaderValue::from_static("*/*"));
	headers.insert(
		http::header::ACCEPT_ENCODING,
		HeaderValue::from_static("identity"),
	);
	let mut builder = reqwest::Client::builder()
		.user_agent(USER_AGENT)
		.default_headers(headers)
		.connect_timeout(CONNECT_TIMEOUT)
		.pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
		.redirect(reqwest::redirect::Policy::default());
	if let Some(proxy) = proxy
		&& let Ok(p) = reqwest::Proxy::all(proxy)
	{
		builder = builder.proxy(p);
	}
	builder.build().unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clients_are_cached_per_origin_and_proxy() {
		let mgr = ClientManager::new();
		let _ = mgr.get_client("https://api.openai.com/v1/chat/completions", None);
		let _ = mgr.get_client("https://api.openai.com/v1/models", None);
		let _ = mgr.get_client("https://api.openai.com/v1/models", Some("socks5://localhost:1080"));
		let _ = mgr.get_client("https://api.anthropic.com/v1/messages", None);
		assert_eq!(mgr.clients.lock().len(), 3);
	}
}
