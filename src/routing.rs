//! Routing policy: which providers can serve a model alias for a given API
//! key, and in what order.
//!
//! Eligibility is enabled ∧ alias in the provider's model map ∧ group
//! intersection ∧ not blacklisted. Key model patterns support `*`/`all`,
//! `provider/*`, `provider/alias`, and local aggregators (`sk-…` provider
//! names that are themselves gateway keys, expanded recursively with their
//! own scheduling algorithm).

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;

use crate::config::{ProviderRuntime, RuntimeConfig, ScheduleAlgorithm};
use crate::cooldown::ChannelManager;

const MAX_AGGREGATOR_DEPTH: usize = 3;

fn groups_intersect(a: &[String], b: &[String]) -> bool {
	a.iter().any(|g| b.contains(g))
}

fn provider_offers(provider: &ProviderRuntime, model: &str) -> bool {
	provider.config.enabled() && provider.model_map.contains_key(model)
}

fn push_unique(out: &mut Vec<Arc<ProviderRuntime>>, seen: &mut HashSet<String>, p: Arc<ProviderRuntime>) {
	if seen.insert(p.name().to_string()) {
		out.push(p);
	}
}

fn candidates(
	config: &RuntimeConfig,
	model: &str,
	api_index: usize,
	depth: usize,
) -> Vec<Arc<ProviderRuntime>> {
	let Some(key) = config.api_keys.get(api_index) else {
		return vec![];
	};
	let mut out: Vec<Arc<ProviderRuntime>> = Vec::new();
	let mut seen = HashSet::new();

	let expand_aggregator = |name: &str, out: &mut Vec<Arc<ProviderRuntime>>, seen: &mut HashSet<String>| {
		if depth >= MAX_AGGREGATOR_DEPTH {
			return;
		}
		let Some(local_index) = config.api_index(name) else {
			return;
		};
		let local_key = &config.api_keys[local_index];
		if !groups_intersect(&key.groups, &local_key.groups) {
			return;
		}
		let algorithm = local_key.scheduling_algorithm();
		for p in order_providers(
			candidates(config, model, local_index, depth + 1),
			config,
			local_index,
			model,
			algorithm,
		) {
			push_unique(out, seen, p);
		}
	};

	for pattern in &key.models {
		if pattern == "all" || pattern == "*" {
			for p in &config.providers {
				if provider_offers(p, model) && groups_intersect(&key.groups, &p.groups) {
					push_unique(&mut out, &mut seen, p.clone());
				}
			}
			continue;
		}
		if let Some((provider_name, alias)) = pattern.split_once('/') {
			if provider_name.starts_with("sk-") && config.api_list.contains(&provider_name.to_string()) {
				if alias == "*" || alias == model {
					expand_aggregator(provider_name, &mut out, &mut seen);
				}
				continue;
			}
			if alias != "*" && alias != model {
				continue;
			}
			for p in &config.providers {
				if p.name() == provider_name
					&& provider_offers(p, model)
					&& groups_intersect(&key.groups, &p.groups)
				{
					push_unique(&mut out, &mut seen, p.clone());
				}
			}
			continue;
		}
		if pattern.starts_with("sk-") && config.api_list.contains(pattern) {
			expand_aggregator(pattern, &mut out, &mut seen);
			continue;
		}
		if pattern == model {
			for p in &config.providers {
				if provider_offers(p, model) && groups_intersect(&key.groups, &p.groups) {
					push_unique(&mut out, &mut seen, p.clone());
				}
			}
		}
	}
	out
}

fn order_providers(
	providers: Vec<Arc<ProviderRuntime>>,
	config: &RuntimeConfig,
	api_index: usize,
	model: &str,
	algorithm: ScheduleAlgorithm,
) -> Vec<Arc<ProviderRuntime>> {
	match algorithm {
		// Declaration order; the handler rotates the start index for
		// round-robin itself.
		ScheduleAlgorithm::FixedPriority | ScheduleAlgorithm::RoundRobin => providers,
		ScheduleAlgorithm::Random => {
			let mut providers = providers;
			providers.shuffle(&mut rand::rng());
			providers
		},
		ScheduleAlgorithm::Weighted => {
			let weights = config
				.api_keys
				.get(api_index)
				.map(|k| &k.weights);
			let mut weighted: Vec<(Arc<ProviderRuntime>, u32)> = providers
				.into_iter()
				.map(|p| {
					let w = weights
						.and_then(|w| w.get(&format!("{}/{}", p.name(), model)))
						.copied()
						.unwrap_or(1)
						.max(1);
					(p, w)
				})
				.collect();
			let mut rng = rand::rng();
			let mut out = Vec::with_capacity(weighted.len());
			// Sample without replacement proportional to weight.
			while !weighted.is_empty() {
				let total: u32 = weighted.iter().map(|(_, w)| *w).sum();
				let mut roll = rng.random_range(0..total);
				let mut idx = 0;
				for (i, (_, w)) in weighted.iter().enumerate() {
					if roll < *w {
						idx = i;
						break;
					}
					roll -= w;
				}
				out.push(weighted.remove(idx).0);
			}
			out
		},
	}
}

/// The ordered list of providers eligible for `model` under `api_index`.
pub async fn matching_providers(
	config: &RuntimeConfig,
	channels: &ChannelManager,
	model: &str,
	api_index: usize,
	algorithm: ScheduleAlgorithm,
) -> Vec<Arc<ProviderRuntime>> {
	let ordered = order_providers(
		candidates(config, model, api_index, 0),
		config,
		api_index,
		model,
		algorithm,
	);
	let mut out = Vec::with_capacity(ordered.len());
	for p in ordered {
		if !channels.is_excluded(p.name(), model).await {
			out.push(p);
		}
	}
	out
}

/// The `/v1/models` listing for one API key: group-filtered, prefix-filtered,
/// normalized so renamed upstream names never appear next to their alias.
pub fn available_models(config: &RuntimeConfig, api_index: usize) -> Vec<serde_json::Value> {
	available_models_inner(config, api_index, 0)
}

fn available_models_inner(
	config: &RuntimeConfig,
	api_index: usize,
	depth: usize,
) -> Vec<serde_json::Value> {
	if depth >= MAX_AGGREGATOR_DEPTH {
		return vec![];
	}
	let Some(key) = config.api_keys.get(api_index) else {
		return vec![];
	};

	// upstream -> alias, across every provider
	let mut upstream_to_alias = std::collections::HashMap::new();
	for p in &config.providers {
		for (alias, upstream) in &p.model_map {
			if alias != upstream {
				upstream_to_alias.insert(upstream.clone(), alias.clone());
			}
		}
	}
	let normalize =
		|name: &str| -> String { upstream_to_alias.get(name).cloned().unwrap_or_else(|| name.to_string()) };

	let mut ids: Vec<String> = Vec::new();
	let mut seen = HashSet::new();
	let mut push = |name: String| {
		if seen.insert(name.clone()) {
			ids.push(name);
		}
	};

	let provider_aliases = |p: &ProviderRuntime| -> Vec<String> {
		// Renamed upstream originals are display-hidden.
		let upstream_names: HashSet<&String> = p
			.model_map
			.iter()
			.filter(|(alias, upstream)| alias != upstream)
			.map(|(_, upstream)| upstream)
			.collect();
		p.model_aliases
			.iter()
			.filter(|a| !upstream_names.contains(a))
			.cloned()
			.collect()
	};

	for pattern in &key.models {
		if pattern == "all" || pattern == "*" {
			for p in &config.providers {
				if p.config.enabled() && groups_intersect(&key.groups, &p.groups) {
					for alias in provider_aliases(p) {
						push(normalize(&alias));
					}
				}
			}
			continue;
		}
		if let Some((provider_name, alias)) = pattern.split_once('/') {
			if provider_name.starts_with("sk-") {
				if let Some(local_index) = config.api_index(provider_name) {
					let local_groups = &config.api_keys[local_index].groups;
					if groups_intersect(&key.groups, local_groups) {
						for m in available_models_inner(config, local_index, depth + 1) {
							if let Some(id) = m["id"].as_str()
								&& (alias == "*" || alias == id)
							{
								push(id.to_string());
							}
						}
					}
				}
				continue;
			}
			for p in &config.providers {
				if p.name() != provider_name
					|| !p.config.enabled()
					|| !groups_intersect(&key.groups, &p.groups)
				{
					continue;
				}
				for a in provider_aliases(p) {
					if alias == "*" || a == *alias {
						push(normalize(&a));
					}
				}
			}
			continue;
		}
		if pattern.starts_with("sk-") && config.api_list.contains(pattern) {
			continue;
		}
		push(normalize(pattern));
	}

	ids
		.into_iter()
		.map(|id| {
			json!({
				"id": id,
				"object": "model",
				"created": 1720524448858u64,
				"owned_by": "modelgateway",
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::config::Config;

	fn runtime(v: serde_json::Value) -> RuntimeConfig {
		let raw: Config = serde_json::from_value(v).unwrap();
		RuntimeConfig::build(raw)
	}

	fn names(providers: &[Arc<ProviderRuntime>]) -> Vec<&str> {
		providers.iter().map(|p| p.name()).collect()
	}

	#[tokio::test]
	async fn eligibility_honors_groups_and_model_map() {
		let rc = runtime(json!({
			"providers": [
				{"provider": "p1", "base_url": "https://a/v1/chat/completions", "model": ["m"], "groups": ["default"]},
				{"provider": "p2", "base_url": "https://b/v1/chat/completions", "model": ["m"], "groups": ["vip"]},
				{"provider": "p3", "base_url": "https://c/v1/chat/completions", "model": ["other"], "groups": ["default"]},
				{"provider": "p4", "base_url": "https://d/v1/chat/completions", "model": ["m"], "enabled": false}
			],
			"api_keys": [{"api": "sk-user", "model": ["all"]}]
		}));
		let channels = ChannelManager::new(300);
		let matched = matching_providers(&rc, &channels, "m", 0, ScheduleAlgorithm::FixedPriority).await;
		assert_eq!(names(&matched), vec!["p1"]);
	}

	#[tokio::test]
	async fn provider_scoped_patterns() {
		let rc = runtime(json!({
			"providers": [
				{"provider": "p1", "base_url": "https://a/v1/chat/completions", "model": ["m", "n"]},
				{"provider": "p2", "base_url": "https://b/v1/chat/completions", "model": ["m"]}
			],
			"api_keys": [{"api": "sk-user", "model": ["p2/*"]}]
		}));
		let channels = ChannelManager::new(300);
		let matched = matching_providers(&rc, &channels, "m", 0, ScheduleAlgorithm::FixedPriority).await;
		assert_eq!(names(&matched), vec!["p2"]);
		let matched = matching_providers(&rc, &channels, "n", 0, ScheduleAlgorithm::FixedPriority).await;
		assert!(matched.is_empty());
	}

	#[tokio::test]
	async fn blacklisted_channels_are_filtered() {
		let rc = runtime(json!({
			"providers": [
				{"provider": "p1", "base_url": "https://a/v1/chat/completions", "model": ["m"]},
				{"provider": "p2", "base_url": "https://b/v1/chat/completions", "model": ["m"]}
			],
			"api_keys": [{"api": "sk-user", "model": ["all"]}]
		}));
		let channels = ChannelManager::new(300);
		channels.exclude_model("p1", "m").await;
		let matched = matching_providers(&rc, &channels, "m", 0, ScheduleAlgorithm::FixedPriority).await;
		assert_eq!(names(&matched), vec!["p2"]);
	}

	#[tokio::test]
	async fn aggregator_expands_to_local_key_providers() {
		let rc = runtime(json!({
			"providers": [
				{"provider": "p1", "base_url": "https://a/v1/chat/completions", "model": ["m"]},
				{"provider": "p2", "base_url": "https://b/v1/chat/completions", "model": ["m"]}
			],
			"api_keys": [
				{"api": "sk-outer", "model": ["sk-inner/*"]},
				{"api": "sk-inner", "model": ["p2/m"]}
			]
		}));
		let channels = ChannelManager::new(300);
		let matched = matching_providers(&rc, &channels, "m", 0, ScheduleAlgorithm::FixedPriority).await;
		assert_eq!(names(&matched), vec!["p2"]);
	}

	#[test]
	fn weighted_order_contains_all_providers() {
		let rc = runtime(json!({
			"providers": [
				{"provider": "p1", "base_url": "https://a/v1/chat/completions", "model": ["m"]},
				{"provider": "p2", "base_url": "https://b/v1/chat/completions", "model": ["m"]}
			],
			"api_keys": [{"api": "sk-user", "model": [{"p1/m": 5}, {"p2/m": 1}],
				"preferences": {"SCHEDULING_ALGORITHM": "weighted"}}]
		}));
		let ordered = order_providers(
			candidates(&rc, "m", 0, 0),
			&rc,
			0,
			"m",
			ScheduleAlgorithm::Weighted,
		);
		let mut got = names(&ordered);
		got.sort();
		assert_eq!(got, vec!["p1", "p2"]);
	}

	#[test]
	fn model_listing_normalizes_aliases_and_dedupes() {
		let rc = runtime(json!({
			"providers": [
				{"provider": "p1", "base_url": "https://a/v1/chat/completions",
				 "model": [{"gpt-4o-2024-11-20": "gpt-4o"}, "claude-x"]},
				{"provider": "p2", "base_url": "https://b/v1/chat/completions", "model": ["claude-x"]}
			],
			"api_keys": [{"api": "sk-user", "model": ["all"]}]
		}));
		let models = available_models(&rc, 0);
		let ids: Vec<&str> = models.iter().filter_map(|m| m["id"].as_str()).collect();
		assert!(ids.contains(&"gpt-4o"));
		assert!(!ids.contains(&"gpt-4o-2024-11-20"));
		assert_eq!(ids.iter().filter(|id| **id == "claude-x").count(), 1);
	}
}
