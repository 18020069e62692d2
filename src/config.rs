//! Client configuration: TOML files layered in order, then environment
//! overrides for the two addresses.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use url::Url;

use crate::common::OccupancyThresholds;


pub const DEFAULT_CONFIG_FILES: [&str; 2] = [
	"/etc/mqc/occupancy-client.toml",
	"occupancy-client.toml",
];

pub const ENV_API_BASE_URL: &str = "MQC_API_BASE_URL";
pub const ENV_SOCKET_URL: &str = "MQC_SOCKET_URL";

const DEFAULT_BASE_URL: &str = "http://localhost:5000";

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
	/// Backend root; REST lives under `/api`, video under `/video_feed`.
	pub api_base_url: Url,
	/// Socket.IO server root; may differ from the API host.
	pub socket_url: Url,
	pub request_timeout_ms: u64,
	pub reconnection: ReconnectionConfig,
	/// Realtime transports, tried in this order on every attempt.
	pub transports: Vec<TransportKind>,
	pub occupancy: OccupancySettings,
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
	pub attempts: u32,
	pub delay_ms: u64,
	/// Fraction of each delay that is randomized; 0 keeps the backoff linear.
	pub jitter: f64,
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum TransportKind {
	#[serde(rename = "websocket")]
	WebSocket,
	#[serde(rename = "polling")]
	Polling,
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancySettings {
	/// How far past capacity a count may go before it is clamped.
	pub tolerance: u32,
	pub warning_percent: u32,
	pub violation_percent: u32,
}

impl Default for ClientConfig {
	fn default() -> Self {
		let base = Url::parse(DEFAULT_BASE_URL).expect("default base URL parses");
		ClientConfig {
			api_base_url: base.clone(),
			socket_url: base,
			request_timeout_ms: 10_000,
			reconnection: ReconnectionConfig::default(),
			transports: vec![TransportKind::WebSocket, TransportKind::Polling],
			occupancy: OccupancySettings::default(),
		}
	}
}

impl Default for ReconnectionConfig {
	fn default() -> Self {
		ReconnectionConfig { attempts: 5, delay_ms: 1_000, jitter: 0.0 }
	}
}

impl Default for OccupancySettings {
	fn default() -> Self {
		let thresholds = OccupancyThresholds::default();
		OccupancySettings {
			tolerance: 100,
			warning_percent: thresholds.warning_percent,
			violation_percent: thresholds.violation_percent,
		}
	}
}

impl OccupancySettings {
	pub fn thresholds(&self) -> OccupancyThresholds {
		OccupancyThresholds {
			warning_percent: self.warning_percent,
			violation_percent: self.violation_percent,
		}
	}
}

impl ReconnectionConfig {
	pub fn delay(&self) -> Duration {
		Duration::from_millis(self.delay_ms)
	}
}

impl ClientConfig {
	/// Reads every file in order; later files override earlier ones key by key.
	pub fn read_config(filenames: &[&str]) -> anyhow::Result<ClientConfig> {
		let mut merged = toml::Table::new();
		for filename in filenames {
			let text = std::fs::read_to_string(filename)
				.with_context(|| format!("failed to read config file {}", filename))?;
			let table = text.parse::<toml::Table>()
				.with_context(|| format!("failed to parse config file {}", filename))?;
			merge_tables(&mut merged, table);
		}
		let mut config: ClientConfig = toml::Value::Table(merged)
			.try_into()
			.context("invalid client configuration")?;
		config.apply_env(|key| std::env::var(key).ok())?;
		Ok(config)
	}

	/// Like `read_config` over whichever default locations exist; none is fine.
	pub fn read_default_config_files() -> anyhow::Result<ClientConfig> {
		let existing: Vec<&str> = DEFAULT_CONFIG_FILES
			.iter()
			.copied()
			.filter(|path| Path::new(path).exists())
			.collect();
		ClientConfig::read_config(&existing)
	}

	pub fn from_toml_str(text: &str) -> anyhow::Result<ClientConfig> {
		toml::from_str(text).context("invalid client configuration")
	}

	pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(value) = lookup(ENV_API_BASE_URL) {
			self.api_base_url = Url::parse(&value)
				.with_context(|| format!("{} is not a URL: {}", ENV_API_BASE_URL, value))?;
		}
		if let Some(value) = lookup(ENV_SOCKET_URL) {
			self.socket_url = Url::parse(&value)
				.with_context(|| format!("{} is not a URL: {}", ENV_SOCKET_URL, value))?;
		}
		Ok(())
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms)
	}

	/// `{api_base_url}/api`, the root every REST path hangs off.
	pub fn rest_base_url(&self) -> anyhow::Result<Url> {
		join_path(&self.api_base_url, "api")
	}
}

pub(crate) fn join_path(base: &Url, segment: &str) -> anyhow::Result<Url> {
	let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), segment.trim_start_matches('/'));
	Url::parse(&joined).with_context(|| format!("cannot build URL from {}", joined))
}

fn merge_tables(into: &mut toml::Table, from: toml::Table) {
	for (key, value) in from {
		match (into.get_mut(&key), value) {
			(Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
				merge_tables(existing, incoming);
			},
			(_, value) => {
				into.insert(key, value);
			},
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn defaults_match_the_deployed_frontend() {
		let config = ClientConfig::default();
		assert_eq!(config.api_base_url.as_str(), "http://localhost:5000/");
		assert_eq!(config.request_timeout(), Duration::from_secs(10));
		assert_eq!(config.reconnection.attempts, 5);
		assert_eq!(config.reconnection.delay(), Duration::from_secs(1));
		assert_eq!(config.transports, vec![TransportKind::WebSocket, TransportKind::Polling]);
		assert_eq!(config.rest_base_url().unwrap().as_str(), "http://localhost:5000/api");
	}

	#[test]
	fn partial_toml_keeps_defaults() {
		let config = ClientConfig::from_toml_str(r#"
			socket_url = "http://events.local:5001"
			transports = ["polling"]

			[reconnection]
			attempts = 8
		"#).unwrap();
		assert_eq!(config.socket_url.as_str(), "http://events.local:5001/");
		assert_eq!(config.transports, vec![TransportKind::Polling]);
		assert_eq!(config.reconnection.attempts, 8);
		assert_eq!(config.reconnection.delay_ms, 1_000);
		assert_eq!(config.occupancy.tolerance, 100);
	}

	#[test]
	fn later_files_override_earlier_ones() {
		let mut first = tempfile::NamedTempFile::new().unwrap();
		writeln!(first, "request_timeout_ms = 2000\n[reconnection]\nattempts = 2\ndelay_ms = 250").unwrap();
		let mut second = tempfile::NamedTempFile::new().unwrap();
		writeln!(second, "[reconnection]\nattempts = 3").unwrap();

		let paths = [first.path().to_str().unwrap(), second.path().to_str().unwrap()];
		let config = ClientConfig::read_config(&paths).unwrap();
		assert_eq!(config.request_timeout_ms, 2000);
		assert_eq!(config.reconnection.attempts, 3);
		assert_eq!(config.reconnection.delay_ms, 250);
	}

	#[test]
	fn missing_file_is_an_error() {
		assert!(ClientConfig::read_config(&["/nonexistent/occupancy-client.toml"]).is_err());
	}

	#[test]
	fn environment_overrides_addresses() {
		let mut config = ClientConfig::default();
		config.apply_env(|key| match key {
			ENV_API_BASE_URL => Some("http://10.1.1.4:8080".to_string()),
			_ => None,
		}).unwrap();
		assert_eq!(config.api_base_url.as_str(), "http://10.1.1.4:8080/");
		assert_eq!(config.socket_url.as_str(), "http://localhost:5000/");

		let err = config.apply_env(|_| Some("not a url".to_string()));
		assert!(err.is_err());
	}
}
