//! HTTP request/response pipeline used by the REST gateway.

use std::time::Duration;

use async_trait::async_trait;
use log::error;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ApiError, ApiResult};


/// One configured request pipeline. Paths are relative to the REST root,
/// e.g. `/cameras/3`.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn request(&self, method: Method, path: &str, body: Option<Value>) -> ApiResult<Value>;
}

pub struct HttpTransport {
	client: Client,
	base_url: Url,
	timeout: Duration,
}

impl HttpTransport {
	pub fn new(base_url: Url, timeout: Duration) -> ApiResult<HttpTransport> {
		let client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| ApiError::Network(format!("cannot build HTTP client: {}", e)))?;
		Ok(HttpTransport { client, base_url, timeout })
	}

	pub fn from_config(config: &ClientConfig) -> anyhow::Result<HttpTransport> {
		Ok(HttpTransport::new(config.rest_base_url()?, config.request_timeout())?)
	}

	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	fn url_for(&self, path: &str) -> ApiResult<Url> {
		crate::config::join_path(&self.base_url, path)
			.map_err(|e| ApiError::Invalid(e.to_string()))
	}

	async fn send(&self, method: Method, path: &str, body: Option<Value>) -> ApiResult<Value> {
		let url = self.url_for(path)?;
		let mut request = self.client
			.request(method, url)
			.timeout(self.timeout)
			.header(reqwest::header::ACCEPT, "application/json");
		if let Some(body) = body {
			request = request.json(&body);
		}

		let response = request.send().await.map_err(normalize)?;
		let status = response.status();
		let text = response.text().await.map_err(normalize)?;

		if !status.is_success() {
			return Err(ApiError::ServerError {
				status: status.as_u16(),
				message: error_message(status, &text),
			});
		}

		let body: Value = serde_json::from_str(&text)
			.map_err(|e| ApiError::Malformed(format!("response is not JSON: {}", e)))?;
		Ok(unwrap_envelope(body))
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn request(&self, method: Method, path: &str, body: Option<Value>) -> ApiResult<Value> {
		let result = self.send(method.clone(), path, body).await;
		if let Err(err) = &result {
			match err.status() {
				Some(status) => error!("{} {} failed with status {}: {}", method, path, status, err),
				None => error!("{} {} failed: {}", method, path, err),
			}
		}
		result
	}
}

fn normalize(err: reqwest::Error) -> ApiError {
	if err.is_timeout() {
		ApiError::Timeout
	} else if err.is_decode() {
		ApiError::Malformed(err.to_string())
	} else {
		ApiError::Network(err.to_string())
	}
}

/// `{success, data}` bodies yield `data`; anything else is returned whole.
pub fn unwrap_envelope(body: Value) -> Value {
	match body {
		Value::Object(mut fields) if fields.contains_key("data") => {
			fields.remove("data").unwrap_or(Value::Null)
		},
		other => other,
	}
}

fn error_message(status: StatusCode, text: &str) -> String {
	let from_json = serde_json::from_str::<Value>(text).ok().and_then(|body| {
		["error", "message", "reason"]
			.iter()
			.find_map(|key| body.get(*key).and_then(Value::as_str).map(str::to_string))
	});
	match from_json {
		Some(message) => message,
		None if !text.trim().is_empty() => text.trim().chars().take(200).collect(),
		None => status.canonical_reason().unwrap_or("unknown status").to_string(),
	}
}



/// In-process stand-in for the backend's camera and occupancy resources.
#[cfg(test)]
pub(crate) mod memory {
	use std::collections::{BTreeMap, VecDeque};
	use std::sync::Mutex;

	use super::*;
	use serde_json::json;

	pub(crate) type Recorded = (Method, String, Option<Value>);

	pub(crate) struct MemoryBackend {
		state: Mutex<State>,
	}

	struct State {
		cameras: BTreeMap<u64, Value>,
		stats: Value,
		next_id: u64,
		requests: Vec<Recorded>,
		failures: VecDeque<ApiError>,
		offline: bool,
	}

	impl MemoryBackend {
		pub(crate) fn new() -> MemoryBackend {
			MemoryBackend {
				state: Mutex::new(State {
					cameras: BTreeMap::new(),
					stats: json!([]),
					next_id: 1,
					requests: Vec::new(),
					failures: VecDeque::new(),
					offline: false,
				}),
			}
		}

		pub(crate) fn insert_camera(&self, id: u64, uuid: &str, name: &str, max_capacity: u32) {
			let mut state = self.state.lock().unwrap();
			state.cameras.insert(id, json!({
				"id": id,
				"camera_uuid": uuid,
				"name": name,
				"rtsp_url": format!("rtsp://cameras.local/{}", uuid),
				"area_name": "",
				"max_capacity": max_capacity,
				"is_active": true
			}));
			state.next_id = state.next_id.max(id + 1);
		}

		pub(crate) fn set_stats(&self, stats: Value) {
			self.state.lock().unwrap().stats = stats;
		}

		pub(crate) fn fail_next(&self, err: ApiError) {
			self.state.lock().unwrap().failures.push_back(err);
		}

		pub(crate) fn set_offline(&self, offline: bool) {
			self.state.lock().unwrap().offline = offline;
		}

		pub(crate) fn requests(&self) -> Vec<Recorded> {
			self.state.lock().unwrap().requests.clone()
		}

		pub(crate) fn count(&self, method: Method, path: &str) -> usize {
			self.state.lock().unwrap().requests
				.iter()
				.filter(|(m, p, _)| *m == method && p == path)
				.count()
		}
	}

	#[async_trait]
	impl Transport for MemoryBackend {
		async fn request(&self, method: Method, path: &str, body: Option<Value>) -> ApiResult<Value> {
			let mut state = self.state.lock().unwrap();
			state.requests.push((method.clone(), path.to_string(), body.clone()));
			if state.offline {
				return Err(ApiError::Network("backend offline".into()));
			}
			if let Some(err) = state.failures.pop_front() {
				return Err(err);
			}

			let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
			let id = segments.get(1).and_then(|s| s.parse::<u64>().ok());
			let not_found = |id: u64| ApiError::ServerError { status: 404, message: format!("Camera ID {} not found", id) };

			match (method.as_str(), segments.as_slice(), id) {
				("GET", ["cameras"], _) => Ok(Value::Array(state.cameras.values().cloned().collect())),
				("GET", ["cameras", _], Some(id)) => state.cameras.get(&id).cloned().ok_or_else(|| not_found(id)),
				("POST", ["cameras"], _) => {
					let id = state.next_id;
					state.next_id += 1;
					let mut camera = body.unwrap_or_else(|| json!({}));
					camera["id"] = json!(id);
					camera["camera_uuid"] = json!(format!("CAM-{:08X}", id));
					state.cameras.insert(id, camera.clone());
					Ok(camera)
				},
				("PUT", ["cameras", _], Some(id)) => {
					let camera = state.cameras.get_mut(&id).ok_or_else(|| not_found(id))?;
					if let (Some(fields), Some(Value::Object(patch))) = (camera.as_object_mut(), body) {
						fields.extend(patch);
					}
					Ok(camera.clone())
				},
				("DELETE", ["cameras", _], Some(id)) => {
					state.cameras.remove(&id).ok_or_else(|| not_found(id))?;
					Ok(json!({"success": true, "message": "Camera deleted"}))
				},
				("GET", ["occupancy", "stats"], _) => Ok(state.stats.clone()),
				_ => Err(ApiError::ServerError { status: 404, message: format!("no route for {}", path) }),
			}
		}
	}
}
