use std::sync::Arc;

use chrono::Utc;
use log::{error, info};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::common::{Camera, CameraDraft, CameraId, CameraList, OccupancyReport, OccupancyStat, OccupancyThresholds};
use crate::config::ClientConfig;
use crate::error::{ApiError, ApiResult};
use crate::transport::Transport;



/// Result of a collection read. A failed read still hands back something
/// renderable, but says so.
#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub enum Snapshot<T> {
	Fresh(T),
	Degraded { data: T, error: ApiError },
}

impl<T> Snapshot<T> {
	pub fn is_degraded(&self) -> bool {
		matches!(self, Snapshot::Degraded { .. })
	}

	pub fn data(&self) -> &T {
		match self {
			Snapshot::Fresh(data) => data,
			Snapshot::Degraded { data, .. } => data,
		}
	}

	pub fn error(&self) -> Option<&ApiError> {
		match self {
			Snapshot::Fresh(_) => None,
			Snapshot::Degraded { error, .. } => Some(error),
		}
	}

	pub fn into_data(self) -> T {
		match self {
			Snapshot::Fresh(data) => data,
			Snapshot::Degraded { data, .. } => data,
		}
	}

	/// Drops the fallback data of a degraded read.
	pub fn into_result(self) -> ApiResult<T> {
		match self {
			Snapshot::Fresh(data) => Ok(data),
			Snapshot::Degraded { error, .. } => Err(error),
		}
	}
}

/// Body of `POST /cameras`.
#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize)]
pub struct NewCameraPayload {
	pub name: String,
	pub rtsp_url: String,
	pub area_name: String,
	pub max_capacity: u32,
	pub is_active: bool,
}

impl NewCameraPayload {
	pub fn from_draft(draft: &CameraDraft) -> ApiResult<NewCameraPayload> {
		let name = required(&draft.name, "name")?;
		let rtsp_url = required(&draft.rtsp, "rtsp")?;
		Ok(NewCameraPayload {
			name,
			rtsp_url,
			area_name: draft.area.clone().unwrap_or_default(),
			max_capacity: draft.max_cap.normalize(),
			is_active: true,
		})
	}
}

/// Body of `PUT /cameras/{id}`: only the fields the draft carries.
#[derive(Clone)]
#[derive(Debug, Default, PartialEq)]
#[derive(Serialize)]
pub struct CameraPatch {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rtsp_url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub area_name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_capacity: Option<u32>,
}

impl CameraPatch {
	pub fn from_draft(draft: &CameraDraft) -> CameraPatch {
		CameraPatch {
			name: draft.name.clone(),
			rtsp_url: draft.rtsp.clone(),
			area_name: draft.area.clone(),
			max_capacity: if draft.max_cap.is_missing() { None } else { Some(draft.max_cap.normalize()) },
		}
	}
}

fn required(field: &Option<String>, label: &str) -> ApiResult<String> {
	match field.as_deref().map(str::trim) {
		Some(value) if !value.is_empty() => Ok(value.to_string()),
		_ => Err(ApiError::Invalid(format!("camera {} is required", label))),
	}
}

/// Typed access to the camera and occupancy resources.
#[derive(Clone)]
pub struct CameraGateway {
	transport: Arc<dyn Transport>,
	api_base_url: Url,
	thresholds: OccupancyThresholds,
}

impl CameraGateway {
	pub fn new(transport: Arc<dyn Transport>, config: &ClientConfig) -> CameraGateway {
		CameraGateway {
			transport,
			api_base_url: config.api_base_url.clone(),
			thresholds: config.occupancy.thresholds(),
		}
	}

	pub fn thresholds(&self) -> &OccupancyThresholds {
		&self.thresholds
	}

	pub async fn list_cameras(&self) -> Snapshot<CameraList> {
		let result = self.transport
			.request(Method::GET, "/cameras", None)
			.await
			.and_then(|payload| decode_list::<Camera>(payload, "camera list"));
		match result {
			Ok(cameras) => Snapshot::Fresh(cameras),
			Err(err) => {
				error!("Failed to load cameras; error was {}", err);
				Snapshot::Degraded { data: Vec::new(), error: err }
			}
		}
	}

	pub async fn get_camera(&self, id: CameraId) -> ApiResult<Camera> {
		let payload = self.transport
			.request(Method::GET, &format!("/cameras/{}", id), None)
			.await
			.map_err(|err| not_found_for(err, id))?;
		decode(payload, "camera")
	}

	pub async fn add_camera(&self, draft: &CameraDraft) -> ApiResult<Camera> {
		let payload = NewCameraPayload::from_draft(draft)?;
		let body = serde_json::to_value(&payload)
			.map_err(|e| ApiError::Invalid(e.to_string()))?;
		let created = self.transport.request(Method::POST, "/cameras", Some(body)).await?;
		let camera: Camera = decode(created, "created camera")?;
		info!("Camera created: {}", camera.uuid);
		Ok(camera)
	}

	pub async fn update_camera(&self, id: CameraId, draft: &CameraDraft) -> ApiResult<Camera> {
		let body = serde_json::to_value(CameraPatch::from_draft(draft))
			.map_err(|e| ApiError::Invalid(e.to_string()))?;
		let updated = self.transport
			.request(Method::PUT, &format!("/cameras/{}", id), Some(body))
			.await
			.map_err(|err| not_found_for(err, id))?;
		decode(updated, "updated camera")
	}

	/// Deleting something that is already gone counts as acknowledged.
	pub async fn delete_camera(&self, id: CameraId) -> ApiResult<bool> {
		match self.transport.request(Method::DELETE, &format!("/cameras/{}", id), None).await {
			Ok(body) => Ok(body.get("success").and_then(Value::as_bool).unwrap_or(true)),
			Err(err) if err.is_not_found() => {
				info!("Camera {} was already deleted", id);
				Ok(true)
			},
			Err(err) => Err(err),
		}
	}

	/// Occupancy records as sent, before capacity and status are resolved.
	pub async fn occupancy_reports(&self) -> ApiResult<Vec<OccupancyReport>> {
		let payload = self.transport.request(Method::GET, "/occupancy/stats", None).await?;
		decode_list(payload, "occupancy stats")
	}

	pub async fn get_occupancy_stats(&self) -> Snapshot<Vec<OccupancyStat>> {
		match self.occupancy_reports().await {
			Ok(reports) => {
				let received_at = Utc::now();
				Snapshot::Fresh(reports
					.into_iter()
					.map(|report| report.into_stat(received_at, None, &self.thresholds))
					.collect())
			},
			Err(err) => {
				error!("Failed to load occupancy stats; error was {}", err);
				Snapshot::Degraded { data: Vec::new(), error: err }
			}
		}
	}

	/// Address of the MJPEG feed for a camera. Nothing is fetched.
	pub fn stream_url_for(&self, camera_uuid: &str) -> String {
		format!("{}/video_feed/{}", self.api_base_url.as_str().trim_end_matches('/'), camera_uuid)
	}
}

fn not_found_for(err: ApiError, id: CameraId) -> ApiError {
	if err.is_not_found() {
		ApiError::NotFound(format!("camera {}", id))
	} else {
		err
	}
}

fn decode<T: DeserializeOwned>(payload: Value, what: &str) -> ApiResult<T> {
	serde_json::from_value(payload)
		.map_err(|e| ApiError::Malformed(format!("unexpected {} shape: {}", what, e)))
}

// A missing collection reads as empty.
fn decode_list<T: DeserializeOwned>(payload: Value, what: &str) -> ApiResult<Vec<T>> {
	match payload {
		Value::Null => Ok(Vec::new()),
		payload => decode(payload, what),
	}
}
