use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::{Deserialize, Deserializer};
use serde_json::Value;



pub type CameraId = u64;
pub type CameraUuid = String;
pub type CameraList = Vec<Camera>;
pub type CameraMap = HashMap<CameraId, Camera>;
pub type Timestamp = DateTime<Utc>;

pub const DEFAULT_MAX_CAPACITY: u32 = 10;

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct Camera {
	pub id: CameraId,
	#[serde(rename = "camera_uuid")]
	pub uuid: CameraUuid,
	pub name: String,
	#[serde(default, deserialize_with = "nullable_string")]
	pub rtsp_url: String,
	#[serde(default, deserialize_with = "nullable_string")]
	pub area_name: String,
	#[serde(default = "default_max_capacity", deserialize_with = "lenient_capacity")]
	pub max_capacity: u32,
	#[serde(default = "default_active", deserialize_with = "nullable_active")]
	pub is_active: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_at: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<String>,
}

impl Camera {
	/// Stand-in for a camera that only the realtime channel knows about so far.
	/// Id 0 is never handed out by the server.
	pub fn placeholder(uuid: &str, name: Option<&str>, area_name: Option<&str>, max_capacity: Option<u32>) -> Camera {
		Camera {
			id: 0,
			uuid: uuid.to_string(),
			name: name.unwrap_or(uuid).to_string(),
			rtsp_url: String::new(),
			area_name: area_name.unwrap_or_default().to_string(),
			max_capacity: max_capacity.filter(|cap| *cap > 0).unwrap_or(DEFAULT_MAX_CAPACITY),
			is_active: true,
			created_at: None,
			updated_at: None,
		}
	}
}

/// Capacity as typed into a form: a number, some text, or nothing at all.
#[derive(Clone)]
#[derive(Debug, Default, PartialEq)]
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapacityInput {
	Number(f64),
	Text(String),
	#[default]
	Missing,
}

impl CapacityInput {
	pub fn is_missing(&self) -> bool {
		matches!(self, CapacityInput::Missing)
	}

	/// Always a positive integer; anything unusable becomes `DEFAULT_MAX_CAPACITY`.
	pub fn normalize(&self) -> u32 {
		let parsed = match self {
			CapacityInput::Number(n) if n.is_finite() => Some(n.trunc()),
			CapacityInput::Number(_) => None,
			CapacityInput::Text(text) => leading_integer(text).map(|n| n as f64),
			CapacityInput::Missing => None,
		};
		match parsed {
			Some(n) if n >= 1.0 && n <= u32::MAX as f64 => n as u32,
			_ => DEFAULT_MAX_CAPACITY,
		}
	}

	fn from_value(value: &Value) -> CapacityInput {
		match value {
			Value::Number(n) => n.as_f64().map(CapacityInput::Number).unwrap_or(CapacityInput::Missing),
			Value::String(s) => CapacityInput::Text(s.clone()),
			_ => CapacityInput::Missing,
		}
	}
}

impl From<u32> for CapacityInput {
	fn from(n: u32) -> Self {
		CapacityInput::Number(n as f64)
	}
}

impl From<i64> for CapacityInput {
	fn from(n: i64) -> Self {
		CapacityInput::Number(n as f64)
	}
}

impl From<&str> for CapacityInput {
	fn from(s: &str) -> Self {
		CapacityInput::Text(s.to_string())
	}
}

impl From<String> for CapacityInput {
	fn from(s: String) -> Self {
		CapacityInput::Text(s)
	}
}

// Leading integer of the trimmed text, the way a form's parseInt reads it.
fn leading_integer(text: &str) -> Option<i64> {
	let text = text.trim_start();
	let (sign, digits) = match text.as_bytes().first() {
		Some(b'-') => (-1, &text[1..]),
		Some(b'+') => (1, &text[1..]),
		_ => (1, text),
	};
	let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
	if end == 0 {
		return None;
	}
	digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

/// Camera fields in the vocabulary of the settings form.
#[derive(Clone)]
#[derive(Debug, Default, PartialEq)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDraft {
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub rtsp: Option<String>,
	#[serde(default)]
	pub area: Option<String>,
	#[serde(default)]
	pub max_cap: CapacityInput,
}

impl CameraDraft {
	pub fn new(name: &str, rtsp: &str) -> CameraDraft {
		CameraDraft {
			name: Some(name.to_string()),
			rtsp: Some(rtsp.to_string()),
			..CameraDraft::default()
		}
	}

	pub fn area(mut self, area: &str) -> CameraDraft {
		self.area = Some(area.to_string());
		self
	}

	pub fn max_cap(mut self, max_cap: impl Into<CapacityInput>) -> CameraDraft {
		self.max_cap = max_cap.into();
		self
	}
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccupancyStatus {
	Normal,
	Warning,
	Violation,
}

impl OccupancyStatus {
	pub fn classify(count: u32, capacity: u32, thresholds: &OccupancyThresholds) -> OccupancyStatus {
		if capacity == 0 {
			return OccupancyStatus::Normal;
		}
		let percent = count as f64 * 100.0 / capacity as f64;
		if percent >= thresholds.violation_percent as f64 {
			OccupancyStatus::Violation
		} else if percent >= thresholds.warning_percent as f64 {
			OccupancyStatus::Warning
		} else {
			OccupancyStatus::Normal
		}
	}

	fn parse(text: &str) -> Option<OccupancyStatus> {
		match text.to_ascii_uppercase().as_str() {
			"NORMAL" => Some(OccupancyStatus::Normal),
			"WARNING" => Some(OccupancyStatus::Warning),
			"VIOLATION" => Some(OccupancyStatus::Violation),
			_ => None,
		}
	}
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancyThresholds {
	pub warning_percent: u32,
	pub violation_percent: u32,
}

impl Default for OccupancyThresholds {
	fn default() -> Self {
		OccupancyThresholds { warning_percent: 80, violation_percent: 100 }
	}
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct OccupancyStat {
	pub camera_uuid: CameraUuid,
	pub current_count: u32,
	pub capacity: u32,
	pub status: OccupancyStatus,
	pub is_connected: bool,
	pub timestamp: Timestamp,
	/// `timestamp` came from the local clock, not the server's.
	#[serde(default)]
	pub client_stamped: bool,
}

impl OccupancyStat {
	pub fn empty(camera: &Camera, at: Timestamp) -> OccupancyStat {
		OccupancyStat {
			camera_uuid: camera.uuid.clone(),
			current_count: 0,
			capacity: camera.max_capacity,
			status: OccupancyStatus::Normal,
			is_connected: false,
			timestamp: at,
			client_stamped: true,
		}
	}

	/// Last writer wins by server timestamp. Local and server clocks are not
	/// comparable, so a client-stamped side always yields to the newer arrival.
	pub fn supersedes(&self, stored: &OccupancyStat) -> bool {
		self.client_stamped || stored.client_stamped || self.timestamp >= stored.timestamp
	}
}

/// One camera's occupancy as the server reports it, either in a stats
/// listing or pushed as an `occupancy_update`.
#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Deserialize)]
pub struct OccupancyReport {
	#[serde(alias = "cameraId", alias = "camera_id")]
	pub camera_uuid: CameraUuid,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub area_name: Option<String>,
	#[serde(default, alias = "count", deserialize_with = "lenient_count")]
	pub current_count: u32,
	#[serde(default, deserialize_with = "optional_capacity")]
	pub max_capacity: Option<u32>,
	#[serde(default)]
	pub status: Option<String>,
	#[serde(default)]
	pub is_connected: Option<bool>,
	#[serde(default, deserialize_with = "timestamp::deserialize_optional")]
	pub timestamp: Option<Timestamp>,
}

impl OccupancyReport {
	/// `received_at` stands in for a missing timestamp; `capacity` is the
	/// owning camera's capacity when one is known.
	pub fn into_stat(self, received_at: Timestamp, capacity: Option<u32>, thresholds: &OccupancyThresholds) -> OccupancyStat {
		let capacity = capacity
			.or(self.max_capacity)
			.unwrap_or(DEFAULT_MAX_CAPACITY);
		let status = self.status
			.as_deref()
			.and_then(OccupancyStatus::parse)
			.unwrap_or_else(|| OccupancyStatus::classify(self.current_count, capacity, thresholds));
		OccupancyStat {
			camera_uuid: self.camera_uuid,
			current_count: self.current_count,
			capacity,
			status,
			is_connected: self.is_connected.unwrap_or(false),
			client_stamped: self.timestamp.is_none(),
			timestamp: self.timestamp.unwrap_or(received_at),
		}
	}
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Deserialize)]
pub struct CameraStatusUpdate {
	#[serde(alias = "cameraId", alias = "camera_id")]
	pub camera_uuid: CameraUuid,
	#[serde(alias = "isActive")]
	pub is_active: bool,
}



fn default_max_capacity() -> u32 {
	DEFAULT_MAX_CAPACITY
}

fn default_active() -> bool {
	true
}

fn nullable_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
	Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn nullable_active<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
	Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(true))
}

fn lenient_capacity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
	let value = Value::deserialize(deserializer)?;
	Ok(CapacityInput::from_value(&value).normalize())
}

fn optional_capacity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
	let value = Value::deserialize(deserializer)?;
	let input = CapacityInput::from_value(&value);
	Ok(if input.is_missing() { None } else { Some(input.normalize()) })
}

// Counts are never negative; garbage reads as zero.
fn lenient_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
	let value = Value::deserialize(deserializer)?;
	let count = match &value {
		Value::Number(n) => n.as_f64().unwrap_or(0.0),
		Value::String(s) => leading_integer(s).unwrap_or(0) as f64,
		_ => 0.0,
	};
	Ok(if count.is_finite() && count > 0.0 { count.min(u32::MAX as f64) as u32 } else { 0 })
}

pub mod timestamp {
	use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
	use serde::de::{Deserialize, Deserializer};
	use serde_json::Value;

	use super::Timestamp;

	/// RFC 3339, naive ISO-8601 (server local time), or epoch seconds.
	pub fn parse(value: &Value) -> Option<Timestamp> {
		match value {
			Value::String(text) => parse_str(text),
			Value::Number(n) => {
				let secs = n.as_f64()?;
				if !secs.is_finite() {
					return None;
				}
				let whole = secs.floor();
				let nanos = ((secs - whole) * 1e9) as u32;
				Utc.timestamp_opt(whole as i64, nanos).single()
			},
			_ => None,
		}
	}

	pub fn parse_str(text: &str) -> Option<Timestamp> {
		let text = text.trim();
		if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
			return Some(parsed.with_timezone(&Utc));
		}
		["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
			.iter()
			.find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
			.map(from_local)
	}

	// A local time skipped by a DST jump has no instant; read it as UTC.
	fn from_local(naive: NaiveDateTime) -> Timestamp {
		match Local.from_local_datetime(&naive).earliest() {
			Some(local) => local.with_timezone(&Utc),
			None => Utc.from_utc_datetime(&naive),
		}
	}

	pub fn deserialize_optional<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Timestamp>, D::Error> {
		let value = Value::deserialize(deserializer)?;
		Ok(parse(&value))
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use chrono::{Local, TimeZone};
	use serde_json::json;

	#[test]
	fn capacity_coercion_follows_form_rules() {
		assert_eq!(CapacityInput::from("abc").normalize(), 10);
		assert_eq!(CapacityInput::from("25").normalize(), 25);
		assert_eq!(CapacityInput::from(" 12 people").normalize(), 12);
		assert_eq!(CapacityInput::from("0").normalize(), 10);
		assert_eq!(CapacityInput::from("-4").normalize(), 10);
		assert_eq!(CapacityInput::from("99999999999999999999999").normalize(), 10);
		assert_eq!(CapacityInput::from(5u32).normalize(), 5);
		assert_eq!(CapacityInput::Number(7.9).normalize(), 7);
		assert_eq!(CapacityInput::Missing.normalize(), 10);
	}

	#[test]
	fn draft_reads_form_json() {
		let draft: CameraDraft = serde_json::from_value(json!({
			"name": "Cam1", "rtsp": "rtsp://x", "area": "Zone1", "maxCap": "25"
		})).unwrap();
		assert_eq!(draft, CameraDraft::new("Cam1", "rtsp://x").area("Zone1").max_cap("25"));

		let bare: CameraDraft = serde_json::from_value(json!({"name": "Cam2"})).unwrap();
		assert!(bare.max_cap.is_missing());
		assert_eq!(bare.rtsp, None);
	}

	#[test]
	fn camera_decodes_server_record() {
		let camera: Camera = serde_json::from_value(json!({
			"id": 3,
			"camera_uuid": "CAM-1A2B3C4D",
			"name": "Gate",
			"rtsp_url": "rtsp://10.0.0.5/stream",
			"area_name": null,
			"max_capacity": "lots",
			"is_active": false,
			"created_at": "2025-01-02T03:04:05",
			"updated_at": null
		})).unwrap();
		assert_eq!(camera.id, 3);
		assert_eq!(camera.uuid, "CAM-1A2B3C4D");
		assert_eq!(camera.area_name, "");
		assert_eq!(camera.max_capacity, 10);
		assert!(!camera.is_active);
		assert_eq!(camera.updated_at, None);
	}

	#[test]
	fn camera_defaults_missing_fields() {
		let camera: Camera = serde_json::from_value(json!({
			"id": 1, "camera_uuid": "CAM-1", "name": "Hall"
		})).unwrap();
		assert_eq!(camera.max_capacity, 10);
		assert!(camera.is_active);
	}

	#[test]
	fn status_thresholds() {
		let thresholds = OccupancyThresholds::default();
		assert_eq!(OccupancyStatus::classify(7, 10, &thresholds), OccupancyStatus::Normal);
		assert_eq!(OccupancyStatus::classify(8, 10, &thresholds), OccupancyStatus::Warning);
		assert_eq!(OccupancyStatus::classify(10, 10, &thresholds), OccupancyStatus::Violation);
		assert_eq!(OccupancyStatus::classify(50, 0, &thresholds), OccupancyStatus::Normal);
	}

	#[test]
	fn report_falls_back_for_missing_fields() {
		let received = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
		let report: OccupancyReport = serde_json::from_value(json!({
			"camera_uuid": "CAM-1",
			"current_count": 9,
			"max_capacity": 10,
			"status": "WARNING",
			"is_connected": true,
			"timestamp": null
		})).unwrap();
		let stat = report.into_stat(received, None, &OccupancyThresholds::default());
		assert_eq!(stat.timestamp, received);
		assert!(stat.client_stamped);
		assert_eq!(stat.capacity, 10);
		assert_eq!(stat.status, OccupancyStatus::Warning);
		assert!(stat.is_connected);

		let pushed: OccupancyReport = serde_json::from_value(json!({
			"cameraId": "CAM-2", "count": -3, "timestamp": "2025-03-01T11:59:00"
		})).unwrap();
		let stat = pushed.into_stat(received, Some(4), &OccupancyThresholds::default());
		assert_eq!(stat.current_count, 0);
		assert_eq!(stat.capacity, 4);
		assert_eq!(stat.status, OccupancyStatus::Normal);
		assert_eq!(stat.timestamp, Local.with_ymd_and_hms(2025, 3, 1, 11, 59, 0).unwrap().with_timezone(&Utc));
		assert!(!stat.client_stamped);
	}

	#[test]
	fn client_stamped_stats_yield_to_any_server_report() {
		let camera = Camera::placeholder("CAM-1", None, None, Some(10));
		let now = Utc::now();
		let synthesized = OccupancyStat::empty(&camera, now);
		let behind: OccupancyReport = serde_json::from_value(json!({
			"camera_uuid": "CAM-1", "count": 3, "timestamp": (now - chrono::Duration::hours(3)).to_rfc3339()
		})).unwrap();
		let behind = behind.into_stat(now, None, &OccupancyThresholds::default());
		assert!(behind.supersedes(&synthesized));

		let older = OccupancyStat { timestamp: behind.timestamp - chrono::Duration::seconds(1), ..behind.clone() };
		assert!(!older.supersedes(&behind));
		assert!(behind.supersedes(&behind.clone()));
	}

	#[test]
	fn timestamps_in_every_wire_shape() {
		let local = Local.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap().with_timezone(&Utc);
		assert_eq!(timestamp::parse(&json!("2025-03-01T08:30:00")), Some(local));
		assert_eq!(timestamp::parse(&json!("2025-03-01 08:30:00.000")), Some(local));

		let expected = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap();
		assert_eq!(timestamp::parse(&json!("2025-03-01T10:30:00+02:00")), Some(expected));
		assert_eq!(timestamp::parse(&json!(expected.timestamp())), Some(expected));
		assert_eq!(timestamp::parse(&json!("yesterday")), None);
		assert_eq!(timestamp::parse(&Value::Null), None);
	}
}
