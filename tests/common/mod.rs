//! In-process stand-ins for the backend: the camera REST surface on rocket
//! and a minimal Socket.IO server on tokio-tungstenite.

#![allow(dead_code)]

use std::cmp;
use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::State;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use mqc_occupancy_client::common::{Camera, CameraId, CameraMap};


pub struct Backend {
	cameras: RwLock<CameraMap>,
	stats: RwLock<Vec<Value>>,
}

type Reply = (Status, Value);

fn not_found_reply(id: CameraId) -> Reply {
	(Status::NotFound, json!({"success": false, "error": format!("Camera ID {} not found", id)}))
}

#[rocket::get("/cameras")]
async fn list_cameras(backend: &State<Backend>) -> Value {
	let cameras = backend.cameras.read().await;
	let mut list: Vec<Camera> = cameras.values().cloned().collect();
	list.sort_by_key(|camera| camera.id);
	json!({"success": true, "data": list})
}

#[rocket::get("/cameras/<id>")]
async fn get_camera(id: CameraId, backend: &State<Backend>) -> Reply {
	let cameras = backend.cameras.read().await;
	match cameras.get(&id) {
		Some(camera) => (Status::Ok, json!({"success": true, "data": camera})),
		None => not_found_reply(id),
	}
}

#[rocket::post("/cameras", data = "<body>")]
async fn new_camera(body: Json<Value>, backend: &State<Backend>) -> Reply {
	let mut cameras = backend.cameras.write().await;
	let id = next_camera_id(&cameras);
	let mut record = body.into_inner();
	record["id"] = json!(id);
	record["camera_uuid"] = json!(format!("CAM-{:08X}", id));
	match serde_json::from_value::<Camera>(record) {
		Ok(camera) => {
			cameras.insert(id, camera.clone());
			(Status::Created, json!({"success": true, "data": camera}))
		},
		Err(err) => (Status::BadRequest, json!({"success": false, "error": err.to_string()})),
	}
}

#[rocket::put("/cameras/<id>", data = "<body>")]
async fn update_camera(id: CameraId, body: Json<Value>, backend: &State<Backend>) -> Reply {
	let mut cameras = backend.cameras.write().await;
	let Some(camera) = cameras.get_mut(&id) else {
		return not_found_reply(id);
	};
	let patch = body.into_inner();
	if let Some(name) = patch.get("name").and_then(Value::as_str) {
		camera.name = name.to_string();
	}
	if let Some(rtsp_url) = patch.get("rtsp_url").and_then(Value::as_str) {
		camera.rtsp_url = rtsp_url.to_string();
	}
	if let Some(area_name) = patch.get("area_name").and_then(Value::as_str) {
		camera.area_name = area_name.to_string();
	}
	if let Some(max_capacity) = patch.get("max_capacity").and_then(Value::as_u64) {
		camera.max_capacity = max_capacity as u32;
	}
	(Status::Ok, json!({"success": true, "data": camera}))
}

#[rocket::delete("/cameras/<id>")]
async fn delete_camera(id: CameraId, backend: &State<Backend>) -> Reply {
	let mut cameras = backend.cameras.write().await;
	match cameras.remove(&id) {
		Some(_) => (Status::Ok, json!({"success": true, "message": "Camera deleted"})),
		None => not_found_reply(id),
	}
}

#[rocket::get("/occupancy/stats")]
async fn occupancy_stats(backend: &State<Backend>) -> Value {
	let stats = backend.stats.read().await;
	json!({"success": true, "data": *stats})
}

#[rocket::get("/slow")]
async fn slow() -> Value {
	tokio::time::sleep(Duration::from_secs(3)).await;
	json!({"success": true, "data": []})
}

#[rocket::get("/plain")]
fn plain() -> &'static str {
	"<html>maintenance</html>"
}

#[rocket::get("/broken")]
fn broken() -> Reply {
	(Status::InternalServerError, json!({"success": false, "error": "Database unavailable"}))
}

#[rocket::catch(404)]
fn not_found() -> Value {
	json!({
		"success": false,
		"error": "Resource was not found."
	})
}

fn next_camera_id(cameras: &CameraMap) -> CameraId {
	let mut highest_id: CameraId = 0;
	for id in cameras.keys() {
		highest_id = cmp::max(highest_id, *id);
	}
	highest_id + 1
}

pub fn free_port() -> u16 {
	let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
	listener.local_addr().unwrap().port()
}

pub struct MockBackend {
	pub base_url: Url,
	shutdown: rocket::Shutdown,
}

impl MockBackend {
	/// Serves `cameras` and `stats` under `/api` on a free local port.
	pub async fn launch(cameras: Vec<Camera>, stats: Vec<Value>) -> MockBackend {
		let port = free_port();
		let backend = Backend {
			cameras: RwLock::new(cameras.into_iter().map(|camera| (camera.id, camera)).collect()),
			stats: RwLock::new(stats),
		};
		let rocket = rocket_on(port)
			.manage(backend)
			.register("/", rocket::catchers![not_found])
			.mount("/api", rocket::routes![
				list_cameras,
				get_camera,
				new_camera,
				update_camera,
				delete_camera,
				occupancy_stats,
				slow,
				plain,
				broken,
			]);
		let (base_url, shutdown) = serve(rocket, port).await;
		MockBackend { base_url, shutdown }
	}
}

/// Quiet rocket bound to `127.0.0.1:port`.
pub fn rocket_on(port: u16) -> rocket::Rocket<rocket::Build> {
	let figment = rocket::Config::figment()
		.merge(("port", port))
		.merge(("address", "127.0.0.1"))
		.merge(("log_level", "off"));
	rocket::custom(figment)
}

/// Launches `rocket` in the background and waits until it accepts
/// connections.
pub async fn serve(rocket: rocket::Rocket<rocket::Build>, port: u16) -> (Url, rocket::Shutdown) {
	let rocket = rocket.ignite().await.unwrap();
	let shutdown = rocket.shutdown();
	tokio::spawn(rocket.launch());
	wait_for_port(port).await;
	(Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap(), shutdown)
}

impl Drop for MockBackend {
	fn drop(&mut self) {
		self.shutdown.clone().notify();
	}
}

async fn wait_for_port(port: u16) {
	for _ in 0..200 {
		if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("mock backend never started on port {}", port);
}

pub fn camera(id: CameraId, name: &str, max_capacity: u32) -> Camera {
	serde_json::from_value(json!({
		"id": id,
		"camera_uuid": format!("CAM-{:08X}", id),
		"name": name,
		"rtsp_url": format!("rtsp://10.0.0.{}/stream", id),
		"area_name": "Line 1",
		"max_capacity": max_capacity,
		"is_active": true
	})).unwrap()
}

/// Socket.IO server side of one accepted websocket.
pub struct SocketPeer {
	socket: WebSocketStream<TcpStream>,
}

impl SocketPeer {
	/// Engine.IO open plus namespace acknowledgement, as the server does it.
	pub async fn handshake(&mut self, sid: &str, ping_interval_ms: u64) {
		self.send(&format!(
			r#"0{{"sid":"engine-{}","upgrades":[],"pingInterval":{},"pingTimeout":5000,"maxPayload":1000000}}"#,
			sid, ping_interval_ms
		)).await;
		assert_eq!(self.recv().await.as_deref(), Some("40"));
		self.send(&format!(r#"40{{"sid":"{}"}}"#, sid)).await;
		self.emit("connected", json!({"status": "connected"})).await;
	}

	pub async fn emit(&mut self, name: &str, payload: Value) {
		self.send(&format!("42{}", json!([name, payload]))).await;
	}

	pub async fn send(&mut self, text: &str) {
		self.socket.send(Message::Text(text.to_string())).await.unwrap();
	}

	/// Next text frame; `None` once the client has gone.
	pub async fn recv(&mut self) -> Option<String> {
		while let Some(message) = self.socket.next().await {
			match message {
				Ok(Message::Text(text)) => return Some(text),
				Ok(Message::Close(_)) | Err(_) => return None,
				Ok(_) => continue,
			}
		}
		None
	}

	pub async fn close(mut self) {
		let _ = self.socket.close(None).await;
	}
}

pub struct SocketServer {
	pub base_url: Url,
	listener: TcpListener,
}

impl SocketServer {
	pub async fn bind() -> SocketServer {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		SocketServer {
			base_url: Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap(),
			listener,
		}
	}

	pub async fn accept(&self) -> SocketPeer {
		let (stream, _) = self.listener.accept().await.unwrap();
		let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
		SocketPeer { socket }
	}
}
