//! Single-writer merge of REST snapshots and realtime events.
//!
//! One task owns the camera/occupancy map. Handles, the realtime event
//! stream and spawned pulls only submit inputs; each one is applied to
//! completion before the next, and every change is published as a fresh
//! `SyncView` through a watch channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::common::{Camera, CameraDraft, CameraId, CameraList, CameraStatusUpdate, CameraUuid, OccupancyReport, OccupancyStat, OccupancyStatus, Timestamp};
use crate::config::ClientConfig;
use crate::error::{ApiError, ApiResult, ChannelError};
use crate::realtime::{self, ChannelEvent, ChannelHandle, ConnectionState, Connector, DisconnectReason, EventStream, RealtimeChannel};
use crate::rest_api::CameraGateway;
use crate::transport::{HttpTransport, Transport};


#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub struct CameraEntry {
	pub camera: Camera,
	pub occupancy: OccupancyStat,
	/// Known only from a realtime event; the next successful pull decides.
	pub provisional: bool,
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub struct SyncView {
	pub cameras: BTreeMap<CameraUuid, CameraEntry>,
	pub connection: ConnectionState,
	/// Error of the last failed pull; cleared by the next successful one.
	pub degraded: Option<ApiError>,
	pub last_synced: Option<Timestamp>,
	pub pulls_applied: u64,
}

impl SyncView {
	fn new(connection: ConnectionState) -> SyncView {
		SyncView {
			cameras: BTreeMap::new(),
			connection,
			degraded: None,
			last_synced: None,
			pulls_applied: 0,
		}
	}

	pub fn camera(&self, uuid: &str) -> Option<&CameraEntry> {
		self.cameras.get(uuid)
	}

	pub fn camera_by_id(&self, id: CameraId) -> Option<&CameraEntry> {
		self.cameras.values().find(|entry| !entry.provisional && entry.camera.id == id)
	}

	pub fn total_count(&self) -> u64 {
		self.cameras.values().map(|entry| entry.occupancy.current_count as u64).sum()
	}

	pub fn count_with_status(&self, status: OccupancyStatus) -> usize {
		self.cameras.values().filter(|entry| entry.occupancy.status == status).count()
	}
}

enum Input {
	Refresh,
	Saved { camera: Camera, ack: oneshot::Sender<()> },
	Deleted { id: CameraId, ack: oneshot::Sender<()> },
	Shutdown,
}

struct Pulled {
	generation: u64,
	cameras: ApiResult<CameraList>,
	reports: ApiResult<Vec<OccupancyReport>>,
	received_at: Timestamp,
}

/// Cheap to clone. Reads come from the published view; writes go through
/// the gateway and are merged before the call returns.
#[derive(Clone)]
pub struct SyncHandle {
	inputs: mpsc::UnboundedSender<Input>,
	view: watch::Receiver<SyncView>,
	gateway: CameraGateway,
	channel: Option<ChannelHandle>,
}

impl SyncHandle {
	pub fn view(&self) -> watch::Receiver<SyncView> {
		self.view.clone()
	}

	pub fn snapshot(&self) -> SyncView {
		self.view.borrow().clone()
	}

	pub fn connection(&self) -> ConnectionState {
		self.view.borrow().connection
	}

	/// Starts a reconciliation pull; the newest one started wins.
	pub fn refresh(&self) {
		let _ = self.inputs.send(Input::Refresh);
	}

	pub async fn get_camera(&self, id: CameraId) -> ApiResult<Camera> {
		self.gateway.get_camera(id).await
	}

	pub async fn add_camera(&self, draft: &CameraDraft) -> ApiResult<Camera> {
		let camera = self.gateway.add_camera(draft).await?;
		self.saved(camera.clone()).await;
		Ok(camera)
	}

	pub async fn update_camera(&self, id: CameraId, draft: &CameraDraft) -> ApiResult<Camera> {
		let camera = self.gateway.update_camera(id, draft).await?;
		self.saved(camera.clone()).await;
		Ok(camera)
	}

	pub async fn delete_camera(&self, id: CameraId) -> ApiResult<bool> {
		let deleted = self.gateway.delete_camera(id).await?;
		if deleted {
			let (ack, done) = oneshot::channel();
			if self.inputs.send(Input::Deleted { id, ack }).is_ok() {
				let _ = done.await;
			}
		}
		Ok(deleted)
	}

	pub fn stream_url_for(&self, camera_uuid: &str) -> String {
		self.gateway.stream_url_for(camera_uuid)
	}

	pub fn reconnect(&self) {
		if let Some(channel) = &self.channel {
			channel.reconnect();
		}
	}

	pub fn disconnect(&self) {
		if let Some(channel) = &self.channel {
			channel.disconnect();
		}
	}

	pub fn request_stats(&self) {
		if let Some(channel) = &self.channel {
			channel.request_stats();
		}
	}

	/// Stops the realtime channel and the merge task, then waits for the task
	/// to finish.
	pub async fn shutdown(self) {
		self.disconnect();
		let _ = self.inputs.send(Input::Shutdown);
		let mut view = self.view;
		while view.changed().await.is_ok() {}
	}

	async fn saved(&self, camera: Camera) {
		let (ack, done) = oneshot::channel();
		if self.inputs.send(Input::Saved { camera, ack }).is_ok() {
			let _ = done.await;
		}
	}
}

pub struct SyncCore {
	gateway: CameraGateway,
	tolerance: u32,
	state: SyncView,
	view: watch::Sender<SyncView>,
	inputs: mpsc::UnboundedReceiver<Input>,
	events: Option<EventStream>,
	channel_state: Option<watch::Receiver<ConnectionState>>,
	pulled_tx: mpsc::UnboundedSender<Pulled>,
	pulled: mpsc::UnboundedReceiver<Pulled>,
	generation: u64,
	pull_in_flight: bool,
	lost_connection: bool,
}

impl SyncCore {
	/// Wires the core over an already-open event stream and starts the
	/// initial pull.
	pub fn spawn(gateway: CameraGateway, events: EventStream, config: &ClientConfig) -> SyncHandle {
		SyncCore::launch(gateway, events, config, None)
	}

	/// Opens the realtime channel over `connectors` and merges it with REST
	/// pulls made through `transport`.
	pub fn start(config: &ClientConfig, transport: Arc<dyn Transport>, connectors: Vec<Box<dyn Connector>>) -> SyncHandle {
		let gateway = CameraGateway::new(transport, config);
		let (channel, events) = RealtimeChannel::connect_with(connectors, config.reconnection.clone(), config.request_timeout());
		SyncCore::launch(gateway, events, config, Some(channel))
	}

	/// `start` over the HTTP transport and the configured realtime transports.
	pub fn connect(config: &ClientConfig) -> anyhow::Result<SyncHandle> {
		let transport = HttpTransport::from_config(config)?;
		let connectors = realtime::connectors_for(config)?;
		Ok(SyncCore::start(config, Arc::new(transport), connectors))
	}

	fn launch(gateway: CameraGateway, events: EventStream, config: &ClientConfig, channel: Option<ChannelHandle>) -> SyncHandle {
		let (core, handle) = SyncCore::new(gateway, events, config, channel);
		tokio::spawn(core.run());
		handle
	}

	fn new(gateway: CameraGateway, events: EventStream, config: &ClientConfig, channel: Option<ChannelHandle>) -> (SyncCore, SyncHandle) {
		let channel_state = channel.as_ref().map(ChannelHandle::watch_state);
		let connection = channel_state.as_ref().map(|state| *state.borrow()).unwrap_or(ConnectionState::Disconnected);
		let state = SyncView::new(connection);
		let (view_tx, view_rx) = watch::channel(state.clone());
		let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
		let (pulled_tx, pulled_rx) = mpsc::unbounded_channel();

		let core = SyncCore {
			gateway: gateway.clone(),
			tolerance: config.occupancy.tolerance,
			state,
			view: view_tx,
			inputs: inputs_rx,
			events: Some(events),
			channel_state,
			pulled_tx,
			pulled: pulled_rx,
			generation: 0,
			pull_in_flight: false,
			lost_connection: false,
		};
		let handle = SyncHandle { inputs: inputs_tx, view: view_rx, gateway, channel };
		(core, handle)
	}

	async fn run(mut self) {
		self.start_pull();
		loop {
			tokio::select! {
				input = self.inputs.recv() => match input {
					Some(Input::Shutdown) | None => break,
					Some(input) => self.apply_input(input),
				},
				Some(pulled) = self.pulled.recv() => self.apply_pull(pulled),
				event = next_event(&mut self.events) => match event {
					Some(event) => self.apply_event(event, Utc::now()),
					None => {
						debug!("Realtime event stream closed");
						self.events = None;
					},
				},
				state = next_state(&mut self.channel_state) => match state {
					Some(state) => self.mirror_connection(state),
					None => self.channel_state = None,
				},
			}
		}
		info!("Sync core stopped");
	}

	fn apply_input(&mut self, input: Input) {
		match input {
			Input::Refresh => self.start_pull(),
			Input::Saved { camera, ack } => {
				self.apply_saved(camera, Utc::now());
				let _ = ack.send(());
			},
			Input::Deleted { id, ack } => {
				self.apply_deleted(id);
				let _ = ack.send(());
			},
			Input::Shutdown => {},
		}
	}

	fn start_pull(&mut self) {
		self.generation += 1;
		self.pull_in_flight = true;
		let generation = self.generation;
		let gateway = self.gateway.clone();
		let pulled = self.pulled_tx.clone();
		debug!("Starting pull {}", generation);
		tokio::spawn(async move {
			let (cameras, reports) = tokio::join!(gateway.list_cameras(), gateway.occupancy_reports());
			let _ = pulled.send(Pulled {
				generation,
				cameras: cameras.into_result(),
				reports,
				received_at: Utc::now(),
			});
		});
	}

	fn apply_pull(&mut self, pulled: Pulled) {
		if pulled.generation < self.generation {
			debug!("Discarding pull {}; pull {} supersedes it", pulled.generation, self.generation);
			return;
		}
		self.pull_in_flight = false;
		let (cameras, reports) = match (pulled.cameras, pulled.reports) {
			(Ok(cameras), Ok(reports)) => (cameras, reports),
			(Err(err), _) | (_, Err(err)) => {
				warn!("Pull {} failed, keeping {} cached cameras: {}", pulled.generation, self.state.cameras.len(), err);
				self.state.degraded = Some(err);
				self.publish();
				return;
			},
		};

		let received_at = pulled.received_at;
		let thresholds = *self.gateway.thresholds();
		let mut reports: BTreeMap<CameraUuid, OccupancyReport> = reports
			.into_iter()
			.map(|report| (report.camera_uuid.clone(), report))
			.collect();

		let mut merged = BTreeMap::new();
		for camera in cameras {
			let previous = self.state.cameras.remove(&camera.uuid).filter(|entry| !entry.provisional);
			let pulled_stat = reports
				.remove(&camera.uuid)
				.map(|report| report.into_stat(received_at, Some(camera.max_capacity), &thresholds));
			let occupancy = match (previous, pulled_stat) {
				(Some(previous), Some(stat)) if !stat.supersedes(&previous.occupancy) => {
					debug!("Keeping newer occupancy for {}", camera.uuid);
					previous.occupancy
				},
				(_, Some(stat)) => stat,
				(Some(previous), None) => previous.occupancy,
				(None, None) => OccupancyStat::empty(&camera, received_at),
			};
			let mut entry = CameraEntry { camera, occupancy, provisional: false };
			self.mirror_capacity(&mut entry);
			merged.insert(entry.camera.uuid.clone(), entry);
		}
		for uuid in reports.keys() {
			debug!("Ignoring occupancy for unlisted camera {}", uuid);
		}
		for (uuid, entry) in &self.state.cameras {
			if entry.provisional {
				info!("Dropping placeholder camera {}", uuid);
			}
		}

		self.state.cameras = merged;
		self.state.degraded = None;
		self.state.last_synced = Some(received_at);
		self.state.pulls_applied += 1;
		info!("Pull {} applied: {} cameras", pulled.generation, self.state.cameras.len());
		self.publish();
	}

	fn apply_event(&mut self, event: ChannelEvent, received_at: Timestamp) {
		match event {
			ChannelEvent::Connected { .. } => {
				self.derive_connection(ConnectionState::Connected);
				if self.lost_connection || self.state.degraded.is_some() {
					info!("Realtime channel back; pulling to catch up");
					self.start_pull();
				}
				self.lost_connection = false;
			},
			ChannelEvent::Disconnected { reason } => {
				self.lost_connection = true;
				self.derive_connection(match reason {
					DisconnectReason::ServerDisconnect | DisconnectReason::ClientDisconnect => ConnectionState::Disconnected,
					_ => ConnectionState::Connecting,
				});
			},
			ChannelEvent::Error { error: ChannelError::ReconnectExhausted { .. } } => {
				self.derive_connection(ConnectionState::ReconnectFailed);
			},
			ChannelEvent::Error { error: ChannelError::Server(message) } => {
				warn!("Server reported an error: {}", message);
				return;
			},
			ChannelEvent::Error { error } => {
				debug!("Realtime attempt failed: {}", error);
				if self.state.connection == ConnectionState::Connected {
					return;
				}
				self.derive_connection(ConnectionState::Connecting);
			},
			ChannelEvent::OccupancyUpdate(report) => self.apply_report(report, received_at),
			ChannelEvent::CameraStatus(update) => self.apply_status(update),
			ChannelEvent::StatsUpdate(reports) => {
				for report in reports {
					self.apply_report(report, received_at);
				}
			},
		}
		self.publish();
	}

	/// Without a channel handle the event stream is the only source of the
	/// connection state.
	fn derive_connection(&mut self, connection: ConnectionState) {
		if self.channel_state.is_none() {
			self.state.connection = connection;
		}
	}

	fn mirror_connection(&mut self, connection: ConnectionState) {
		if self.state.connection != connection {
			debug!("Connection now {:?}", connection);
			self.state.connection = connection;
			self.publish();
		}
	}

	fn apply_report(&mut self, report: OccupancyReport, received_at: Timestamp) {
		let thresholds = *self.gateway.thresholds();
		let entry = self.state.cameras.entry(report.camera_uuid.clone()).or_insert_with(|| {
			info!("Occupancy for unknown camera {}; adding a placeholder", report.camera_uuid);
			let camera = Camera::placeholder(
				&report.camera_uuid,
				report.name.as_deref(),
				report.area_name.as_deref(),
				report.max_capacity,
			);
			let occupancy = OccupancyStat::empty(&camera, received_at);
			CameraEntry { camera, occupancy, provisional: true }
		});

		let stat = report.into_stat(received_at, Some(entry.camera.max_capacity), &thresholds);
		if !stat.supersedes(&entry.occupancy) {
			warn!(
				"Discarding stale occupancy for {} ({} is older than {})",
				stat.camera_uuid, stat.timestamp, entry.occupancy.timestamp
			);
			return;
		}
		entry.occupancy = stat;
		let tolerance = self.tolerance;
		clamp(entry, tolerance);
	}

	fn apply_status(&mut self, update: CameraStatusUpdate) {
		match self.state.cameras.get_mut(&update.camera_uuid) {
			Some(entry) => entry.camera.is_active = update.is_active,
			None => debug!("Status for unknown camera {}", update.camera_uuid),
		}
	}

	fn apply_saved(&mut self, camera: Camera, at: Timestamp) {
		let stale: Vec<CameraUuid> = self.state.cameras
			.iter()
			.filter(|(uuid, entry)| !entry.provisional && entry.camera.id == camera.id && **uuid != camera.uuid)
			.map(|(uuid, _)| uuid.clone())
			.collect();
		for uuid in stale {
			self.state.cameras.remove(&uuid);
		}

		let mut entry = match self.state.cameras.remove(&camera.uuid) {
			Some(existing) => CameraEntry { camera, occupancy: existing.occupancy, provisional: false },
			None => {
				let occupancy = OccupancyStat::empty(&camera, at);
				CameraEntry { camera, occupancy, provisional: false }
			},
		};
		self.mirror_capacity(&mut entry);
		debug!("Camera {} saved", entry.camera.uuid);
		self.state.cameras.insert(entry.camera.uuid.clone(), entry);
		self.publish();
		self.restart_pull();
	}

	fn apply_deleted(&mut self, id: CameraId) {
		let before = self.state.cameras.len();
		self.state.cameras.retain(|_, entry| entry.provisional || entry.camera.id != id);
		if self.state.cameras.len() != before {
			debug!("Camera {} removed", id);
			self.publish();
		}
		self.restart_pull();
	}

	/// A pull started before an acknowledged write may predate it; supersede
	/// it with one that sees the write.
	fn restart_pull(&mut self) {
		if self.pull_in_flight {
			debug!("Pull {} predates a write; starting another", self.generation);
			self.start_pull();
		}
	}

	fn mirror_capacity(&self, entry: &mut CameraEntry) {
		if entry.occupancy.capacity != entry.camera.max_capacity {
			entry.occupancy.capacity = entry.camera.max_capacity;
			entry.occupancy.status = OccupancyStatus::classify(
				entry.occupancy.current_count,
				entry.occupancy.capacity,
				self.gateway.thresholds(),
			);
		}
		clamp(entry, self.tolerance);
	}

	fn publish(&self) {
		self.view.send_replace(self.state.clone());
	}
}

// Soft ceiling: capacity plus tolerance.
fn clamp(entry: &mut CameraEntry, tolerance: u32) {
	let ceiling = entry.occupancy.capacity.saturating_add(tolerance);
	if entry.occupancy.current_count > ceiling {
		warn!(
			"Clamping occupancy for {} from {} to {}",
			entry.camera.uuid, entry.occupancy.current_count, ceiling
		);
		entry.occupancy.current_count = ceiling;
	}
}

async fn next_event(events: &mut Option<EventStream>) -> Option<ChannelEvent> {
	match events {
		Some(events) => events.recv().await,
		None => std::future::pending().await,
	}
}

async fn next_state(state: &mut Option<watch::Receiver<ConnectionState>>) -> Option<ConnectionState> {
	match state {
		Some(state) => match state.changed().await {
			Ok(()) => Some(*state.borrow_and_update()),
			Err(_) => None,
		},
		None => std::future::pending().await,
	}
}
