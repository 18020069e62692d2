//! Realtime channel: one Socket.IO session at a time, re-established with a
//! bounded linear backoff.
//!
//! The channel task owns the `ConnectionState` and publishes it through a
//! watch channel; everything the server pushes comes out of the event stream
//! returned by [`RealtimeChannel::connect`]. Failures never escape the task:
//! they show up as state transitions and `ChannelEvent::Error`.

pub mod packet;
pub mod polling;
pub mod websocket;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::common::{CameraStatusUpdate, OccupancyReport};
use crate::config::{ClientConfig, ReconnectionConfig, TransportKind};
use crate::error::ChannelError;
use self::packet::{EnginePacket, SocketPacket};


#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
#[derive(Serialize)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	ReconnectFailed,
}

#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
pub enum DisconnectReason {
	/// The server closed the namespace; no automatic reconnect follows.
	ServerDisconnect,
	ClientDisconnect,
	PingTimeout,
	TransportClose,
	TransportError(String),
}

impl fmt::Display for DisconnectReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DisconnectReason::ServerDisconnect => write!(f, "io server disconnect"),
			DisconnectReason::ClientDisconnect => write!(f, "io client disconnect"),
			DisconnectReason::PingTimeout => write!(f, "ping timeout"),
			DisconnectReason::TransportClose => write!(f, "transport close"),
			DisconnectReason::TransportError(message) => write!(f, "transport error: {}", message),
		}
	}
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub enum ChannelEvent {
	Connected { sid: Option<String> },
	Disconnected { reason: DisconnectReason },
	Error { error: ChannelError },
	OccupancyUpdate(OccupancyReport),
	CameraStatus(CameraStatusUpdate),
	/// Periodic full broadcast of every active camera's occupancy.
	StatsUpdate(Vec<OccupancyReport>),
}

pub type EventStream = mpsc::UnboundedReceiver<ChannelEvent>;

/// Opens one physical connection of a given transport.
#[async_trait]
pub trait Connector: Send + Sync {
	fn kind(&self) -> TransportKind;

	async fn open(&self) -> Result<Box<dyn Link>, ChannelError>;
}

/// An open Engine.IO connection.
///
/// `recv` must be cancel-safe: the session drops it whenever a command
/// arrives first. `Ok(None)` means the peer closed the connection.
#[async_trait]
pub trait Link: Send {
	async fn recv(&mut self) -> Result<Option<EnginePacket>, ChannelError>;

	async fn send(&mut self, packet: EnginePacket) -> Result<(), ChannelError>;

	async fn close(&mut self);
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
enum Command {
	Reconnect,
	Disconnect,
	RequestStats,
}

/// Cheap to clone. The channel task ends once every handle is gone.
#[derive(Clone)]
pub struct ChannelHandle {
	commands: mpsc::UnboundedSender<Command>,
	state: watch::Receiver<ConnectionState>,
}

impl ChannelHandle {
	pub fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
		self.state.clone()
	}

	/// Re-arms the reconnection loop after `ReconnectFailed` or `disconnect()`.
	pub fn reconnect(&self) {
		let _ = self.commands.send(Command::Reconnect);
	}

	/// Tears the session down and stops retrying. Safe to call repeatedly.
	pub fn disconnect(&self) {
		let _ = self.commands.send(Command::Disconnect);
	}

	/// Asks the server for an immediate `stats_update`. Dropped while offline.
	pub fn request_stats(&self) {
		let _ = self.commands.send(Command::RequestStats);
	}
}

pub struct RealtimeChannel {
	connectors: Vec<Box<dyn Connector>>,
	reconnection: ReconnectionConfig,
	connect_timeout: Duration,
	state: watch::Sender<ConnectionState>,
	events: mpsc::UnboundedSender<ChannelEvent>,
	commands: mpsc::UnboundedReceiver<Command>,
}

enum SessionEnd {
	/// Never reached `Connected`.
	Failed(ChannelError),
	/// Was connected, then lost the connection.
	Dropped(DisconnectReason),
	/// `disconnect()` was called.
	Stopped,
	/// Every handle was dropped.
	Shutdown,
}

enum Step {
	Packet(EnginePacket),
	Lost(DisconnectReason),
	Command(Command),
	Shutdown,
}

enum Wait {
	Elapsed,
	Rearm,
	Stopped,
	Shutdown,
}

/// One connector per configured transport, in preference order.
pub fn connectors_for(config: &ClientConfig) -> Result<Vec<Box<dyn Connector>>, ChannelError> {
	let mut connectors: Vec<Box<dyn Connector>> = Vec::with_capacity(config.transports.len());
	for kind in &config.transports {
		match kind {
			TransportKind::WebSocket => {
				connectors.push(Box::new(websocket::WebSocketConnector::new(config.socket_url.clone())));
			},
			TransportKind::Polling => {
				connectors.push(Box::new(polling::PollingConnector::new(config.socket_url.clone(), config.request_timeout())?));
			},
		}
	}
	Ok(connectors)
}

impl RealtimeChannel {
	/// Spawns the channel task for the configured transports.
	pub fn connect(config: &ClientConfig) -> Result<(ChannelHandle, EventStream), ChannelError> {
		let connectors = connectors_for(config)?;
		Ok(RealtimeChannel::connect_with(connectors, config.reconnection.clone(), config.request_timeout()))
	}

	pub fn connect_with(
		connectors: Vec<Box<dyn Connector>>,
		reconnection: ReconnectionConfig,
		connect_timeout: Duration,
	) -> (ChannelHandle, EventStream) {
		let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let (command_tx, command_rx) = mpsc::unbounded_channel();

		let channel = RealtimeChannel {
			connectors,
			reconnection,
			connect_timeout,
			state: state_tx,
			events: event_tx,
			commands: command_rx,
		};
		tokio::spawn(channel.run());

		(ChannelHandle { commands: command_tx, state: state_rx }, event_rx)
	}

	async fn run(mut self) {
		let mut failures: u32 = 0;
		loop {
			self.set_state(ConnectionState::Connecting);
			match self.attempt().await {
				SessionEnd::Shutdown => break,
				SessionEnd::Stopped => {
					self.set_state(ConnectionState::Disconnected);
					self.emit(ChannelEvent::Disconnected { reason: DisconnectReason::ClientDisconnect });
					if !self.park().await {
						break;
					}
					failures = 0;
					continue;
				},
				SessionEnd::Dropped(reason) => {
					info!("Realtime channel lost: {}", reason);
					failures = 0;
					let server_closed = reason == DisconnectReason::ServerDisconnect;
					self.set_state(if server_closed { ConnectionState::Disconnected } else { ConnectionState::Connecting });
					self.emit(ChannelEvent::Disconnected { reason });
					if server_closed {
						if !self.park().await {
							break;
						}
						continue;
					}
				},
				SessionEnd::Failed(error) => {
					warn!("Realtime connection attempt failed: {}", error);
					self.emit(ChannelEvent::Error { error });
				},
			}

			if failures >= self.reconnection.attempts {
				warn!("Giving up on the realtime channel after {} reconnection attempts", failures);
				self.set_state(ConnectionState::ReconnectFailed);
				self.emit(ChannelEvent::Error { error: ChannelError::ReconnectExhausted { attempts: failures } });
				if !self.park().await {
					break;
				}
				failures = 0;
				continue;
			}

			failures += 1;
			let delay = self.backoff(failures);
			info!("Reconnecting in {:?} (attempt {}/{})", delay, failures, self.reconnection.attempts);
			match self.wait(delay).await {
				Wait::Elapsed => {},
				Wait::Rearm => failures = 0,
				Wait::Stopped => {
					self.set_state(ConnectionState::Disconnected);
					self.emit(ChannelEvent::Disconnected { reason: DisconnectReason::ClientDisconnect });
					if !self.park().await {
						break;
					}
					failures = 0;
				},
				Wait::Shutdown => break,
			}
		}
		self.set_state(ConnectionState::Disconnected);
		debug!("Realtime channel task finished");
	}

	/// One pass over the transports; the first one that opens is used.
	async fn attempt(&mut self) -> SessionEnd {
		let mut last_error = ChannelError::Transport("no realtime transports configured".into());
		for index in 0..self.connectors.len() {
			let kind = self.connectors[index].kind();
			let opened = {
				let open = timeout(self.connect_timeout, self.connectors[index].open());
				tokio::pin!(open);
				loop {
					tokio::select! {
						opened = &mut open => break opened,
						command = self.commands.recv() => match command {
							Some(Command::Disconnect) => return SessionEnd::Stopped,
							Some(_) => continue,
							None => return SessionEnd::Shutdown,
						},
					}
				}
			};

			let link = match opened {
				Ok(Ok(link)) => link,
				Ok(Err(error)) => {
					debug!("{:?} transport unavailable: {}", kind, error);
					last_error = error;
					continue;
				},
				Err(_) => {
					debug!("{:?} transport timed out while opening", kind);
					last_error = ChannelError::Transport(format!("{:?} open timed out", kind));
					continue;
				},
			};

			match self.session(link, kind).await {
				SessionEnd::Failed(error) => last_error = error,
				end => return end,
			}
		}
		SessionEnd::Failed(last_error)
	}

	async fn session(&mut self, mut link: Box<dyn Link>, kind: TransportKind) -> SessionEnd {
		let handshake = loop {
			match self.next_step(link.as_mut(), self.connect_timeout).await {
				Step::Packet(EnginePacket::Open(handshake)) => break handshake,
				Step::Packet(other) => {
					link.close().await;
					return SessionEnd::Failed(ChannelError::Protocol(format!("expected an open packet, got {:?}", other)));
				},
				Step::Lost(reason) => return SessionEnd::Failed(ChannelError::Transport(reason.to_string())),
				Step::Command(Command::Disconnect) => {
					link.close().await;
					return SessionEnd::Stopped;
				},
				// the server speaks first
				Step::Command(_) => continue,
				Step::Shutdown => {
					link.close().await;
					return SessionEnd::Shutdown;
				},
			}
		};

		if let Err(error) = link.send(SocketPacket::Connect(None).into_engine()).await {
			return SessionEnd::Failed(error);
		}

		let mut connected = false;
		loop {
			let idle = if connected { handshake.idle_timeout() } else { self.connect_timeout };
			let lost = |connected: bool, reason: DisconnectReason| {
				if connected {
					SessionEnd::Dropped(reason)
				} else {
					SessionEnd::Failed(ChannelError::Transport(reason.to_string()))
				}
			};

			match self.next_step(link.as_mut(), idle).await {
				Step::Shutdown => {
					link.close().await;
					return SessionEnd::Shutdown;
				},
				Step::Command(Command::Disconnect) => {
					if connected {
						let _ = link.send(SocketPacket::Disconnect.into_engine()).await;
					}
					let _ = link.send(EnginePacket::Close).await;
					link.close().await;
					return SessionEnd::Stopped;
				},
				Step::Command(Command::Reconnect) => debug!("Reconnect requested while a session is live; ignoring"),
				Step::Command(Command::RequestStats) => {
					if !connected {
						debug!("Not connected yet; dropping stats request");
						continue;
					}
					if let Err(error) = link.send(SocketPacket::event("request_stats", Vec::new()).into_engine()).await {
						return lost(connected, DisconnectReason::TransportError(error.to_string()));
					}
				},
				Step::Lost(reason) => return lost(connected, reason),
				Step::Packet(EnginePacket::Ping(data)) => {
					if let Err(error) = link.send(EnginePacket::Pong(data)).await {
						return lost(connected, DisconnectReason::TransportError(error.to_string()));
					}
				},
				Step::Packet(EnginePacket::Close) => return lost(connected, DisconnectReason::TransportClose),
				Step::Packet(EnginePacket::Message(text)) => match SocketPacket::decode(&text) {
					Ok(SocketPacket::Connect(info)) => {
						let sid = info
							.as_ref()
							.and_then(|info| info.get("sid"))
							.and_then(Value::as_str)
							.map(str::to_string);
						connected = true;
						info!("Realtime channel connected over {:?} (engine sid {})", kind, handshake.sid);
						self.set_state(ConnectionState::Connected);
						self.emit(ChannelEvent::Connected { sid });
					},
					Ok(SocketPacket::ConnectError(data)) => {
						link.close().await;
						return SessionEnd::Failed(ChannelError::ConnectRejected(error_text(&data)));
					},
					Ok(SocketPacket::Disconnect) => {
						link.close().await;
						if connected {
							return SessionEnd::Dropped(DisconnectReason::ServerDisconnect);
						}
						return SessionEnd::Failed(ChannelError::ConnectRejected("server closed the namespace".into()));
					},
					Ok(SocketPacket::Event { name, args }) => {
						if connected {
							self.dispatch(&name, args);
						}
					},
					Ok(SocketPacket::Ignored) => {},
					Err(error) => warn!("Dropping undecodable realtime packet: {}", error),
				},
				Step::Packet(_) => {},
			}
		}
	}

	async fn next_step(&mut self, link: &mut dyn Link, idle: Duration) -> Step {
		tokio::select! {
			command = self.commands.recv() => match command {
				Some(command) => Step::Command(command),
				None => Step::Shutdown,
			},
			received = timeout(idle, link.recv()) => match received {
				Err(_) => Step::Lost(DisconnectReason::PingTimeout),
				Ok(Err(error)) => Step::Lost(DisconnectReason::TransportError(error.to_string())),
				Ok(Ok(None)) => Step::Lost(DisconnectReason::TransportClose),
				Ok(Ok(Some(packet))) => Step::Packet(packet),
			},
		}
	}

	fn dispatch(&self, name: &str, args: Vec<Value>) {
		let payload = args.into_iter().next().unwrap_or(Value::Null);
		match name {
			"occupancy_update" => match serde_json::from_value::<OccupancyReport>(payload) {
				Ok(report) => self.emit(ChannelEvent::OccupancyUpdate(report)),
				Err(e) => warn!("Ignoring malformed occupancy_update: {}", e),
			},
			"camera_status" => match serde_json::from_value::<CameraStatusUpdate>(payload) {
				Ok(update) => self.emit(ChannelEvent::CameraStatus(update)),
				Err(e) => warn!("Ignoring malformed camera_status: {}", e),
			},
			"stats_update" => {
				let records = match payload {
					Value::Object(mut fields) => fields.remove("data").unwrap_or(Value::Null),
					other => other,
				};
				match serde_json::from_value::<Vec<OccupancyReport>>(records) {
					Ok(reports) => self.emit(ChannelEvent::StatsUpdate(reports)),
					Err(e) => warn!("Ignoring malformed stats_update: {}", e),
				}
			},
			"connected" => info!("Server confirmed connection: {}", payload),
			"error" => self.emit(ChannelEvent::Error { error: ChannelError::Server(error_text(&payload)) }),
			other => debug!("Ignoring unknown realtime event {:?}", other),
		}
	}

	/// Waits for `reconnect()`. Returns false once every handle is gone.
	async fn park(&mut self) -> bool {
		loop {
			match self.commands.recv().await {
				Some(Command::Reconnect) => return true,
				Some(Command::Disconnect) => {
					if self.set_state(ConnectionState::Disconnected) {
						self.emit(ChannelEvent::Disconnected { reason: DisconnectReason::ClientDisconnect });
					}
				},
				Some(Command::RequestStats) => debug!("Realtime channel is offline; dropping stats request"),
				None => return false,
			}
		}
	}

	async fn wait(&mut self, delay: Duration) -> Wait {
		let sleep = tokio::time::sleep(delay);
		tokio::pin!(sleep);
		loop {
			tokio::select! {
				_ = &mut sleep => return Wait::Elapsed,
				command = self.commands.recv() => match command {
					Some(Command::Reconnect) => return Wait::Rearm,
					Some(Command::Disconnect) => return Wait::Stopped,
					Some(Command::RequestStats) => continue,
					None => return Wait::Shutdown,
				},
			}
		}
	}

	fn backoff(&self, attempt: u32) -> Duration {
		let linear = self.reconnection.delay() * attempt;
		let jitter = self.reconnection.jitter.clamp(0.0, 1.0);
		if jitter == 0.0 {
			return linear;
		}
		let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
		linear.mul_f64(factor)
	}

	/// Whether the state actually changed.
	fn set_state(&self, state: ConnectionState) -> bool {
		self.state.send_if_modified(|current| {
			if *current == state {
				return false;
			}
			debug!("Realtime channel {:?} -> {:?}", *current, state);
			*current = state;
			true
		})
	}

	fn emit(&self, event: ChannelEvent) {
		// Nobody listening is fine; the state watch still tells the story.
		let _ = self.events.send(event);
	}
}

fn error_text(data: &Value) -> String {
	match data {
		Value::String(text) => text.clone(),
		other => other
			.get("message")
			.and_then(Value::as_str)
			.map(str::to_string)
			.unwrap_or_else(|| other.to_string()),
	}
}
