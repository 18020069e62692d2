//! Engine.IO v4 framing and the Socket.IO packets carried inside it.

use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::config::TransportKind;
use crate::error::ChannelError;


/// Separates packets inside one HTTP long-polling payload.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub struct Handshake {
	pub sid: String,
	pub upgrades: Vec<String>,
	pub ping_interval: Duration,
	pub ping_timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeWire {
	sid: String,
	#[serde(default)]
	upgrades: Vec<String>,
	#[serde(default = "default_ping_interval")]
	ping_interval: u64,
	#[serde(default = "default_ping_timeout")]
	ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
	DEFAULT_PING_INTERVAL_MS
}

fn default_ping_timeout() -> u64 {
	DEFAULT_PING_TIMEOUT_MS
}

impl Handshake {
	/// How long the link may stay silent before the server counts as gone.
	pub fn idle_timeout(&self) -> Duration {
		self.ping_interval + self.ping_timeout
	}

	fn to_json(&self) -> Value {
		serde_json::json!({
			"sid": self.sid,
			"upgrades": self.upgrades,
			"pingInterval": self.ping_interval.as_millis() as u64,
			"pingTimeout": self.ping_timeout.as_millis() as u64,
		})
	}
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub enum EnginePacket {
	Open(Handshake),
	Close,
	Ping(String),
	Pong(String),
	Message(String),
	Upgrade,
	Noop,
}

impl EnginePacket {
	pub fn decode(frame: &str) -> Result<EnginePacket, ChannelError> {
		let mut chars = frame.chars();
		let kind = chars.next()
			.ok_or_else(|| ChannelError::Protocol("empty engine.io packet".into()))?;
		let data = chars.as_str();
		match kind {
			'0' => {
				let wire: HandshakeWire = serde_json::from_str(data)
					.map_err(|e| ChannelError::Protocol(format!("bad open packet: {}", e)))?;
				Ok(EnginePacket::Open(Handshake {
					sid: wire.sid,
					upgrades: wire.upgrades,
					ping_interval: Duration::from_millis(wire.ping_interval),
					ping_timeout: Duration::from_millis(wire.ping_timeout),
				}))
			},
			'1' => Ok(EnginePacket::Close),
			'2' => Ok(EnginePacket::Ping(data.to_string())),
			'3' => Ok(EnginePacket::Pong(data.to_string())),
			'4' => Ok(EnginePacket::Message(data.to_string())),
			'5' => Ok(EnginePacket::Upgrade),
			'6' => Ok(EnginePacket::Noop),
			// base64 binary attachments; nothing we listen for is binary
			'b' => Ok(EnginePacket::Noop),
			other => Err(ChannelError::Protocol(format!("unknown engine.io packet type {:?}", other))),
		}
	}

	pub fn encode(&self) -> String {
		match self {
			EnginePacket::Open(handshake) => format!("0{}", handshake.to_json()),
			EnginePacket::Close => "1".to_string(),
			EnginePacket::Ping(data) => format!("2{}", data),
			EnginePacket::Pong(data) => format!("3{}", data),
			EnginePacket::Message(data) => format!("4{}", data),
			EnginePacket::Upgrade => "5".to_string(),
			EnginePacket::Noop => "6".to_string(),
		}
	}
}

pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>, ChannelError> {
	body.split(RECORD_SEPARATOR)
		.filter(|frame| !frame.is_empty())
		.map(EnginePacket::decode)
		.collect()
}

pub fn encode_payload(packets: &[EnginePacket]) -> String {
	packets
		.iter()
		.map(EnginePacket::encode)
		.collect::<Vec<_>>()
		.join(&RECORD_SEPARATOR.to_string())
}

/// Socket.IO packet on the default namespace.
#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub enum SocketPacket {
	Connect(Option<Value>),
	Disconnect,
	Event { name: String, args: Vec<Value> },
	ConnectError(Value),
	/// Acks, binary packets and other namespaces.
	Ignored,
}

impl SocketPacket {
	pub fn event(name: &str, args: Vec<Value>) -> SocketPacket {
		SocketPacket::Event { name: name.to_string(), args }
	}

	pub fn decode(text: &str) -> Result<SocketPacket, ChannelError> {
		let mut chars = text.chars();
		let kind = chars.next()
			.ok_or_else(|| ChannelError::Protocol("empty socket.io packet".into()))?;
		let mut rest = chars.as_str();

		if rest.starts_with('/') {
			let (namespace, tail) = match rest.find(',') {
				Some(comma) => (&rest[..comma], &rest[comma + 1..]),
				None => (rest, ""),
			};
			if namespace != "/" {
				return Ok(SocketPacket::Ignored);
			}
			rest = tail;
		}
		let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
		let data = if rest.is_empty() {
			None
		} else {
			Some(serde_json::from_str::<Value>(rest)
				.map_err(|e| ChannelError::Protocol(format!("bad socket.io payload: {}", e)))?)
		};

		match kind {
			'0' => Ok(SocketPacket::Connect(data)),
			'1' => Ok(SocketPacket::Disconnect),
			'2' => match data {
				Some(Value::Array(mut items)) if !items.is_empty() => {
					let name = match items.remove(0) {
						Value::String(name) => name,
						other => return Err(ChannelError::Protocol(format!("event name is not a string: {}", other))),
					};
					Ok(SocketPacket::Event { name, args: items })
				},
				_ => Err(ChannelError::Protocol("event packet without an event name".into())),
			},
			'4' => Ok(SocketPacket::ConnectError(data.unwrap_or(Value::Null))),
			'3' | '5' | '6' => Ok(SocketPacket::Ignored),
			other => Err(ChannelError::Protocol(format!("unknown socket.io packet type {:?}", other))),
		}
	}

	pub fn encode(&self) -> String {
		match self {
			SocketPacket::Connect(None) => "0".to_string(),
			SocketPacket::Connect(Some(data)) => format!("0{}", data),
			SocketPacket::Disconnect => "1".to_string(),
			SocketPacket::Event { name, args } => {
				let mut items = Vec::with_capacity(args.len() + 1);
				items.push(Value::String(name.clone()));
				items.extend(args.iter().cloned());
				format!("2{}", Value::Array(items))
			},
			SocketPacket::ConnectError(data) => format!("4{}", data),
			SocketPacket::Ignored => String::new(),
		}
	}

	/// Wrapped in an Engine.IO message, ready for the wire.
	pub fn into_engine(self) -> EnginePacket {
		EnginePacket::Message(self.encode())
	}
}

/// `{base}/socket.io/?EIO=4&transport=...`, with a ws(s) scheme for WebSocket.
pub fn endpoint(base: &Url, transport: TransportKind, sid: Option<&str>) -> Result<Url, ChannelError> {
	let mut url = base.clone();
	let path = format!("{}/socket.io/", base.path().trim_end_matches('/'));
	url.set_path(&path);
	if transport == TransportKind::WebSocket {
		let scheme = match base.scheme() {
			"https" | "wss" => "wss",
			_ => "ws",
		};
		url.set_scheme(scheme)
			.map_err(|_| ChannelError::Transport(format!("cannot use {} for a websocket", base)))?;
	}
	{
		let mut query = url.query_pairs_mut();
		query.clear();
		query.append_pair("EIO", "4");
		query.append_pair("transport", match transport {
			TransportKind::WebSocket => "websocket",
			TransportKind::Polling => "polling",
		});
		if let Some(sid) = sid {
			query.append_pair("sid", sid);
		}
	}
	Ok(url)
}
