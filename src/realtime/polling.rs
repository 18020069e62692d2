//! Engine.IO HTTP long-polling, used when the websocket cannot be opened.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::TransportKind;
use crate::error::ChannelError;
use super::packet::{self, EnginePacket};
use super::{Connector, Link};


type Inbound = Result<EnginePacket, ChannelError>;

pub struct PollingConnector {
	client: Client,
	base_url: Url,
	request_timeout: Duration,
}

impl PollingConnector {
	pub fn new(base_url: Url, request_timeout: Duration) -> Result<PollingConnector, ChannelError> {
		let client = Client::builder()
			.build()
			.map_err(|e| ChannelError::Transport(format!("cannot build polling client: {}", e)))?;
		Ok(PollingConnector { client, base_url, request_timeout })
	}
}

#[async_trait]
impl Connector for PollingConnector {
	fn kind(&self) -> TransportKind {
		TransportKind::Polling
	}

	async fn open(&self) -> Result<Box<dyn Link>, ChannelError> {
		let url = packet::endpoint(&self.base_url, TransportKind::Polling, None)?;
		debug!("Opening long-polling session at {}", url);
		let body = get(&self.client, url, self.request_timeout).await?;
		let mut packets = packet::decode_payload(&body)?.into_iter();

		let handshake = match packets.next() {
			Some(EnginePacket::Open(handshake)) => handshake,
			other => return Err(ChannelError::Protocol(format!("expected an open packet, got {:?}", other))),
		};
		let session_url = packet::endpoint(&self.base_url, TransportKind::Polling, Some(&handshake.sid))?;
		// Long polls are held open by the server for up to one ping interval.
		let poll_timeout = handshake.idle_timeout();

		let (inbound_tx, inbound) = mpsc::unbounded_channel();
		let _ = inbound_tx.send(Ok(EnginePacket::Open(handshake)));
		for packet in packets {
			let _ = inbound_tx.send(Ok(packet));
		}

		let reader = tokio::spawn(poll(self.client.clone(), session_url.clone(), poll_timeout, inbound_tx));

		Ok(Box::new(PollingLink {
			client: self.client.clone(),
			session_url,
			request_timeout: self.request_timeout,
			inbound,
			reader,
		}))
	}
}

async fn get(client: &Client, url: Url, timeout: Duration) -> Result<String, ChannelError> {
	let response = client
		.get(url)
		.timeout(timeout)
		.send()
		.await
		.map_err(|e| ChannelError::Transport(format!("poll failed: {}", e)))?;
	read_body(response).await
}

async fn read_body(response: reqwest::Response) -> Result<String, ChannelError> {
	let status = response.status();
	if status == StatusCode::BAD_REQUEST {
		return Err(ChannelError::Transport("polling session closed by server".into()));
	}
	if !status.is_success() {
		return Err(ChannelError::Transport(format!("polling request failed with status {}", status)));
	}
	response.text()
		.await
		.map_err(|e| ChannelError::Transport(format!("poll body unreadable: {}", e)))
}

async fn poll(client: Client, url: Url, timeout: Duration, inbound: mpsc::UnboundedSender<Inbound>) {
	loop {
		let body = match get(&client, url.clone(), timeout).await {
			Ok(body) => body,
			Err(e) => {
				let _ = inbound.send(Err(e));
				return;
			},
		};
		trace!("poll <- {}", body);
		let packets = match packet::decode_payload(&body) {
			Ok(packets) => packets,
			Err(e) => {
				let _ = inbound.send(Err(e));
				return;
			},
		};
		for packet in packets {
			let closing = packet == EnginePacket::Close;
			if inbound.send(Ok(packet)).is_err() || closing {
				return;
			}
		}
	}
}

struct PollingLink {
	client: Client,
	session_url: Url,
	request_timeout: Duration,
	inbound: mpsc::UnboundedReceiver<Inbound>,
	reader: JoinHandle<()>,
}

#[async_trait]
impl Link for PollingLink {
	async fn recv(&mut self) -> Result<Option<EnginePacket>, ChannelError> {
		match self.inbound.recv().await {
			Some(Ok(packet)) => Ok(Some(packet)),
			Some(Err(e)) => Err(e),
			None => Ok(None),
		}
	}

	async fn send(&mut self, packet: EnginePacket) -> Result<(), ChannelError> {
		let body = packet::encode_payload(&[packet]);
		trace!("poll -> {}", body);
		let response = self.client
			.post(self.session_url.clone())
			.timeout(self.request_timeout)
			.header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
			.body(body)
			.send()
			.await
			.map_err(|e| ChannelError::Transport(format!("poll send failed: {}", e)))?;
		read_body(response).await.map(|_| ())
	}

	async fn close(&mut self) {
		self.reader.abort();
		self.inbound.close();
	}
}

impl Drop for PollingLink {
	fn drop(&mut self) {
		self.reader.abort();
	}
}
