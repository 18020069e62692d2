use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::TransportKind;
use crate::error::ChannelError;
use super::packet::{self, EnginePacket};
use super::{Connector, Link};


type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Inbound = Result<EnginePacket, ChannelError>;

pub struct WebSocketConnector {
	base_url: Url,
}

impl WebSocketConnector {
	pub fn new(base_url: Url) -> WebSocketConnector {
		WebSocketConnector { base_url }
	}
}

#[async_trait]
impl Connector for WebSocketConnector {
	fn kind(&self) -> TransportKind {
		TransportKind::WebSocket
	}

	async fn open(&self) -> Result<Box<dyn Link>, ChannelError> {
		let url = packet::endpoint(&self.base_url, TransportKind::WebSocket, None)?;
		debug!("Opening websocket to {}", url);
		let (socket, _response) = connect_async(url.as_str())
			.await
			.map_err(|e| ChannelError::Transport(format!("websocket connect failed: {}", e)))?;

		let (sink, stream) = socket.split();
		let (inbound_tx, inbound) = mpsc::unbounded_channel();
		let reader = tokio::spawn(async move {
			let mut stream = stream;
			while let Some(message) = stream.next().await {
				let text = match message {
					Ok(Message::Text(text)) => text,
					Ok(Message::Close(frame)) => {
						debug!("Websocket closed by peer: {:?}", frame);
						break;
					},
					// tungstenite answers control frames itself
					Ok(_) => continue,
					Err(e) => {
						let _ = inbound_tx.send(Err(ChannelError::Transport(format!("websocket read failed: {}", e))));
						break;
					},
				};
				trace!("websocket <- {}", text);
				let packet = EnginePacket::decode(&text);
				let failed = packet.is_err();
				if inbound_tx.send(packet).is_err() || failed {
					break;
				}
			}
		});

		Ok(Box::new(WebSocketLink { sink, inbound, reader }))
	}
}

struct WebSocketLink {
	sink: SplitSink<Socket, Message>,
	inbound: mpsc::UnboundedReceiver<Inbound>,
	reader: JoinHandle<()>,
}

#[async_trait]
impl Link for WebSocketLink {
	async fn recv(&mut self) -> Result<Option<EnginePacket>, ChannelError> {
		match self.inbound.recv().await {
			Some(Ok(packet)) => Ok(Some(packet)),
			Some(Err(e)) => Err(e),
			None => Ok(None),
		}
	}

	async fn send(&mut self, packet: EnginePacket) -> Result<(), ChannelError> {
		let text = packet.encode();
		trace!("websocket -> {}", text);
		self.sink
			.send(Message::Text(text))
			.await
			.map_err(|e| ChannelError::Transport(format!("websocket write failed: {}", e)))
	}

	async fn close(&mut self) {
		let _ = self.sink.send(Message::Close(None)).await;
		let _ = self.sink.close().await;
		self.reader.abort();
	}
}

impl Drop for WebSocketLink {
	fn drop(&mut self) {
		self.reader.abort();
	}
}
