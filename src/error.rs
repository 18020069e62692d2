//! Error taxonomy shared by the REST pipeline and the realtime channel.

use thiserror::Error;


pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Failures of a REST call, normalized by the transport client.
///
/// Every variant owns plain data so the error can be cloned into the
/// observable sync view (`reqwest::Error` itself is not `Clone`).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ApiError {
	/// No response was received (connection refused, DNS, reset, ...).
	#[error("network error: {0}")]
	Network(String),

	#[error("request timed out")]
	Timeout,

	/// A response arrived with a non-2xx status.
	#[error("server error {status}: {message}")]
	ServerError { status: u16, message: String },

	/// A 2xx response whose body does not match the expected shape.
	#[error("malformed response: {0}")]
	Malformed(String),

	#[error("not found: {0}")]
	NotFound(String),

	/// The draft was rejected before anything was sent.
	#[error("invalid request: {0}")]
	Invalid(String),
}

impl ApiError {
	pub fn status(&self) -> Option<u16> {
		match self {
			ApiError::ServerError { status, .. } => Some(*status),
			_ => None,
		}
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, ApiError::NotFound(_)) || self.status() == Some(404)
	}
}

/// Failures of the realtime channel. These never escape as panics or
/// returned errors from the channel task; they are published as events.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ChannelError {
	#[error("transport error: {0}")]
	Transport(String),

	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered the namespace connect with CONNECT_ERROR.
	#[error("connection rejected: {0}")]
	ConnectRejected(String),

	/// An `error` event sent by the server.
	#[error("server reported: {0}")]
	Server(String),

	#[error("gave up reconnecting after {attempts} attempts")]
	ReconnectExhausted { attempts: u32 },
}
