//! Client-side state synchronization for the occupancy monitoring backend:
//! REST gateway, Socket.IO realtime channel, and the core that merges both
//! into one observable view.

#[macro_use] extern crate serde_derive;

pub mod common;
pub mod config;
pub mod error;
pub mod navigation;
pub mod realtime;
pub mod rest_api;
pub mod sync;
pub mod transport;

pub use crate::config::ClientConfig;
pub use crate::error::{ApiError, ApiResult, ChannelError};
pub use crate::navigation::{can_enter, Decision, SessionContext};
pub use crate::realtime::{ChannelEvent, ChannelHandle, ConnectionState, RealtimeChannel};
pub use crate::rest_api::{CameraGateway, Snapshot};
pub use crate::sync::{CameraEntry, SyncCore, SyncHandle, SyncView};
pub use crate::transport::{HttpTransport, Transport};
