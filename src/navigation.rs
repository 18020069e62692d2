//! Route gate: which screens need a session, and where to send people who
//! lack one.

use std::path::Path;

use anyhow::Context;
use log::{debug, warn};


pub const LOGIN_ROUTE: &str = "/login";
pub const HOME_ROUTE: &str = "/dashboard";

/// Screens behind the authenticated layout.
pub const PROTECTED_ROUTES: [&str; 7] = [
	"/",
	"/dashboard",
	"/monitor",
	"/traceability",
	"/counting",
	"/qc-station",
	"/settings",
];

#[derive(Clone, Copy)]
#[derive(Debug, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct SessionContext {
	#[serde(default)]
	pub authenticated: bool,
}

impl SessionContext {
	pub fn authenticated() -> SessionContext {
		SessionContext { authenticated: true }
	}

	/// A missing or unreadable file is an anonymous session.
	pub fn load(path: &Path) -> SessionContext {
		let text = match std::fs::read_to_string(path) {
			Ok(text) => text,
			Err(e) => {
				debug!("No session at {}: {}", path.display(), e);
				return SessionContext::default();
			},
		};
		serde_json::from_str(&text).unwrap_or_else(|e| {
			warn!("Ignoring unreadable session file {}: {}", path.display(), e);
			SessionContext::default()
		})
	}

	pub fn save(&self, path: &Path) -> anyhow::Result<()> {
		let text = serde_json::to_string(self)?;
		std::fs::write(path, text)
			.with_context(|| format!("failed to write session file {}", path.display()))
	}
}

#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
	Allow,
	RedirectTo(String),
}

/// Everything except the login screen lives under the authenticated layout.
pub fn requires_auth(target: &str) -> bool {
	normalize(target) != LOGIN_ROUTE
}

pub fn is_known_route(target: &str) -> bool {
	let path = normalize(target);
	path == LOGIN_ROUTE || PROTECTED_ROUTES.contains(&path)
}

pub fn can_enter(target: &str, session: &SessionContext) -> Decision {
	let protected = requires_auth(target);
	if protected && !session.authenticated {
		Decision::RedirectTo(LOGIN_ROUTE.to_string())
	} else if !protected && session.authenticated {
		Decision::RedirectTo(HOME_ROUTE.to_string())
	} else {
		Decision::Allow
	}
}

// Drops query, fragment and trailing slashes; "" becomes "/".
fn normalize(target: &str) -> &str {
	let end = target.find(|c| c == '?' || c == '#').unwrap_or(target.len());
	let path = target[..end].trim_end_matches('/');
	if path.is_empty() { "/" } else { path }
}
