use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use log::{info, warn};

use mqc_occupancy_client::common::OccupancyStatus;
use mqc_occupancy_client::{can_enter, ClientConfig, Decision, SessionContext, SyncCore, SyncView};


const DEFAULT_SESSION_FILE: &str = "mqc-session.json";


#[tokio::main]
async fn main() -> anyhow::Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let matches = Command::new("mqc-occupancy-client")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Keeps a live view of camera occupancy from the MQC backend.")
		.arg(
			Arg::new("config")
				.action(ArgAction::Append)	// Allow argument to be specified multiple times
				.short('c')
				.long("config")
				.help("TOML file with client config")
		)
		.arg(
			Arg::new("session")
				.long("session")
				.default_value(DEFAULT_SESSION_FILE)
				.help("JSON file holding the login session")
		)
		.arg(
			Arg::new("route")
				.long("route")
				.default_value("/monitor")
				.help("Screen to open")
		)
		.get_matches();

	let config = match matches.get_many::<String>("config") {
		Some(filenames) => {
			let filenames: Vec<&str> = filenames.map(|v| v.as_str()).collect();
			ClientConfig::read_config(&filenames)?
		},
		None => {
			// Use default file paths
			ClientConfig::read_default_config_files()?
		}
	};

	let session_path = PathBuf::from(matches.get_one::<String>("session").expect("session has a default"));
	let session = SessionContext::load(&session_path);
	let route = matches.get_one::<String>("route").expect("route has a default").as_str();
	match can_enter(route, &session) {
		Decision::Allow => {},
		Decision::RedirectTo(target) => {
			warn!("Cannot open {}; redirected to {}", route, target);
			return anyhow::Ok(());
		},
	}

	info!("Connecting to {} (realtime at {})", config.api_base_url, config.socket_url);
	let handle = SyncCore::connect(&config)?;
	let mut view = handle.view();

	loop {
		tokio::select! {
			changed = view.changed() => {
				if changed.is_err() {
					break;
				}
				let summary = summarize(&view.borrow_and_update());
				info!("{}", summary);
			},
			_ = tokio::signal::ctrl_c() => {
				info!("Shutting down");
				break;
			},
		}
	}

	handle.shutdown().await;
	anyhow::Ok(())
}

fn summarize(view: &SyncView) -> String {
	let mut line = format!(
		"{:?}: {} cameras, {} people, {} warning, {} violation",
		view.connection,
		view.cameras.len(),
		view.total_count(),
		view.count_with_status(OccupancyStatus::Warning),
		view.count_with_status(OccupancyStatus::Violation),
	);
	if let Some(err) = &view.degraded {
		line.push_str(&format!(" (stale: {})", err));
	}
	line
}
