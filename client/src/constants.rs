use std::time::Duration;

pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the host writes a full snapshot of its playback state
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot drift (seconds) tolerated before a corrective seek
pub const DRIFT_TOLERANCE_SECS: f64 = 1.5;

/// Progress poll cadence for embeds without a progress event
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a manual-sync notice stays on screen
pub const NOTICE_TTL: Duration = Duration::from_secs(15);

/// Durable events kept per room for late-join replay
pub const EVENT_LOG_LIMIT: usize = 500;

/// Delay between reconnect attempts to the sync server
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Subscription-gated streaming platforms we refuse to load
pub const RESTRICTED_DOMAINS: &[&str] = &[
    "netflix.com",
    "hulu.com",
    "disneyplus.com",
    "primevideo.com",
    "hotstar.com",
];
