//! Application-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

// =============================================================================
// Network
// =============================================================================

/// Default TCP port when a station medium id has no `:port` suffix
pub const DEFAULT_TCP_STATION_PORT: u16 = 23;

/// Default port for the listening pool
pub const DEFAULT_LISTENING_PORT: u16 = 16050;

/// Default base of the device farm's TCP pass-through ports (base + port number)
pub const DEFAULT_FARM_PORT_BASE: u16 = 2100;

/// Telnet control port of the device farm
pub const FARM_CONTROL_PORT: u16 = 23;

/// Default outbound TCP connect timeout (seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Stream reader
// =============================================================================

/// Read chunk size for station input
pub const READ_BUFFER_SIZE: usize = 4096;

/// Hard cap on a single session's received bytes
pub const MAX_SESSION_BYTES: usize = 1024 * 1024;

/// Longest `WAIT` a script may ask for (seconds)
pub const MAX_WAIT_SECS: f64 = 86_400.0;

// =============================================================================
// Modem
// =============================================================================

/// Total `AT` handshake attempts before giving up
pub const MODEM_MAX_ATTEMPTS: u32 = 3;

/// Wait for `OK` after `AT` (seconds)
pub const MODEM_OK_WAIT_SECS: u64 = 3;

/// Wait for `CONNECT` after `ATDT` (seconds)
pub const MODEM_CONNECT_WAIT_SECS: u64 = 60;

/// Guard pause around the `+++` escape and `ATZ` reset (seconds)
pub const MODEM_HANGUP_PAUSE_SECS: u64 = 2;

// =============================================================================
// Scheduling
// =============================================================================

/// Default attempts per station
pub const DEFAULT_POLL_NUM_TRIES: u32 = 3;

/// Default backlog limits (hours)
pub const DEFAULT_MAX_BACKLOG_HOURS: u32 = 48;
pub const DEFAULT_MIN_BACKLOG_HOURS: u32 = 2;

/// Backoff when no port could be allocated (milliseconds)
pub const ALLOCATE_BACKOFF_MS: u64 = 1000;

/// Grace period for running sessions at shutdown (seconds)
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

/// Listening controller reap / status interval (seconds)
pub const REAP_INTERVAL_SECS: u64 = 10;

/// Time an inbound client has to authenticate and identify itself (seconds)
pub const CLIENT_IDENT_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// Device farm
// =============================================================================

/// In-use flag is ignored when the last activity is older than this (seconds)
pub const PORT_STALE_SECS: i64 = 300;

/// Pause between claiming a port and confirming ownership (seconds)
pub const PORT_CLAIM_CONFIRM_SECS: u64 = 2;

/// Rest after every release (seconds)
pub const PORT_REST_SECS: i64 = 2;

/// Disable period after repeated connect errors (seconds)
pub const PORT_DISABLE_SECS: i64 = 120;

/// Consecutive connect errors that disable a port
pub const PORT_MAX_CONNECT_ERRORS: u32 = 3;

/// Bound on waiting for a device configuration request (seconds)
pub const WAIT_FOR_CONFIG_SECS: u64 = 60;

/// Wait for each prompt on the farm control port (seconds)
pub const FARM_PROMPT_WAIT_SECS: u64 = 5;

// =============================================================================
// Buffers / queues
// =============================================================================

/// Channel capacity for async message passing
pub const CHANNEL_CAPACITY: usize = 256;

/// Retrieved messages that may wait for the consumer
pub const MAX_QUEUED_MESSAGES: usize = 100;

/// Wait for room in the message queue (seconds)
pub const ENQUEUE_WAIT_SECS: u64 = 10;

// =============================================================================
// Serial
// =============================================================================

/// Consecutive zero-byte reads before assuming port disconnected
pub const SERIAL_DISCONNECT_THRESHOLD: u32 = 10;
