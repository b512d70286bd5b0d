//! Application-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

// =============================================================================
// Network
// =============================================================================

/// Default obs-websocket host
pub const DEFAULT_HOST: &str = "localhost";

/// Default obs-websocket port
pub const DEFAULT_PORT: u16 = 4455;

// =============================================================================
// Timing - Session
// =============================================================================

/// Bound on Connecting + Authenticating (milliseconds)
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Time allowed for the transport to confirm a user close (milliseconds)
pub const CLOSE_TIMEOUT_MS: u64 = 2_000;

/// Per-request response timeout (milliseconds)
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// Timing - Reconnection
// =============================================================================

/// Default flat delay before a reconnect attempt (milliseconds)
pub const RECONNECT_BASE_DELAY_MS: u64 = 2_000;

/// Lower bound on the reconnect base delay (milliseconds)
pub const MIN_RECONNECT_DELAY_MS: u64 = 500;

/// Default uniform jitter added to the base delay (milliseconds)
pub const RECONNECT_JITTER_MS: u64 = 500;

/// Default number of reconnect attempts before giving up
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

// =============================================================================
// Timing - Reconciliation
// =============================================================================

/// Default poll interval (milliseconds)
pub const SYNC_INTERVAL_MS: u64 = 1_000;

/// Lower bound on the poll interval (milliseconds)
pub const MIN_SYNC_INTERVAL_MS: u64 = 500;

/// Concurrent requests per reconciliation cycle
pub const SYNC_MAX_IN_FLIGHT: usize = 8;

// =============================================================================
// Buffers
// =============================================================================

/// Channel capacity for async message passing
pub const CHANNEL_CAPACITY: usize = 256;

/// Capacity of the event broadcast channels
pub const EVENT_CAPACITY: usize = 1024;
