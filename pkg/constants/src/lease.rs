//! Lease coordination constants.

use std::time::Duration;

/// Namespace used for application leadership leases.
pub const LEADERSHIP_NAMESPACE: &str = "leadership";

/// Separator used when deriving a lease document id (`namespace#name#`).
pub const LEASE_ID_SEPARATOR: char = '#';

/// Longest the manager sleeps between expiry sweeps.
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(60);

/// Capacity of the manager's request channel, per namespace.
pub const MANAGER_REQUEST_BUFFER: usize = 64;

/// Writer clock offsets beyond this are reported by the manager.
pub const SKEW_WARNING_THRESHOLD: Duration = Duration::from_secs(10);

/// Default duration requested by a leadership claim.
pub const DEFAULT_LEADERSHIP_DURATION: Duration = Duration::from_secs(30);

/// Document id of the global virtual clock.
pub const GLOBAL_CLOCK_DOC_ID: &str = "g";

/// How often the global clock worker advances the virtual clock.
pub const GLOBAL_CLOCK_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest the manager sleeps between expiry sweeps.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
