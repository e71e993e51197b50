//! State store constants.

/// Key prefix under which every document is persisted.
/// Full key = `REGISTRY_PREFIX + collection + "/" + document id`.
pub const REGISTRY_PREFIX: &str = "/registry/";

/// Collection holding lease documents.
pub const LEASES_COLLECTION: &str = "leases";

/// Collection holding the global virtual clock document.
pub const GLOBAL_CLOCK_COLLECTION: &str = "globalclock";

/// How many times a transaction is rebuilt and retried before giving up.
pub const DEFAULT_MAX_TXN_ATTEMPTS: u32 = 3;

/// Capacity of the live change broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
