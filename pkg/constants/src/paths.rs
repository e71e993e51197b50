//! Filesystem path constants.

// ─── Agent ────────────────────────────────────────────────────────────────

/// Default config file path for the leadership agent.
pub const DEFAULT_AGENT_CONFIG: &str = "/etc/leasekeeper/agent-config.yaml";

/// Default data directory for the agent's state store.
pub const DEFAULT_AGENT_DATA_DIR: &str = "/tmp/leasekeeper-data";
