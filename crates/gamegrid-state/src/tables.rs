//! redb table definitions for the GameGrid registry.
//!
//! Both tables use `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// VM records keyed by provider instance id.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Session records keyed by session id. `vm_id` inside each value refers to `VMS`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
