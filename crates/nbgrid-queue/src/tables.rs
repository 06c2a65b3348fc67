//! redb tables owned by the queue broker.

use redb::TableDefinition;

/// Job records keyed by job id.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_jobs");

/// FIFO order: `{queue}\0{seq:020}` to the job id bytes.
pub const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_pending");

/// Registry membership: `{registry}\0{queue}\0{id}` with empty values.
pub const REGISTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_registries");

/// Broker counters (`seq`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("queue_meta");
