//! redb table definitions for the nbgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{project_id}/{name}`.

use redb::TableDefinition;

/// Projects keyed by `{project_id}`.
pub const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");

/// Workflow records keyed by `{workflow_id}`.
pub const WORKFLOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");

/// Alias index: `{project_id}/{alias}` to the workflow id bytes.
pub const WORKFLOW_ALIASES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("workflow_aliases");

/// Execution records keyed by `{execution_id}`.
pub const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");

/// Runtime build metadata keyed by `{project_id}/{name}/{version}`.
pub const RUNTIMES: TableDefinition<&str, &[u8]> = TableDefinition::new("runtimes");

/// Inventory machine types keyed by `{name}`.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");

/// Key-value registry entries keyed by their full key (`machine:<name>`, ...).
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Set membership keyed by `{set}\x1f{member}` with empty values.
pub const KV_SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("kv_sets");
