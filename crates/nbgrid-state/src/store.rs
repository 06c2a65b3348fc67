//! StateStore — redb-backed persistence for nbgrid.
//!
//! Provides typed CRUD operations over projects, workflows, executions,
//! runtimes and inventory machine types. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nbgrid_core::{
    ExecutionRecord, MachineDef, Project, RuntimeRecord, WorkflowDef, WorkflowRecord,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// The underlying database, shared with the KV registry and the queue broker.
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
        txn.open_table(WORKFLOW_ALIASES).map_err(map_err!(Table))?;
        txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        txn.open_table(RUNTIMES).map_err(map_err!(Table))?;
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.open_table(KV_SETS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    /// Insert a value that must not exist yet.
    fn insert_new<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Projects ───────────────────────────────────────────────────

    /// Store a new project. Names are unique per owner.
    pub fn create_project(&self, project: &Project) -> StateResult<()> {
        let clash = self
            .list_projects()?
            .into_iter()
            .any(|p| p.owner == project.owner && p.name == project.name);
        if clash {
            return Err(StateError::AlreadyExists(format!(
                "project {} of {}",
                project.name, project.owner
            )));
        }
        self.insert_new(PROJECTS, &project.project_id, project)?;
        debug!(project_id = %project.project_id, name = %project.name, "project stored");
        Ok(())
    }

    pub fn get_project(&self, project_id: &str) -> StateResult<Option<Project>> {
        self.get_json(PROJECTS, project_id)
    }

    pub fn list_projects(&self) -> StateResult<Vec<Project>> {
        self.scan_json(PROJECTS, "")
    }

    // ── Workflows ──────────────────────────────────────────────────

    /// Store a new workflow, claiming its alias within the project.
    pub fn create_workflow(&self, record: &WorkflowRecord) -> StateResult<()> {
        self.create_workflow_with(record, |_, _| Ok::<(), StateError>(()))
    }

    /// Like [`create_workflow`](Self::create_workflow), with `also` writing
    /// into the same transaction before it commits.
    pub fn create_workflow_with<E>(
        &self,
        record: &WorkflowRecord,
        also: impl FnOnce(&WriteTransaction, &WorkflowRecord) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<StateError>,
    {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut workflows = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
            let mut aliases = txn.open_table(WORKFLOW_ALIASES).map_err(map_err!(Table))?;
            if workflows
                .get(record.workflow_id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::AlreadyExists(record.workflow_id.clone()).into());
            }
            if let Some(alias) = &record.def.alias {
                let alias_key = alias_key(&record.project_id, alias);
                if aliases.get(alias_key.as_str()).map_err(map_err!(Read))?.is_some() {
                    return Err(StateError::AlreadyExists(format!("alias {alias}")).into());
                }
                aliases
                    .insert(alias_key.as_str(), record.workflow_id.as_bytes())
                    .map_err(map_err!(Write))?;
            }
            workflows
                .insert(record.workflow_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        also(&txn, record)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workflow_id = %record.workflow_id, "workflow stored");
        Ok(())
    }

    /// Replace a workflow's definition.
    ///
    /// Fails with `Integrity` when `expected_revision` is given and no longer
    /// matches the stored revision. Returns the stored record.
    pub fn update_workflow(
        &self,
        workflow_id: &str,
        def: WorkflowDef,
        expected_revision: Option<u64>,
        now: DateTime<Utc>,
    ) -> StateResult<WorkflowRecord> {
        self.update_workflow_with(workflow_id, def, expected_revision, now, |_, _| {
            Ok::<(), StateError>(())
        })
    }

    /// Like [`update_workflow`](Self::update_workflow), with `also` writing
    /// into the same transaction once the new record is known.
    pub fn update_workflow_with<E>(
        &self,
        workflow_id: &str,
        def: WorkflowDef,
        expected_revision: Option<u64>,
        now: DateTime<Utc>,
        also: impl FnOnce(&WriteTransaction, &WorkflowRecord) -> Result<(), E>,
    ) -> Result<WorkflowRecord, E>
    where
        E: From<StateError>,
    {
        self.modify_workflow(
            workflow_id,
            expected_revision,
            |record| {
                record.def = def;
                record.updated_at = now;
            },
            also,
        )
    }

    /// Soft-delete a workflow and release its alias.
    pub fn mark_workflow_deleted(
        &self,
        workflow_id: &str,
        now: DateTime<Utc>,
    ) -> StateResult<WorkflowRecord> {
        self.modify_workflow(
            workflow_id,
            None,
            |record| {
                record.deleted_at = Some(now);
                record.updated_at = now;
            },
            |_, _| Ok::<(), StateError>(()),
        )
    }

    fn modify_workflow<E>(
        &self,
        workflow_id: &str,
        expected_revision: Option<u64>,
        apply: impl FnOnce(&mut WorkflowRecord),
        also: impl FnOnce(&WriteTransaction, &WorkflowRecord) -> Result<(), E>,
    ) -> Result<WorkflowRecord, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut workflows = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
            let mut aliases = txn.open_table(WORKFLOW_ALIASES).map_err(map_err!(Table))?;

            let current: WorkflowRecord = match workflows.get(workflow_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("workflow {workflow_id}")).into()),
            };
            if current.is_deleted() {
                return Err(StateError::NotFound(format!("workflow {workflow_id}")).into());
            }
            if let Some(expected) = expected_revision
                && expected != current.revision
            {
                return Err(StateError::Integrity(format!(
                    "workflow {workflow_id} is at revision {}, expected {expected}",
                    current.revision
                ))
                .into());
            }

            let mut next = current.clone();
            apply(&mut next);
            next.revision = current.revision + 1;

            let old_alias = current.def.alias.as_deref().filter(|_| !current.is_deleted());
            let new_alias = next.def.alias.as_deref().filter(|_| !next.is_deleted());
            if old_alias != new_alias {
                if let Some(alias) = new_alias {
                    let key = alias_key(&next.project_id, alias);
                    if aliases.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                        return Err(StateError::AlreadyExists(format!("alias {alias}")).into());
                    }
                    aliases
                        .insert(key.as_str(), workflow_id.as_bytes())
                        .map_err(map_err!(Write))?;
                }
                if let Some(alias) = old_alias {
                    let key = alias_key(&current.project_id, alias);
                    aliases.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }

            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            workflows
                .insert(workflow_id, value.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        also(&txn, &record)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%workflow_id, revision = record.revision, "workflow updated");
        Ok(record)
    }

    /// Get a workflow by id, deleted ones included.
    pub fn get_workflow(&self, workflow_id: &str) -> StateResult<Option<WorkflowRecord>> {
        self.get_json(WORKFLOWS, workflow_id)
    }

    /// Resolve a live workflow by its alias within a project.
    pub fn get_workflow_by_alias(
        &self,
        project_id: &str,
        alias: &str,
    ) -> StateResult<Option<WorkflowRecord>> {
        let workflow_id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(WORKFLOW_ALIASES).map_err(map_err!(Table))?;
            match table
                .get(alias_key(project_id, alias).as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => String::from_utf8_lossy(guard.value()).into_owned(),
                None => return Ok(None),
            }
        };
        self.get_workflow(&workflow_id)
    }

    /// List workflows, optionally restricted to one project. Deleted
    /// workflows are skipped.
    pub fn list_workflows(&self, project_id: Option<&str>) -> StateResult<Vec<WorkflowRecord>> {
        let mut records: Vec<WorkflowRecord> = self
            .scan_json::<WorkflowRecord>(WORKFLOWS, "")?
            .into_iter()
            .filter(|r| !r.is_deleted())
            .filter(|r| project_id.is_none_or(|p| r.project_id == p))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    // ── Executions ─────────────────────────────────────────────────

    pub fn create_execution(&self, record: &ExecutionRecord) -> StateResult<()> {
        self.insert_new(EXECUTIONS, &record.execution_id, record)?;
        debug!(execution_id = %record.execution_id, status = ?record.status, "execution stored");
        Ok(())
    }

    /// Overwrite an execution. Records that reached a terminal status are
    /// immutable and the write fails with `Integrity`.
    pub fn put_execution(&self, record: &ExecutionRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let key = record.execution_id.as_str();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
            let current: Option<ExecutionRecord> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            if let Some(current) = current
                && current.is_terminal()
            {
                return Err(StateError::Integrity(format!(
                    "execution {key} is already {:?}",
                    current.status
                )));
            }
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(execution_id = %key, status = ?record.status, "execution updated");
        Ok(())
    }

    pub fn get_execution(&self, execution_id: &str) -> StateResult<Option<ExecutionRecord>> {
        self.get_json(EXECUTIONS, execution_id)
    }

    /// Executions of one workflow, oldest first.
    pub fn list_executions(&self, workflow_id: &str) -> StateResult<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .scan_json::<ExecutionRecord>(EXECUTIONS, "")?
            .into_iter()
            .filter(|r| r.workflow_id == workflow_id)
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    // ── Runtimes ───────────────────────────────────────────────────

    /// Store runtime build metadata. Runtimes are immutable once stored.
    pub fn create_runtime(&self, record: &RuntimeRecord) -> StateResult<()> {
        self.insert_new(RUNTIMES, &record.runtime_id, record)?;
        debug!(runtime_id = %record.runtime_id, "runtime stored");
        Ok(())
    }

    pub fn get_runtime(&self, runtime_id: &str) -> StateResult<Option<RuntimeRecord>> {
        self.get_json(RUNTIMES, runtime_id)
    }

    /// The most recently built version of a named runtime.
    pub fn latest_runtime(&self, project_id: &str, name: &str) -> StateResult<Option<RuntimeRecord>> {
        let prefix = format!("{project_id}/{name}/");
        Ok(self
            .scan_json::<RuntimeRecord>(RUNTIMES, &prefix)?
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at)))
    }

    pub fn list_runtimes(&self, project_id: &str) -> StateResult<Vec<RuntimeRecord>> {
        self.scan_json(RUNTIMES, &format!("{project_id}/"))
    }

    // ── Machine types ──────────────────────────────────────────────

    /// Insert or update an inventory machine type.
    pub fn put_machine(&self, name: &str, def: &MachineDef) -> StateResult<()> {
        let value = serde_json::to_vec(def).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_machine(&self, name: &str) -> StateResult<Option<MachineDef>> {
        self.get_json(MACHINES, name)
    }

    pub fn list_machines(&self) -> StateResult<Vec<(String, MachineDef)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let def: MachineDef =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.value().to_string(), def));
        }
        Ok(results)
    }
}

fn alias_key(project_id: &str, alias: &str) -> String {
    format!("{project_id}/{alias}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbgrid_core::{
        ExecutionError, ExecutionErrorKind, ExecutionStatus, MachineType, Params, RuntimeSpec,
        ScheduleSpec,
    };

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn test_def(alias: Option<&str>) -> WorkflowDef {
        WorkflowDef {
            nb_name: "hello".to_string(),
            params: Params::from([("X".to_string(), serde_json::json!(1))]),
            schedule: ScheduleSpec::Interval {
                every_seconds: 60,
                repeat: None,
                start_delay_min: 0,
            },
            queue: "cpu.default".to_string(),
            timeout_secs: 60,
            enabled: true,
            alias: alias.map(str::to_string),
            runtime: None,
            description: None,
        }
    }

    fn test_workflow(id: &str, project: &str, alias: Option<&str>) -> WorkflowRecord {
        WorkflowRecord {
            workflow_id: id.to_string(),
            project_id: project.to_string(),
            def: test_def(alias),
            revision: 1,
            created_at: epoch(),
            updated_at: epoch(),
            deleted_at: None,
        }
    }

    fn test_execution(id: &str, workflow_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            project_id: "proj".to_string(),
            nb_name: "hello".to_string(),
            params: Params::new(),
            status: ExecutionStatus::Queued,
            queue: "cpu.default".to_string(),
            timeout_secs: 60,
            input_path: "/in/hello.ipynb".to_string(),
            output_path: "/out/hello.ipynb".to_string(),
            created_at: epoch(),
            started_at: None,
            finished_at: None,
            elapsed_secs: None,
            machine: None,
            error: None,
        }
    }

    // ── Projects ───────────────────────────────────────────────────

    #[test]
    fn project_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let project = Project::new("Sales Report", "alice", epoch()).unwrap();
        store.create_project(&project).unwrap();

        assert_eq!(store.get_project(&project.project_id).unwrap(), Some(project));
        assert!(store.get_project("missing").unwrap().is_none());
    }

    #[test]
    fn project_names_unique_per_owner() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_project(&Project::new("reports", "alice", epoch()).unwrap())
            .unwrap();
        let err = store
            .create_project(&Project::new("Reports", "alice", epoch()).unwrap())
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
        store
            .create_project(&Project::new("reports", "bob", epoch()).unwrap())
            .unwrap();
        assert_eq!(store.list_projects().unwrap().len(), 2);
    }

    // ── Workflows ──────────────────────────────────────────────────

    #[test]
    fn workflow_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let record = test_workflow("wf1", "proj", Some("daily"));
        store.create_workflow(&record).unwrap();

        assert_eq!(store.get_workflow("wf1").unwrap(), Some(record.clone()));
        assert_eq!(
            store.get_workflow_by_alias("proj", "daily").unwrap(),
            Some(record)
        );
    }

    #[test]
    fn alias_collision_within_project() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_workflow(&test_workflow("wf1", "proj", Some("daily")))
            .unwrap();

        let err = store
            .create_workflow(&test_workflow("wf2", "proj", Some("daily")))
            .unwrap_err();
        assert_eq!(err.kind(), nbgrid_core::ErrorKind::AlreadyExists);
        assert!(store.get_workflow("wf2").unwrap().is_none());

        // Same alias in another project is fine.
        store
            .create_workflow(&test_workflow("wf3", "other", Some("daily")))
            .unwrap();
    }

    #[test]
    fn update_bumps_revision() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workflow(&test_workflow("wf1", "proj", None)).unwrap();

        let mut def = test_def(None);
        def.params.insert("X".to_string(), serde_json::json!(2));
        let updated = store.update_workflow("wf1", def.clone(), Some(1), epoch()).unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(store.get_workflow("wf1").unwrap().unwrap().def, def);
    }

    #[test]
    fn stale_revision_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workflow(&test_workflow("wf1", "proj", None)).unwrap();
        store.update_workflow("wf1", test_def(None), Some(1), epoch()).unwrap();

        let err = store
            .update_workflow("wf1", test_def(None), Some(1), epoch())
            .unwrap_err();
        assert!(matches!(err, StateError::Integrity(_)));
        assert_eq!(err.kind(), nbgrid_core::ErrorKind::IntegrityError);
    }

    #[test]
    fn failed_attached_write_rolls_back_the_update() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workflow(&test_workflow("wf1", "proj", None)).unwrap();

        let mut def = test_def(None);
        def.enabled = false;
        let err = store
            .update_workflow_with("wf1", def, None, epoch(), |_, record| {
                assert_eq!(record.revision, 2);
                Err(StateError::Write("attached write failed".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Write(_)));

        let stored = store.get_workflow("wf1").unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert!(stored.def.enabled);

        let err = store
            .create_workflow_with(&test_workflow("wf2", "proj", Some("daily")), |_, _| {
                Err(StateError::Write("attached write failed".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Write(_)));
        assert!(store.get_workflow("wf2").unwrap().is_none());
        assert!(store.get_workflow_by_alias("proj", "daily").unwrap().is_none());
    }

    #[test]
    fn update_moves_alias() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_workflow(&test_workflow("wf1", "proj", Some("old")))
            .unwrap();
        store
            .create_workflow(&test_workflow("wf2", "proj", Some("taken")))
            .unwrap();

        let err = store
            .update_workflow("wf1", test_def(Some("taken")), None, epoch())
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));

        store
            .update_workflow("wf1", test_def(Some("new")), None, epoch())
            .unwrap();
        assert!(store.get_workflow_by_alias("proj", "old").unwrap().is_none());
        assert_eq!(
            store
                .get_workflow_by_alias("proj", "new")
                .unwrap()
                .unwrap()
                .workflow_id,
            "wf1"
        );
    }

    #[test]
    fn soft_delete_releases_alias_and_hides_workflow() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_workflow(&test_workflow("wf1", "proj", Some("daily")))
            .unwrap();

        let deleted = store.mark_workflow_deleted("wf1", epoch()).unwrap();
        assert!(deleted.is_deleted());
        assert!(store.list_workflows(Some("proj")).unwrap().is_empty());
        assert!(store.get_workflow("wf1").unwrap().unwrap().is_deleted());

        // Deleted workflows cannot be updated, and the alias is free again.
        let err = store
            .update_workflow("wf1", test_def(None), None, epoch())
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        store
            .create_workflow(&test_workflow("wf2", "proj", Some("daily")))
            .unwrap();
    }

    #[test]
    fn list_workflows_by_project() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workflow(&test_workflow("wf1", "a", None)).unwrap();
        store.create_workflow(&test_workflow("wf2", "a", None)).unwrap();
        store.create_workflow(&test_workflow("wf3", "b", None)).unwrap();

        assert_eq!(store.list_workflows(Some("a")).unwrap().len(), 2);
        assert_eq!(store.list_workflows(None).unwrap().len(), 3);
    }

    // ── Executions ─────────────────────────────────────────────────

    #[test]
    fn execution_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        let mut exec = test_execution("ex1", "wf1");
        store.create_execution(&exec).unwrap();
        assert!(matches!(
            store.create_execution(&exec),
            Err(StateError::AlreadyExists(_))
        ));

        exec.start("cpu-abc123", epoch());
        store.put_execution(&exec).unwrap();
        exec.finish(ExecutionStatus::Ok, None, 1.5, epoch());
        store.put_execution(&exec).unwrap();

        let stored = store.get_execution("ex1").unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Ok);
        assert_eq!(stored.machine.as_deref(), Some("cpu-abc123"));
    }

    #[test]
    fn terminal_execution_is_immutable() {
        let store = StateStore::open_in_memory().unwrap();
        let mut exec = test_execution("ex1", "wf1");
        exec.finish(
            ExecutionStatus::Failed,
            Some(ExecutionError {
                kind: ExecutionErrorKind::Timeout,
                message: "exceeded 60s".to_string(),
            }),
            60.0,
            epoch(),
        );
        store.create_execution(&exec).unwrap();

        exec.status = ExecutionStatus::Ok;
        let err = store.put_execution(&exec).unwrap_err();
        assert_eq!(err.kind(), nbgrid_core::ErrorKind::IntegrityError);
        assert_eq!(
            store.get_execution("ex1").unwrap().unwrap().status,
            ExecutionStatus::Failed
        );
    }

    #[test]
    fn list_executions_for_workflow() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_execution(&test_execution("ex1", "wf1")).unwrap();
        store.create_execution(&test_execution("ex2", "wf1")).unwrap();
        store.create_execution(&test_execution("ex3", "wf2")).unwrap();

        let list = store.list_executions("wf1").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|e| e.workflow_id == "wf1"));
    }

    // ── Runtimes ───────────────────────────────────────────────────

    fn test_runtime(version: &str, created_secs: i64) -> RuntimeRecord {
        RuntimeRecord {
            runtime_id: RuntimeRecord::runtime_id_for("proj", "default", version),
            project_id: "proj".to_string(),
            name: "default".to_string(),
            version: version.to_string(),
            docker_name: "registry/proj/default".to_string(),
            spec: RuntimeSpec {
                base_image: "python:3.11".to_string(),
                packages: vec![],
                requirements: None,
                gpu: None,
            },
            created_at: DateTime::from_timestamp(created_secs, 0).unwrap(),
        }
    }

    #[test]
    fn latest_runtime_by_build_time() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_runtime(&test_runtime("aaa", 100)).unwrap();
        store.create_runtime(&test_runtime("zzz", 50)).unwrap();
        store.create_runtime(&test_runtime("bbb", 200)).unwrap();

        let latest = store.latest_runtime("proj", "default").unwrap().unwrap();
        assert_eq!(latest.version, "bbb");
        assert_eq!(latest.image(), "registry/proj/default:bbb");
        assert!(store.latest_runtime("proj", "gpu").unwrap().is_none());
        assert_eq!(store.list_runtimes("proj").unwrap().len(), 3);
    }

    #[test]
    fn runtimes_are_immutable() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_runtime(&test_runtime("v1", 100)).unwrap();
        assert!(matches!(
            store.create_runtime(&test_runtime("v1", 200)),
            Err(StateError::AlreadyExists(_))
        ));
    }

    // ── Machines ───────────────────────────────────────────────────

    #[test]
    fn machine_types_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let def = MachineDef {
            provider: "local".to_string(),
            location: "local".to_string(),
            machine_type: MachineType {
                size: "small".to_string(),
                image: "debian-12".to_string(),
                vcpus: 2,
                network: None,
            },
            gpu: None,
            volumes: vec![],
            extra: Default::default(),
            description: None,
        };
        store.put_machine("cpu", &def).unwrap();
        assert_eq!(store.get_machine("cpu").unwrap(), Some(def));
        assert_eq!(store.list_machines().unwrap().len(), 1);
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.create_workflow(&test_workflow("wf1", "proj", None)).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_workflow("wf1").unwrap().is_some());
    }
}
