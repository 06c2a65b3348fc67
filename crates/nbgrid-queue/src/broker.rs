//! QueueBroker — named FIFO queues over the shared redb database.
//!
//! Every state change (enqueue, reserve, complete, fail, reap) is one write
//! transaction touching the job record, the FIFO index and the registries
//! together, so observers never see a job in two registries at once.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nbgrid_core::SharedClock;
use nbgrid_state::StateStore;
use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::*;
use crate::tables::{JOBS, META, PENDING, REGISTRIES};

fn storage<E: Display>(e: E) -> QueueError {
    QueueError::Storage(e.to_string())
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Added to a job's timeout to form its lease.
    pub grace: Duration,
    /// Maximum pending jobs per queue.
    pub max_depth: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            max_depth: None,
        }
    }
}

/// Thread-safe queue broker. Cloning shares the database and wakeups.
#[derive(Clone)]
pub struct QueueBroker {
    db: Arc<Database>,
    clock: SharedClock,
    config: BrokerConfig,
    notify: Arc<Notify>,
}

impl QueueBroker {
    pub fn new(store: &StateStore, clock: SharedClock, config: BrokerConfig) -> QueueResult<Self> {
        let broker = Self {
            db: store.database(),
            clock,
            config,
            notify: Arc::new(Notify::new()),
        };
        broker.ensure_tables()?;
        Ok(broker)
    }

    fn ensure_tables(&self) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(storage)?;
        txn.open_table(JOBS).map_err(storage)?;
        txn.open_table(PENDING).map_err(storage)?;
        txn.open_table(REGISTRIES).map_err(storage)?;
        txn.open_table(META).map_err(storage)?;
        txn.commit().map_err(storage)?;
        Ok(())
    }

    pub fn grace(&self) -> Duration {
        self.config.grace
    }

    // ── Producer side ──────────────────────────────────────────────

    /// Append a job to `queue`.
    ///
    /// The id is an idempotency key: if a job with that id was ever
    /// enqueued, the original handle is returned with `created = false`
    /// and nothing changes.
    pub fn enqueue<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        opts: EnqueueOptions,
    ) -> QueueResult<JobHandle> {
        self.enqueue_with(queue, payload, opts, |_| Ok::<(), QueueError>(()))
    }

    /// Like [`enqueue`](Self::enqueue), but `also` writes into the same
    /// transaction before it commits: either the job and those writes both
    /// land or neither does. `also` is not called for a duplicate id.
    pub fn enqueue_with<T, E>(
        &self,
        queue: &str,
        payload: &T,
        opts: EnqueueOptions,
        also: impl FnOnce(&WriteTransaction) -> Result<(), E>,
    ) -> Result<JobHandle, E>
    where
        T: Serialize,
        E: From<QueueError>,
    {
        let payload =
            serde_json::to_value(payload).map_err(|e| QueueError::Serialize(e.to_string()))?;
        let id = opts.id.unwrap_or_else(nbgrid_core::id::execution_id);
        let now = self.clock.now();

        let txn = self.db.begin_write().map_err(storage)?;
        let handle = self.stage_enqueue(&txn, queue, id, payload, opts.timeout, now)?;
        if !handle.created {
            debug!(job_id = %handle.id, queue = %handle.queue, "duplicate enqueue ignored");
            return Ok(handle);
        }
        also(&txn)?;
        txn.commit().map_err(storage)?;
        debug!(job_id = %handle.id, %queue, "job enqueued");
        self.notify.notify_waiters();
        Ok(handle)
    }

    fn stage_enqueue(
        &self,
        txn: &WriteTransaction,
        queue: &str,
        id: String,
        payload: serde_json::Value,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<JobHandle> {
        let mut jobs = txn.open_table(JOBS).map_err(storage)?;
        if let Some(existing) = read_job(&jobs, &id)? {
            return Ok(JobHandle {
                id,
                queue: existing.queue,
                created: false,
            });
        }

        let mut pending = txn.open_table(PENDING).map_err(storage)?;
        if let Some(max) = self.config.max_depth {
            let depth = pending_entries(&pending, queue)?.len() as u64;
            if depth >= max {
                return Err(QueueError::Full {
                    queue: queue.to_string(),
                    depth,
                });
            }
        }

        let mut meta = txn.open_table(META).map_err(storage)?;
        let seq = meta.get("seq").map_err(storage)?.map(|g| g.value()).unwrap_or(0) + 1;
        meta.insert("seq", seq).map_err(storage)?;

        let record = JobRecord {
            id: id.clone(),
            queue: queue.to_string(),
            payload,
            status: JobStatus::Pending,
            timeout_secs: timeout.as_secs(),
            seq,
            enqueued_at: now,
            started_at: None,
            ended_at: None,
            lease_expires_at: None,
            worker: None,
            result: None,
            failure: None,
        };
        write_job(&mut jobs, &record)?;
        pending
            .insert(pending_key(queue, seq).as_str(), id.as_bytes())
            .map_err(storage)?;
        Ok(JobHandle {
            id,
            queue: queue.to_string(),
            created: true,
        })
    }

    // ── Worker side ────────────────────────────────────────────────

    /// Lease the head of `queue` to `worker`.
    pub fn reserve(&self, queue: &str, worker: &str) -> QueueResult<Option<ReservedJob>> {
        let now = self.clock.now();
        let txn = self.db.begin_write().map_err(storage)?;
        let reserved = {
            let mut pending = txn.open_table(PENDING).map_err(storage)?;
            let Some((key, id)) = pending_entries(&pending, queue)?.into_iter().next() else {
                return Ok(None);
            };
            pending.remove(key.as_str()).map_err(storage)?;

            let mut jobs = txn.open_table(JOBS).map_err(storage)?;
            let mut record =
                read_job(&jobs, &id)?.ok_or_else(|| QueueError::NotFound(id.clone()))?;
            let timeout = Duration::from_secs(record.timeout_secs);
            let lease_expires_at = add(now, timeout + self.config.grace);
            record.status = JobStatus::Started;
            record.started_at = Some(now);
            record.worker = Some(worker.to_string());
            record.lease_expires_at = Some(lease_expires_at);
            write_job(&mut jobs, &record)?;

            let mut registries = txn.open_table(REGISTRIES).map_err(storage)?;
            registries
                .insert(
                    registry_key(Registry::Started, queue, &id).as_str(),
                    b"".as_slice(),
                )
                .map_err(storage)?;

            ReservedJob {
                id,
                queue: queue.to_string(),
                payload: record.payload,
                timeout,
                started_at: now,
                lease_expires_at,
            }
        };
        txn.commit().map_err(storage)?;
        debug!(job_id = %reserved.id, %queue, %worker, "job reserved");
        Ok(Some(reserved))
    }

    /// Lease the first available job from `queues`, checked in order.
    pub fn reserve_any(&self, queues: &[String], worker: &str) -> QueueResult<Option<ReservedJob>> {
        for queue in queues {
            if let Some(job) = self.reserve(queue, worker)? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Like [`reserve_any`](Self::reserve_any), but waits up to `max_wait`
    /// for a job to be enqueued.
    pub async fn reserve_wait(
        &self,
        queues: &[String],
        worker: &str,
        max_wait: Duration,
    ) -> QueueResult<Option<ReservedJob>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an enqueue in between still wakes us.
            notified.as_mut().enable();

            if let Some(job) = self.reserve_any(queues, worker)? {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Finish a started job successfully. Only the lease holder may do so.
    pub fn complete<T: Serialize>(&self, id: &str, worker: &str, result: &T) -> QueueResult<()> {
        let result =
            serde_json::to_value(result).map_err(|e| QueueError::Serialize(e.to_string()))?;
        self.finish(id, worker, JobStatus::Finished, Some(result), None)
    }

    /// Fail a started job. Only the lease holder may do so.
    pub fn fail(&self, id: &str, worker: &str, failure: JobFailure) -> QueueResult<()> {
        self.finish(id, worker, JobStatus::Failed, None, Some(failure))
    }

    fn finish(
        &self,
        id: &str,
        worker: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        failure: Option<JobFailure>,
    ) -> QueueResult<()> {
        let now = self.clock.now();
        let txn = self.db.begin_write().map_err(storage)?;
        let queue = {
            let mut jobs = txn.open_table(JOBS).map_err(storage)?;
            let mut record =
                read_job(&jobs, id)?.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if record.status != JobStatus::Started {
                return Err(QueueError::InvalidState {
                    id: id.to_string(),
                    status: record.status.to_string(),
                });
            }
            if record.worker.as_deref() != Some(worker) {
                return Err(QueueError::NotLeaseHolder {
                    id: id.to_string(),
                    worker: worker.to_string(),
                });
            }
            record.status = status;
            record.result = result;
            record.failure = failure;
            record.ended_at = Some(now);
            write_job(&mut jobs, &record)?;

            let mut registries = txn.open_table(REGISTRIES).map_err(storage)?;
            move_registry(&mut registries, &record.queue, id, Registry::Started, status)?;
            record.queue
        };
        txn.commit().map_err(storage)?;
        debug!(job_id = %id, %queue, %worker, %status, "job finished");
        Ok(())
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn fetch(&self, id: &str) -> QueueResult<Option<JobInfo>> {
        let txn = self.db.begin_read().map_err(storage)?;
        let jobs = txn.open_table(JOBS).map_err(storage)?;
        let Some(record) = read_job(&jobs, id)? else {
            return Ok(None);
        };
        let position = if record.status == JobStatus::Pending {
            let pending = txn.open_table(PENDING).map_err(storage)?;
            pending_entries(&pending, &record.queue)?
                .iter()
                .position(|(_, pending_id)| pending_id == id)
        } else {
            None
        };
        Ok(Some(JobInfo {
            id: record.id,
            queue: record.queue,
            status: record.status,
            payload: Some(record.payload),
            result: record.result,
            failure: record.failure,
            position,
            worker: record.worker,
            enqueued_at: record.enqueued_at,
            started_at: record.started_at,
            ended_at: record.ended_at,
        }))
    }

    /// Ids held in one registry of `queue`. Enqueued ids come in FIFO order.
    pub fn ids(&self, queue: &str, registry: Registry) -> QueueResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(storage)?;
        if registry == Registry::Enqueued {
            let pending = txn.open_table(PENDING).map_err(storage)?;
            return Ok(pending_entries(&pending, queue)?
                .into_iter()
                .map(|(_, id)| id)
                .collect());
        }
        let table = txn.open_table(REGISTRIES).map_err(storage)?;
        let prefix = format!("{}\0{queue}\0", registry.as_str());
        let mut ids = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(storage)? {
            let (key, _) = entry.map_err(storage)?;
            match key.value().strip_prefix(prefix.as_str()) {
                Some(id) => ids.push(id.to_string()),
                None => break,
            }
        }
        Ok(ids)
    }

    pub fn enqueued_ids(&self, queue: &str) -> QueueResult<Vec<String>> {
        self.ids(queue, Registry::Enqueued)
    }

    pub fn started_ids(&self, queue: &str) -> QueueResult<Vec<String>> {
        self.ids(queue, Registry::Started)
    }

    pub fn finished_ids(&self, queue: &str) -> QueueResult<Vec<String>> {
        self.ids(queue, Registry::Finished)
    }

    pub fn failed_ids(&self, queue: &str) -> QueueResult<Vec<String>> {
        self.ids(queue, Registry::Failed)
    }

    /// Number of pending jobs in `queue`.
    pub fn count(&self, queue: &str) -> QueueResult<u64> {
        let txn = self.db.begin_read().map_err(storage)?;
        let pending = txn.open_table(PENDING).map_err(storage)?;
        Ok(pending_entries(&pending, queue)?.len() as u64)
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Drop `id` from one registry of `queue`. A pending job removed from
    /// the enqueued registry is failed as cancelled; `delete_payload` also
    /// erases the job record. Returns false if the id was not registered.
    pub fn remove(
        &self,
        queue: &str,
        id: &str,
        registry: Registry,
        delete_payload: bool,
    ) -> QueueResult<bool> {
        let now = self.clock.now();
        let txn = self.db.begin_write().map_err(storage)?;
        let removed = {
            let mut jobs = txn.open_table(JOBS).map_err(storage)?;
            let removed = if registry == Registry::Enqueued {
                let mut pending = txn.open_table(PENDING).map_err(storage)?;
                let key = pending_entries(&pending, queue)?
                    .into_iter()
                    .find(|(_, pending_id)| pending_id == id)
                    .map(|(key, _)| key);
                match key {
                    Some(key) => {
                        pending.remove(key.as_str()).map_err(storage)?;
                        if !delete_payload && let Some(mut record) = read_job(&jobs, id)? {
                            record.status = JobStatus::Failed;
                            record.failure =
                                Some(JobFailure::new(FailureKind::Cancelled, "removed from queue"));
                            record.ended_at = Some(now);
                            write_job(&mut jobs, &record)?;
                        }
                        true
                    }
                    None => false,
                }
            } else {
                let mut registries = txn.open_table(REGISTRIES).map_err(storage)?;
                registries
                    .remove(registry_key(registry, queue, id).as_str())
                    .map_err(storage)?
                    .is_some()
            };
            if removed && delete_payload {
                jobs.remove(id).map_err(storage)?;
            }
            removed
        };
        txn.commit().map_err(storage)?;
        debug!(job_id = %id, %queue, ?registry, removed, "registry entry removed");
        Ok(removed)
    }

    /// Fail every started job whose lease has lapsed.
    pub fn reap_expired(&self) -> QueueResult<Vec<ReapedJob>> {
        let now = self.clock.now();
        let txn = self.db.begin_write().map_err(storage)?;
        let reaped = {
            let mut jobs = txn.open_table(JOBS).map_err(storage)?;
            let mut registries = txn.open_table(REGISTRIES).map_err(storage)?;

            let prefix = format!("{}\0", Registry::Started.as_str());
            let mut started = Vec::new();
            for entry in registries.range(prefix.as_str()..).map_err(storage)? {
                let (key, _) = entry.map_err(storage)?;
                let Some(rest) = key.value().strip_prefix(prefix.as_str()) else {
                    break;
                };
                if let Some((queue, id)) = rest.split_once('\0') {
                    started.push((queue.to_string(), id.to_string()));
                }
            }

            let mut reaped = Vec::new();
            for (queue, id) in started {
                let Some(mut record) = read_job(&jobs, &id)? else {
                    continue;
                };
                let lapsed = record.lease_expires_at.is_some_and(|at| at <= now);
                if record.status != JobStatus::Started || !lapsed {
                    continue;
                }
                record.status = JobStatus::Failed;
                record.failure = Some(JobFailure::new(
                    FailureKind::Timeout,
                    format!("lease expired after {}s", record.timeout_secs),
                ));
                record.ended_at = Some(now);
                write_job(&mut jobs, &record)?;
                move_registry(&mut registries, &queue, &id, Registry::Started, JobStatus::Failed)?;
                warn!(job_id = %id, %queue, worker = ?record.worker, "lease expired, job failed");
                reaped.push(ReapedJob {
                    id,
                    queue,
                    payload: record.payload,
                    worker: record.worker,
                    timeout: Duration::from_secs(record.timeout_secs),
                    started_at: record.started_at,
                    lease_expires_at: record.lease_expires_at,
                    reaped_at: now,
                });
            }
            reaped
        };
        txn.commit().map_err(storage)?;
        Ok(reaped)
    }
}

impl std::fmt::Debug for QueueBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBroker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn pending_key(queue: &str, seq: u64) -> String {
    format!("{queue}\0{seq:020}")
}

fn registry_key(registry: Registry, queue: &str, id: &str) -> String {
    format!("{}\0{queue}\0{id}", registry.as_str())
}

fn registry_for(status: JobStatus) -> Registry {
    match status {
        JobStatus::Pending => Registry::Enqueued,
        JobStatus::Started => Registry::Started,
        JobStatus::Finished => Registry::Finished,
        JobStatus::Failed => Registry::Failed,
    }
}

fn move_registry(
    registries: &mut Table<&'static str, &'static [u8]>,
    queue: &str,
    id: &str,
    from: Registry,
    to: JobStatus,
) -> QueueResult<()> {
    registries
        .remove(registry_key(from, queue, id).as_str())
        .map_err(storage)?;
    registries
        .insert(
            registry_key(registry_for(to), queue, id).as_str(),
            b"".as_slice(),
        )
        .map_err(storage)?;
    Ok(())
}

/// `(pending key, job id)` pairs of one queue in FIFO order.
fn pending_entries(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    queue: &str,
) -> QueueResult<Vec<(String, String)>> {
    let start = format!("{queue}\0");
    let end = format!("{queue}\x01");
    let mut entries = Vec::new();
    for entry in table.range(start.as_str()..end.as_str()).map_err(storage)? {
        let (key, value) = entry.map_err(storage)?;
        entries.push((
            key.value().to_string(),
            String::from_utf8_lossy(value.value()).into_owned(),
        ));
    }
    Ok(entries)
}

fn read_job(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> QueueResult<Option<JobRecord>> {
    match table.get(id).map_err(storage)? {
        Some(guard) => {
            let record = serde_json::from_slice(guard.value())
                .map_err(|e| QueueError::Deserialize(format!("job {id}: {e}")))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn write_job(table: &mut Table<&'static str, &'static [u8]>, record: &JobRecord) -> QueueResult<()> {
    let bytes = serde_json::to_vec(record).map_err(|e| QueueError::Serialize(e.to_string()))?;
    table
        .insert(record.id.as_str(), bytes.as_slice())
        .map_err(storage)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbgrid_core::ManualClock;
    use serde_json::json;

    fn broker_with(config: BrokerConfig) -> (QueueBroker, ManualClock) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::at_epoch();
        let broker = QueueBroker::new(&store, clock.shared(), config).unwrap();
        (broker, clock)
    }

    fn broker() -> (QueueBroker, ManualClock) {
        broker_with(BrokerConfig {
            grace: Duration::from_secs(5),
            max_depth: None,
        })
    }

    fn opts(id: &str) -> EnqueueOptions {
        EnqueueOptions::new(Duration::from_secs(10)).with_id(id)
    }

    #[test]
    fn duplicate_id_enqueues_once() {
        let (broker, _) = broker();
        let first = broker.enqueue("cpu", &json!({"n": 1}), opts("job-1")).unwrap();
        let second = broker.enqueue("cpu", &json!({"n": 2}), opts("job-1")).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(first.queue, second.queue);
        assert_eq!(broker.count("cpu").unwrap(), 1);
        let info = broker.fetch("job-1").unwrap().unwrap();
        assert_eq!(info.payload, Some(json!({"n": 1})));
    }

    #[test]
    fn enqueue_with_rolls_back_when_the_extra_write_fails() {
        let (broker, _) = broker();
        let err = broker
            .enqueue_with("cpu", &json!(1), opts("job-1"), |_| {
                Err(QueueError::Storage("side write failed".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, QueueError::Storage(_)));
        assert!(broker.fetch("job-1").unwrap().is_none());
        assert!(broker.enqueued_ids("cpu").unwrap().is_empty());

        let handle = broker
            .enqueue_with("cpu", &json!(1), opts("job-1"), |_| Ok::<(), QueueError>(()))
            .unwrap();
        assert!(handle.created);
        assert_eq!(broker.enqueued_ids("cpu").unwrap(), vec!["job-1".to_string()]);
    }

    #[test]
    fn ids_are_single_use() {
        let (broker, _) = broker();
        broker.enqueue("cpu", &json!(1), opts("job-1")).unwrap();
        let job = broker.reserve("cpu", "w1").unwrap().unwrap();
        broker.complete(&job.id, "w1", &json!("done")).unwrap();

        let again = broker.enqueue("cpu", &json!(1), opts("job-1")).unwrap();
        assert!(!again.created);
        assert_eq!(broker.count("cpu").unwrap(), 0);
    }

    #[test]
    fn generated_ids_are_unique() {
        let (broker, _) = broker();
        let a = broker
            .enqueue("cpu", &json!(1), EnqueueOptions::new(Duration::from_secs(1)))
            .unwrap();
        let b = broker
            .enqueue("cpu", &json!(1), EnqueueOptions::new(Duration::from_secs(1)))
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
    }

    #[test]
    fn fifo_within_queue_and_queues_are_separate() {
        let (broker, _) = broker();
        for id in ["a", "b", "c"] {
            broker.enqueue("cpu", &json!(id), opts(id)).unwrap();
        }
        broker.enqueue("gpu", &json!("g"), opts("g")).unwrap();

        assert_eq!(broker.enqueued_ids("cpu").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(broker.fetch("c").unwrap().unwrap().position, Some(2));

        let order: Vec<String> = (0..3)
            .map(|_| broker.reserve("cpu", "w").unwrap().unwrap().id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(broker.reserve("cpu", "w").unwrap().is_none());
        assert_eq!(broker.count("gpu").unwrap(), 1);
    }

    #[test]
    fn reserved_job_goes_to_one_worker() {
        let (broker, _) = broker();
        broker.enqueue("cpu", &json!(1), opts("job-1")).unwrap();

        let job = broker.reserve("cpu", "w1").unwrap().unwrap();
        assert!(broker.reserve("cpu", "w2").unwrap().is_none());
        assert_eq!(broker.started_ids("cpu").unwrap(), vec!["job-1"]);

        let err = broker.complete(&job.id, "w2", &json!(null)).unwrap_err();
        assert!(matches!(err, QueueError::NotLeaseHolder { .. }));

        broker.complete(&job.id, "w1", &json!({"ok": true})).unwrap();
        let info = broker.fetch("job-1").unwrap().unwrap();
        assert_eq!(info.status, JobStatus::Finished);
        assert_eq!(info.result, Some(json!({"ok": true})));
        assert!(broker.started_ids("cpu").unwrap().is_empty());
        assert_eq!(broker.finished_ids("cpu").unwrap(), vec!["job-1"]);

        let err = broker.complete(&job.id, "w1", &json!(null)).unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
    }

    #[test]
    fn fail_records_failure() {
        let (broker, _) = broker();
        broker.enqueue("cpu", &json!(1), opts("job-1")).unwrap();
        broker.reserve("cpu", "w1").unwrap().unwrap();
        broker
            .fail("job-1", "w1", JobFailure::new(FailureKind::Error, "boom"))
            .unwrap();

        let info = broker.fetch("job-1").unwrap().unwrap();
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.failure.unwrap().kind, FailureKind::Error);
        assert_eq!(broker.failed_ids("cpu").unwrap(), vec!["job-1"]);
    }

    #[test]
    fn lease_is_timeout_plus_grace() {
        let (broker, clock) = broker();
        broker.enqueue("cpu", &json!(1), opts("job-1")).unwrap();
        let job = broker.reserve("cpu", "w1").unwrap().unwrap();
        assert_eq!(
            job.lease_expires_at - job.started_at,
            TimeDelta::seconds(15)
        );

        clock.advance_secs(14);
        assert!(broker.reap_expired().unwrap().is_empty());

        clock.advance_secs(1);
        let reaped = broker.reap_expired().unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, "job-1");
        assert_eq!(reaped[0].worker.as_deref(), Some("w1"));

        let info = broker.fetch("job-1").unwrap().unwrap();
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.failure.unwrap().kind, FailureKind::Timeout);
        assert_eq!(broker.failed_ids("cpu").unwrap(), vec!["job-1"]);

        // The worker can no longer complete it.
        assert!(broker.complete("job-1", "w1", &json!(null)).is_err());
        assert!(broker.reap_expired().unwrap().is_empty());
    }

    #[test]
    fn max_depth_rejects_with_queue_full() {
        let (broker, _) = broker_with(BrokerConfig {
            grace: Duration::from_secs(5),
            max_depth: Some(2),
        });
        broker.enqueue("cpu", &json!(1), opts("a")).unwrap();
        broker.enqueue("cpu", &json!(1), opts("b")).unwrap();
        let err = broker.enqueue("cpu", &json!(1), opts("c")).unwrap_err();
        assert_eq!(err.kind(), nbgrid_core::ErrorKind::QueueFull);

        // Duplicates of existing ids are still accepted as no-ops.
        assert!(!broker.enqueue("cpu", &json!(1), opts("a")).unwrap().created);
        broker.enqueue("gpu", &json!(1), opts("d")).unwrap();
    }

    #[test]
    fn remove_pending_job() {
        let (broker, _) = broker();
        broker.enqueue("cpu", &json!(1), opts("a")).unwrap();
        broker.enqueue("cpu", &json!(1), opts("b")).unwrap();

        assert!(broker.remove("cpu", "a", Registry::Enqueued, false).unwrap());
        assert!(!broker.remove("cpu", "a", Registry::Enqueued, false).unwrap());
        assert_eq!(broker.enqueued_ids("cpu").unwrap(), vec!["b"]);
        let info = broker.fetch("a").unwrap().unwrap();
        assert_eq!(info.failure.unwrap().kind, FailureKind::Cancelled);

        assert!(broker.remove("cpu", "b", Registry::Enqueued, true).unwrap());
        assert!(broker.fetch("b").unwrap().is_none());
    }

    #[test]
    fn remove_from_finished_registry() {
        let (broker, _) = broker();
        broker.enqueue("cpu", &json!(1), opts("a")).unwrap();
        broker.reserve("cpu", "w").unwrap();
        broker.complete("a", "w", &json!(null)).unwrap();

        assert!(broker.remove("cpu", "a", Registry::Finished, false).unwrap());
        assert!(broker.finished_ids("cpu").unwrap().is_empty());
        assert!(broker.fetch("a").unwrap().is_some());
    }

    #[test]
    fn queue_name_prefixes_do_not_collide() {
        let (broker, _) = broker();
        broker.enqueue("cpu", &json!(1), opts("a")).unwrap();
        broker.enqueue("cpu.default", &json!(1), opts("b")).unwrap();
        assert_eq!(broker.count("cpu").unwrap(), 1);
        assert_eq!(broker.count("cpu.default").unwrap(), 1);
    }

    #[tokio::test]
    async fn reserve_wait_times_out_when_empty() {
        let (broker, _) = broker();
        let queues = vec!["cpu".to_string()];
        let job = broker
            .reserve_wait(&queues, "w", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn reserve_wait_wakes_on_enqueue() {
        let (broker, _) = broker();
        let queues = vec!["cpu".to_string(), "gpu".to_string()];

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .reserve_wait(&queues, "w", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue("gpu", &json!(1), opts("g")).unwrap();

        let job = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(job.id, "g");
        assert_eq!(job.queue, "gpu");
    }
}
