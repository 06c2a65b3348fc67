//! KvStore — key-value registry with TTLs, sets and atomic pipelines.
//!
//! Shares the redb database of [`StateStore`](crate::StateStore). Plain keys
//! live in the `kv` table as JSON envelopes carrying an optional expiry;
//! sets live in `kv_sets`, one row per member. Expired keys read as absent
//! and are removed lazily by [`KvStore::purge_expired`].
//!
//! A [`Pipeline`] groups writes that must land together: it is applied in a
//! single write transaction, so observers and crash recovery see either all
//! of its operations or none.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use nbgrid_core::SharedClock;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, map_err};
use crate::tables::{KV, KV_SETS};

const SET_SEPARATOR: char = '\x1f';

#[derive(Debug, Serialize, Deserialize)]
struct KvEntry {
    value: serde_json::Value,
    /// Unix milliseconds after which the key reads as absent.
    #[serde(default)]
    expires_at: Option<i64>,
}

impl KvEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

/// One write inside a pipeline.
#[derive(Debug, Clone)]
pub enum KvOp {
    Set {
        key: String,
        value: serde_json::Value,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    SetAdd {
        set: String,
        member: String,
    },
    SetRemove {
        set: String,
        member: String,
    },
}

/// An ordered batch of writes applied atomically by [`KvStore::execute`].
#[derive(Debug, Default, Clone)]
pub struct Pipeline {
    ops: Vec<KvOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
        ttl: Option<Duration>,
    ) -> StateResult<&mut Self> {
        let value = serde_json::to_value(value).map_err(map_err!(Serialize))?;
        self.ops.push(KvOp::Set {
            key: key.into(),
            value,
            ttl,
        });
        Ok(self)
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::Delete { key: key.into() });
        self
    }

    pub fn sadd(&mut self, set: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::SetAdd {
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(&mut self, set: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::SetRemove {
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Thread-safe KV registry over the shared database.
#[derive(Clone)]
pub struct KvStore {
    db: Arc<Database>,
    clock: SharedClock,
}

impl KvStore {
    pub fn new(store: &StateStore, clock: SharedClock) -> Self {
        Self {
            db: store.database(),
            clock,
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    // ── Plain keys ─────────────────────────────────────────────────

    /// Set a key, replacing any previous value and expiry.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> StateResult<()> {
        let mut pipe = Pipeline::new();
        pipe.set(key, value, ttl)?;
        self.execute(&pipe)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        let now_ms = self.now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let Some(guard) = table.get(key).map_err(map_err!(Read))? else {
            return Ok(None);
        };
        let entry: KvEntry = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
        if entry.is_expired(now_ms) {
            return Ok(None);
        }
        let value = serde_json::from_value(entry.value).map_err(map_err!(Deserialize))?;
        Ok(Some(value))
    }

    pub fn exists(&self, key: &str) -> StateResult<bool> {
        Ok(self.get::<serde_json::Value>(key)?.is_some())
    }

    /// Delete a key. Returns true if a live value existed.
    pub fn delete(&self, key: &str) -> StateResult<bool> {
        let existed = self.exists(key)?;
        let mut pipe = Pipeline::new();
        pipe.delete(key);
        self.execute(&pipe)?;
        Ok(existed)
    }

    /// All live keys starting with `prefix`, with their values.
    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> StateResult<Vec<(String, T)>> {
        let now_ms = self.now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let entry: KvEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if entry.is_expired(now_ms) {
                continue;
            }
            let value = serde_json::from_value(entry.value).map_err(map_err!(Deserialize))?;
            results.push((key.to_string(), value));
        }
        Ok(results)
    }

    /// Remove expired keys. Returns how many were dropped.
    pub fn purge_expired(&self) -> StateResult<usize> {
        let candidates = self.expired_keys()?;
        if candidates.is_empty() {
            return Ok(0);
        }
        self.remove_expired(&candidates)
    }

    fn expired_keys(&self) -> StateResult<Vec<String>> {
        let now_ms = self.now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let entry: KvEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if entry.is_expired(now_ms) {
                keys.push(key.value().to_string());
            }
        }
        Ok(keys)
    }

    /// Remove those of `candidates` that are still expired; a key refreshed
    /// since the scan stays.
    fn remove_expired(&self, candidates: &[String]) -> StateResult<usize> {
        let now_ms = self.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            for key in candidates {
                let expired = match table.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => serde_json::from_slice::<KvEntry>(guard.value())
                        .map_err(map_err!(Deserialize))?
                        .is_expired(now_ms),
                    None => false,
                };
                if expired {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if removed > 0 {
            debug!(count = removed, "expired keys purged");
        }
        Ok(removed)
    }

    // ── Sets ───────────────────────────────────────────────────────

    pub fn sadd(&self, set: &str, member: &str) -> StateResult<()> {
        let mut pipe = Pipeline::new();
        pipe.sadd(set, member);
        self.execute(&pipe)
    }

    pub fn srem(&self, set: &str, member: &str) -> StateResult<()> {
        let mut pipe = Pipeline::new();
        pipe.srem(set, member);
        self.execute(&pipe)
    }

    pub fn smembers(&self, set: &str) -> StateResult<BTreeSet<String>> {
        let prefix = format!("{set}{SET_SEPARATOR}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV_SETS).map_err(map_err!(Table))?;
        let mut members = BTreeSet::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            match key.value().strip_prefix(prefix.as_str()) {
                Some(member) => members.insert(member.to_string()),
                None => break,
            };
        }
        Ok(members)
    }

    pub fn sismember(&self, set: &str, member: &str) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV_SETS).map_err(map_err!(Table))?;
        Ok(table
            .get(set_key(set, member).as_str())
            .map_err(map_err!(Read))?
            .is_some())
    }

    // ── Pipelines ──────────────────────────────────────────────────

    /// Apply every operation of the pipeline in one transaction.
    pub fn execute(&self, pipeline: &Pipeline) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        self.apply(&txn, pipeline.ops())?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Apply the pipeline inside a transaction owned by another writer,
    /// which commits or drops it.
    pub fn stage(&self, txn: &WriteTransaction, pipeline: &Pipeline) -> StateResult<()> {
        self.apply(txn, pipeline.ops())
    }

    /// Apply the first `after` operations, then abandon the transaction as a
    /// crashed writer would. Nothing of the pipeline becomes visible.
    #[cfg(any(test, feature = "test-support"))]
    pub fn execute_interrupted(&self, pipeline: &Pipeline, after: usize) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let applied = after.min(pipeline.len());
        self.apply(&txn, &pipeline.ops()[..applied])?;
        txn.abort().map_err(map_err!(Transaction))?;
        debug!(applied, total = pipeline.len(), "pipeline interrupted");
        Ok(())
    }

    fn apply(&self, txn: &WriteTransaction, ops: &[KvOp]) -> StateResult<()> {
        let now_ms = self.now_ms();
        let mut kv = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut sets = txn.open_table(KV_SETS).map_err(map_err!(Table))?;
        for op in ops {
            match op {
                KvOp::Set { key, value, ttl } => {
                    let entry = KvEntry {
                        value: value.clone(),
                        expires_at: ttl.map(|ttl| {
                            now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
                        }),
                    };
                    let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
                    kv.insert(key.as_str(), bytes.as_slice())
                        .map_err(map_err!(Write))?;
                }
                KvOp::Delete { key } => {
                    kv.remove(key.as_str()).map_err(map_err!(Write))?;
                }
                KvOp::SetAdd { set, member } => {
                    sets.insert(set_key(set, member).as_str(), b"".as_slice())
                        .map_err(map_err!(Write))?;
                }
                KvOp::SetRemove { set, member } => {
                    sets.remove(set_key(set, member).as_str())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        Ok(())
    }
}

fn set_key(set: &str, member: &str) -> String {
    format!("{set}{SET_SEPARATOR}{member}")
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbgrid_core::ManualClock;

    fn kv() -> (KvStore, ManualClock) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::at_epoch();
        (KvStore::new(&store, clock.shared()), clock)
    }

    #[test]
    fn set_get_delete() {
        let (kv, _) = kv();
        kv.set("machine:a", &serde_json::json!({"ip": "10.0.0.1"}), None)
            .unwrap();

        let value: serde_json::Value = kv.get("machine:a").unwrap().unwrap();
        assert_eq!(value["ip"], "10.0.0.1");
        assert!(kv.delete("machine:a").unwrap());
        assert!(!kv.delete("machine:a").unwrap());
        assert!(kv.get::<serde_json::Value>("machine:a").unwrap().is_none());
    }

    #[test]
    fn ttl_expires_with_clock() {
        let (kv, clock) = kv();
        kv.set("heartbeat:a", &1u32, Some(Duration::from_secs(240)))
            .unwrap();

        clock.advance_secs(239);
        assert!(kv.exists("heartbeat:a").unwrap());

        clock.advance_secs(1);
        assert!(!kv.exists("heartbeat:a").unwrap());
        assert_eq!(kv.purge_expired().unwrap(), 1);
        assert_eq!(kv.purge_expired().unwrap(), 0);
    }

    #[test]
    fn purge_spares_keys_refreshed_after_the_scan() {
        let (kv, clock) = kv();
        kv.set("heartbeat:a", &1u32, Some(Duration::from_secs(5))).unwrap();
        kv.set("heartbeat:b", &1u32, Some(Duration::from_secs(5))).unwrap();
        clock.advance_secs(10);

        let candidates = kv.expired_keys().unwrap();
        assert_eq!(candidates.len(), 2);
        kv.set("heartbeat:a", &2u32, Some(Duration::from_secs(5))).unwrap();

        assert_eq!(kv.remove_expired(&candidates).unwrap(), 1);
        assert_eq!(kv.get::<u32>("heartbeat:a").unwrap(), Some(2));
        assert!(!kv.exists("heartbeat:b").unwrap());
    }

    #[test]
    fn set_refresh_resets_ttl() {
        let (kv, clock) = kv();
        kv.set("heartbeat:a", &1u32, Some(Duration::from_secs(10)))
            .unwrap();
        clock.advance_secs(8);
        kv.set("heartbeat:a", &2u32, Some(Duration::from_secs(10)))
            .unwrap();
        clock.advance_secs(8);
        assert_eq!(kv.get::<u32>("heartbeat:a").unwrap(), Some(2));
    }

    #[test]
    fn scan_prefix_skips_expired_and_foreign_keys() {
        let (kv, clock) = kv();
        kv.set("heartbeat:a", &1u32, Some(Duration::from_secs(5))).unwrap();
        kv.set("heartbeat:b", &2u32, None).unwrap();
        kv.set("machine:c", &3u32, None).unwrap();
        clock.advance_secs(10);

        let found: Vec<(String, u32)> = kv.scan_prefix("heartbeat:").unwrap();
        assert_eq!(found, vec![("heartbeat:b".to_string(), 2)]);
    }

    #[test]
    fn sets() {
        let (kv, _) = kv();
        kv.sadd("machines:dev", "cpu-aaaaaa").unwrap();
        kv.sadd("machines:dev", "cpu-bbbbbb").unwrap();
        kv.sadd("machines:dev", "cpu-aaaaaa").unwrap();
        kv.sadd("machines:devx", "cpu-cccccc").unwrap();

        let members = kv.smembers("machines:dev").unwrap();
        assert_eq!(members.len(), 2);
        assert!(kv.sismember("machines:dev", "cpu-bbbbbb").unwrap());

        kv.srem("machines:dev", "cpu-bbbbbb").unwrap();
        assert!(!kv.sismember("machines:dev", "cpu-bbbbbb").unwrap());
        assert_eq!(kv.smembers("machines:devx").unwrap().len(), 1);
        assert!(kv.smembers("machines:none").unwrap().is_empty());
    }

    #[test]
    fn pipeline_applies_all_ops() {
        let (kv, _) = kv();
        let mut pipe = Pipeline::new();
        pipe.set("machine:n1", &"instance", None)
            .unwrap()
            .sadd("machines:dev", "n1")
            .sadd("clusters", "dev");
        kv.execute(&pipe).unwrap();

        assert!(kv.exists("machine:n1").unwrap());
        assert!(kv.sismember("machines:dev", "n1").unwrap());
        assert!(kv.sismember("clusters", "dev").unwrap());
    }

    #[test]
    fn interrupted_pipeline_leaves_nothing_behind() {
        let (kv, _) = kv();
        let mut pipe = Pipeline::new();
        pipe.set("machine:n1", &"instance", None)
            .unwrap()
            .sadd("machines:dev", "n1")
            .sadd("clusters", "dev");

        kv.execute_interrupted(&pipe, 1).unwrap();

        assert!(!kv.exists("machine:n1").unwrap());
        assert!(!kv.sismember("machines:dev", "n1").unwrap());
        assert!(kv.smembers("clusters").unwrap().is_empty());
    }
}
