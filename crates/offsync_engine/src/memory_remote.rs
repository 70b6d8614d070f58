//! In-memory remote store with fault injection.

use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use async_trait::async_trait;
use offsync_protocol::{Filter, Record, RecordKey, Version};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Default)]
struct RemoteState {
    rows: BTreeMap<RecordKey, Record>,
    seen_tokens: HashMap<String, Option<Record>>,
    ignore_tokens: bool,
    offline: bool,
    stall_next: u32,
    drop_next: u32,
    reject_next: u32,
    reject_message: String,
    rejected_keys: HashMap<RecordKey, String>,
    delay: Option<Duration>,
    calls: u64,
    writes: u64,
    deduplicated: u64,
}

impl RemoteState {
    fn check_not_newer(&self, key: &RecordKey, version: Version) -> RemoteResult<()> {
        match self.rows.get(key) {
            Some(row) if row.version >= version => Err(RemoteError::Conflict {
                current: Some(row.clone()),
            }),
            _ => Ok(()),
        }
    }

    fn check_base(&self, key: &RecordKey, base: Option<Version>, missing_ok: bool) -> RemoteResult<()> {
        let Some(base) = base else {
            return Ok(());
        };
        match self.rows.get(key) {
            Some(row) if row.version == base => Ok(()),
            None if missing_ok => Ok(()),
            current => Err(RemoteError::Conflict {
                current: current.cloned(),
            }),
        }
    }
}

enum Admission {
    Proceed,
    Stall,
}

/// An authoritative store kept in memory.
///
/// Behaves like a well-formed remote: upserts, delete-if-exists, base version
/// checks and deduplication by idempotency token. Committed rows keep the
/// version the client wrote, so last-write-wins compares client write times.
///
/// Faults can be injected to exercise the engine's failure paths:
/// - [`set_offline`](Self::set_offline): every call fails with a network error
/// - [`stall_next`](Self::stall_next): calls never answer (the caller's timeout fires)
/// - [`drop_next_responses`](Self::drop_next_responses): writes are applied but
///   answered with a network error, as if the response was lost
/// - [`reject_next`](Self::reject_next) / [`reject_record`](Self::reject_record):
///   writes are refused with an application error
/// - [`set_delay`](Self::set_delay): every call is delayed
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores rows directly, bypassing version checks and faults.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock();
        for record in records {
            state.rows.insert(record.key(), record);
        }
    }

    /// Removes a row directly, as another client would.
    pub fn remove(&self, key: &RecordKey) -> Option<Record> {
        self.state.lock().rows.remove(key)
    }

    /// Returns the current row, if any.
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.state.lock().rows.get(key).cloned()
    }

    /// Returns every row of `table`, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state
            .lock()
            .rows
            .values()
            .filter(|row| row.table == table)
            .cloned()
            .collect()
    }

    /// Stops deduplicating by idempotency token, like a remote without support for it.
    pub fn set_ignore_tokens(&self, ignore: bool) {
        self.state.lock().ignore_tokens = ignore;
    }

    /// Makes every call fail with a network error while `true`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// The next `count` calls never answer.
    pub fn stall_next(&self, count: u32) {
        self.state.lock().stall_next = count;
    }

    /// The next `count` writes are applied but answered with a network error.
    pub fn drop_next_responses(&self, count: u32) {
        self.state.lock().drop_next = count;
    }

    /// The next `count` writes are refused with `message`.
    pub fn reject_next(&self, count: u32, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.reject_next = count;
        state.reject_message = message.into();
    }

    /// Every write to `key` is refused with `message` until cleared.
    pub fn reject_record(&self, key: RecordKey, message: impl Into<String>) {
        self.state.lock().rejected_keys.insert(key, message.into());
    }

    /// Stops refusing writes.
    pub fn clear_rejections(&self) {
        let mut state = self.state.lock();
        state.reject_next = 0;
        state.rejected_keys.clear();
    }

    /// Delays every call by `delay`; `None` answers immediately.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Number of calls received, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.state.lock().calls
    }

    /// Number of writes that changed stored state.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Number of writes answered from the idempotency token table.
    pub fn deduplicated_count(&self) -> u64 {
        self.state.lock().deduplicated
    }

    async fn admit(&self, write_key: Option<&RecordKey>) -> RemoteResult<()> {
        let (admission, delay) = {
            let mut state = self.state.lock();
            state.calls += 1;
            if state.offline {
                return Err(RemoteError::Network("remote unreachable".into()));
            }
            let admission = if state.stall_next > 0 {
                state.stall_next -= 1;
                Admission::Stall
            } else {
                Admission::Proceed
            };
            if let (Admission::Proceed, Some(key)) = (&admission, write_key) {
                if let Some(message) = state.rejected_keys.get(key) {
                    return Err(RemoteError::Rejected(message.clone()));
                }
                if state.reject_next > 0 {
                    state.reject_next -= 1;
                    return Err(RemoteError::Rejected(state.reject_message.clone()));
                }
            }
            (admission, state.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match admission {
            Admission::Proceed => Ok(()),
            Admission::Stall => std::future::pending().await,
        }
    }

    fn commit(
        &self,
        token: &str,
        write: impl FnOnce(&mut RemoteState) -> RemoteResult<Option<Record>>,
    ) -> RemoteResult<Option<Record>> {
        let mut state = self.state.lock();
        if !state.ignore_tokens {
            if let Some(previous) = state.seen_tokens.get(token) {
                let previous = previous.clone();
                state.deduplicated += 1;
                return Ok(previous);
            }
        }

        let committed = write(&mut *state)?;
        state.writes += 1;
        state.seen_tokens.insert(token.to_string(), committed.clone());

        if state.drop_next > 0 {
            state.drop_next -= 1;
            return Err(RemoteError::Network("connection reset before response".into()));
        }
        Ok(committed)
    }

    fn upsert(
        &self,
        record: &Record,
        base: Option<Version>,
        fresh_only: bool,
        token: &str,
    ) -> RemoteResult<Record> {
        let committed = self.commit(token, |state| {
            let key = record.key();
            if fresh_only {
                state.check_not_newer(&key, record.version)?;
            }
            state.check_base(&key, base, false)?;
            state.rows.insert(record.key(), record.clone());
            Ok(Some(record.clone()))
        })?;
        Ok(committed.unwrap_or_else(|| record.clone()))
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Record>> {
        self.admit(None).await?;
        Ok(self
            .rows(table)
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect())
    }

    async fn insert(&self, record: &Record, token: &str) -> RemoteResult<Record> {
        self.admit(Some(&record.key())).await?;
        self.upsert(record, None, true, token)
    }

    async fn update(
        &self,
        record: &Record,
        base_version: Option<Version>,
        token: &str,
    ) -> RemoteResult<Record> {
        self.admit(Some(&record.key())).await?;
        self.upsert(record, base_version, false, token)
    }

    async fn delete(
        &self,
        key: &RecordKey,
        base_version: Option<Version>,
        token: &str,
    ) -> RemoteResult<()> {
        self.admit(Some(key)).await?;
        self.commit(token, |state| {
            state.check_base(key, base_version, true)?;
            state.rows.remove(key);
            Ok(None)
        })
        .map(|_| ())
    }
}
