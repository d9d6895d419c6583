//! Work unit pool and retry loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{ExecutorConfig, RetryPolicy};
use crate::error::{Error, ExecError};
use crate::opgen::Operation;
use crate::storage::{SchemaStorage, ScopeKind, StorageError};

/// A failed attempt: summary of the failing operation and the cause.
pub(super) type Attempt = Result<(), (String, StorageError)>;

/// Run `attempt` until it succeeds, fails permanently or the policy runs out.
pub(super) fn with_retry(
    policy: &RetryPolicy,
    stage: usize,
    mut attempt: impl FnMut() -> Attempt,
) -> Result<(), ExecError> {
    let mut attempts = 1;
    loop {
        match attempt() {
            Ok(()) => return Ok(()),
            Err((op, source)) if source.is_retryable() && policy.allows_retry(attempts) => {
                let delay = policy.backoff(attempts);
                warn!(
                    stage,
                    op = %op,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "retrying after transient failure"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempts += 1;
            }
            Err((op, source)) => {
                return Err(ExecError::Storage {
                    stage,
                    op,
                    attempts,
                    source,
                })
            }
        }
    }
}

/// Run one work unit in its own background transaction.
fn run_unit(storage: &dyn SchemaStorage, op: &Operation, timeout: Option<Duration>) -> Attempt {
    let started = Instant::now();
    let mut txn = storage
        .begin(ScopeKind::Background)
        .map_err(|e| (op.to_string(), e))?;
    if let Some(limit) = timeout {
        txn.set_deadline(started + limit);
    }
    txn.declare(&op.access_set());
    if let Err(e) = txn.execute(op) {
        txn.abort();
        return Err((op.to_string(), e));
    }
    if let Some(limit) = timeout {
        let elapsed = started.elapsed();
        if elapsed > limit {
            txn.abort();
            return Err((op.to_string(), StorageError::Timeout(elapsed)));
        }
    }
    txn.commit().map_err(|e| (op.to_string(), e))
}

/// Run work units on a bounded pool of scoped threads.
///
/// `on_commit` is called with the ordinal of every unit that committed. The
/// first failure stops the pool from starting further units; units already
/// running are allowed to finish.
pub(super) fn run_units(
    storage: &dyn SchemaStorage,
    config: &ExecutorConfig,
    stage: usize,
    units: &[(u32, Operation)],
    on_commit: &(dyn Fn(u32) -> Result<(), Error> + Sync),
) -> Result<(), ExecError> {
    if units.is_empty() {
        return Ok(());
    }
    let workers = config.max_concurrent_units.max(1).min(units.len());
    let timeout = config.unit_timeout();
    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<ExecError>> = Mutex::new(None);

    debug!(stage, units = units.len(), workers, "starting work units");
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if failed.load(Ordering::SeqCst) {
                    break;
                }
                let Some((ordinal, op)) = units.get(next.fetch_add(1, Ordering::SeqCst)) else {
                    break;
                };
                let result = with_retry(&config.unit_retry, stage, || {
                    run_unit(storage, op, timeout)
                })
                .and_then(|()| on_commit(*ordinal).map_err(ExecError::Checkpoint));
                match result {
                    Ok(()) => debug!(stage, unit = *ordinal, op = %op, "work unit committed"),
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        first_error.lock().get_or_insert(e);
                        break;
                    }
                }
            });
        }
    });

    match first_error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::keys::{self, ShardRange};
    use crate::storage::{Fault, FaultKind, MemoryStorage};

    fn backfill(range: ShardRange) -> Operation {
        Operation::BackfillIndex {
            table_id: 52,
            index_id: 2,
            source_index_id: keys::PRIMARY_INDEX_ID,
            range,
        }
    }

    fn units(parts: usize) -> Vec<(u32, Operation)> {
        backfill(ShardRange::FULL)
            .split(parts)
            .into_iter()
            .enumerate()
            .map(|(i, op)| (i as u32, op))
            .collect()
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig::default().with_unit_retry(RetryPolicy::immediate(3))
    }

    #[test]
    fn test_units_cover_every_row() {
        let storage = MemoryStorage::new();
        storage.seed_rows(52, keys::PRIMARY_INDEX_ID, 1000);
        let committed = Mutex::new(Vec::new());

        run_units(&storage, &config(), 2, &units(8), &|ordinal| {
            committed.lock().push(ordinal);
            Ok(())
        })
        .unwrap();

        let mut committed = committed.into_inner();
        committed.sort_unstable();
        assert_eq!(committed, (0..8).collect::<Vec<_>>());
        assert_eq!(storage.count_prefix(&keys::index_prefix(52, 2)), 1000);
        assert_eq!(storage.executed("BackfillIndex"), 8);
    }

    #[test]
    fn test_transient_unit_failure_is_retried() {
        let storage = MemoryStorage::new();
        storage.seed_rows(52, keys::PRIMARY_INDEX_ID, 100);
        storage.inject(Fault::on("BackfillIndex", FaultKind::Transient).at_shard(0).times(2));

        run_units(&storage, &config(), 2, &units(4), &|_| Ok(())).unwrap();
        assert_eq!(storage.count_prefix(&keys::index_prefix(52, 2)), 100);
    }

    #[test]
    fn test_exhausted_retries_fail_the_pool() {
        let storage = MemoryStorage::new();
        storage.inject(Fault::on("BackfillIndex", FaultKind::Transient).at_shard(0));

        let err = run_units(&storage, &config(), 2, &units(4), &|_| Ok(())).unwrap_err();
        match err {
            ExecError::Storage {
                stage,
                attempts,
                source,
                ..
            } => {
                assert_eq!(stage, 2);
                assert_eq!(attempts, 3);
                assert!(source.is_retryable());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unit_timeout() {
        let storage = MemoryStorage::new();
        storage.inject(
            Fault::on("BackfillIndex", FaultKind::Stall(Duration::from_millis(30))).at_shard(0),
        );
        let config = ExecutorConfig::default()
            .with_unit_retry(RetryPolicy::immediate(2))
            .with_unit_timeout(Duration::from_millis(5));

        let err = run_units(&storage, &config, 0, &units(2), &|_| Ok(())).unwrap_err();
        assert!(matches!(
            err,
            ExecError::Storage {
                source: StorageError::Timeout(_),
                attempts: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_stalled_unit_is_abandoned_and_retried() {
        let storage = MemoryStorage::new();
        storage.seed_rows(52, keys::PRIMARY_INDEX_ID, 100);
        storage.inject(
            Fault::on("BackfillIndex", FaultKind::Stall(Duration::from_secs(30)))
                .at_shard(0)
                .times(1),
        );
        let config = ExecutorConfig::default()
            .with_unit_retry(RetryPolicy::immediate(3))
            .with_unit_timeout(Duration::from_millis(20));

        let started = Instant::now();
        run_units(&storage, &config, 0, &units(2), &|_| Ok(())).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(storage.count_prefix(&keys::index_prefix(52, 2)), 100);
        assert_eq!(storage.stats().aborts, 1);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let storage = MemoryStorage::new();
        storage.inject(Fault::on("BackfillIndex", FaultKind::Fatal).times(1));
        let err = run_units(
            &storage,
            &config().with_max_concurrent_units(1),
            1,
            &units(1),
            &|_| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Storage { attempts: 1, .. }));
    }

    #[test]
    fn test_with_retry_counts_attempts() {
        let mut calls = 0;
        with_retry(&RetryPolicy::immediate(5), 0, || {
            calls += 1;
            if calls < 3 {
                Err(("op".to_string(), StorageError::Transient("busy".into())))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(calls, 3);
    }
}
