use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Logs a poisoned page-cache lock and hands back its guard.
///
/// The options, rule snapshot and error list stay usable after a panic in
/// another request; at worst they hold the last value written before it.
fn recover<G>(poisoned: PoisonError<G>, owner: &'static str, op: &'static str, kind: &'static str) -> G {
    warn!(
        op,
        owner,
        lock_kind = kind,
        result = "poisoned_recovered",
        "Recovered from poisoned page cache lock"
    );
    poisoned.into_inner()
}

pub(crate) fn read_guard<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "rwlock.read"))
}

pub(crate) fn write_guard<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "rwlock.write"))
}

pub(crate) fn mutex_guard<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "mutex.lock"))
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn poisoned_rwlock_keeps_last_value() {
        let lock = RwLock::new(7_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let mut guard = lock.write().expect("lock should be acquired");
            *guard = 11;
            panic!("poison the lock");
        }));

        assert!(lock.is_poisoned());
        assert_eq!(*read_guard(&lock, "test", "read"), 11);
        *write_guard(&lock, "test", "write") = 12;
        assert_eq!(*read_guard(&lock, "test", "read"), 12);
    }

    #[test]
    fn poisoned_mutex_is_recovered() {
        let lock = Mutex::new(Vec::<u8>::new());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison the mutex");
        }));

        mutex_guard(&lock, "test", "push").push(1);
        assert_eq!(mutex_guard(&lock, "test", "len").len(), 1);
    }
}
