pub(crate) mod env {
    use once_cell::sync::Lazy;
    use std::sync::{Mutex, MutexGuard};

    static LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    /// Exclusive access to the process environment for one test.
    ///
    /// Variables touched through the guard get their previous values back,
    /// in reverse order, when it drops.
    pub(crate) struct EnvLock {
        _held: MutexGuard<'static, ()>,
        restore: Vec<(String, Option<String>)>,
    }

    pub(crate) fn lock() -> EnvLock {
        EnvLock {
            _held: LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
            restore: Vec::new(),
        }
    }

    impl EnvLock {
        pub(crate) fn set(&mut self, key: &str, value: &str) {
            self.record(key);
            std::env::set_var(key, value);
        }

        pub(crate) fn unset(&mut self, key: &str) {
            self.record(key);
            std::env::remove_var(key);
        }

        fn record(&mut self, key: &str) {
            self.restore.push((key.to_string(), std::env::var(key).ok()));
        }
    }

    impl Drop for EnvLock {
        fn drop(&mut self) {
            while let Some((key, previous)) = self.restore.pop() {
                match previous {
                    Some(value) => std::env::set_var(&key, value),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}
