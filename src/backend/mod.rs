pub mod cache;
pub mod filesystem;
pub mod library;
pub mod mangadex;
pub mod page_loader;
pub mod progress;
pub mod rate_limit;
pub mod source;
mod store;

#[cfg(test)]
pub(crate) mod test_server;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
