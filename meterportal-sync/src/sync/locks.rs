use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard proving exclusive use of one meter's statistics.
pub type MeterGuard = OwnedMutexGuard<()>;

/// One exclusion lock per meter. Whoever holds it may read watermarks and
/// write statistics for that meter; nobody else may.
#[derive(Default)]
pub struct MeterLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MeterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, meter_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(meter_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// `None` when the meter is busy.
    pub fn try_acquire(&self, meter_id: &str) -> Option<MeterGuard> {
        self.lock_for(meter_id).try_lock_owned().ok()
    }

    /// Waits until the meter is free. Waiters are served in arrival order.
    pub async fn acquire(&self, meter_id: &str) -> MeterGuard {
        self.lock_for(meter_id).lock_owned().await
    }
}
