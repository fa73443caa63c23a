//! Per-server serialization for peer sagas. Two sagas against the same
//! server can double-allocate an address or duplicate kernel rules, so every
//! mutating peer handler holds this lock for the saga's duration. Different
//! servers never contend: their kernel resource names are disjoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Default)]
pub struct ServerLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ServerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, server_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(server_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn same_server_is_mutually_exclusive() {
        let locks = Arc::new(ServerLocks::new());
        let in_flight = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(1).await;
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn different_servers_do_not_block_each_other() {
        let locks = ServerLocks::new();
        let _one = locks.acquire(1).await;
        // Would deadlock if server ids shared a lock.
        let _two = locks.acquire(2).await;
    }
}
