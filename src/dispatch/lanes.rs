// SPDX-License-Identifier: Apache-2.0

//! Per-transaction execution lanes.
//!
//! Fragments that share a transaction hold the lane while they run. The lane
//! is a fair mutex, so waiters proceed in submission order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct TransactionLanes {
    lanes: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TransactionLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive use of the transaction's lane.
    pub async fn acquire(&self, transaction_id: &str) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock();
            // Lanes nobody holds or waits on can go.
            lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
            Arc::clone(lanes.entry(transaction_id.to_string()).or_default())
        };
        lane.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
