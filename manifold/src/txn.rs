//! The write-transaction cache.
//!
//! Every asynchronous write produces exactly one transaction. The
//! scheduler is the only mutator; clients poll records through the
//! service façade. Records are garbage-collected once their last
//! update is older than the configured TTL.

use chrono::{Duration as ChronoDuration, Utc};
use manifold_api::{
    types::{
        transaction::{State, Transaction},
        Error,
    },
    Result,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Transactions {
    entries: Arc<Mutex<HashMap<String, Transaction>>>,
    ttl: Duration,
}

impl Transactions {
    pub fn new(ttl: Duration) -> Transactions {
        Transactions {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    // The cache is unusable if the mutex is poisoned; that can only
    // happen if this module panicked while holding it, which would
    // be a bug in this module. Failing loudly beats limping along
    // with half-tracked writes.

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Transaction>> {
        self.entries
            .lock()
            .expect("transaction cache mutex poisoned")
    }

    /// Creates a PENDING transaction and returns its record. IDs
    /// are time-ordered UUIDs, so clients sorting transactions by ID
    /// see them in submission order.
    pub fn create(&self) -> Transaction {
        let txn = Transaction::new(uuid::Uuid::now_v7().to_string());

        self.lock().insert(txn.id.clone(), txn.clone());
        txn
    }

    /// Looks a transaction up. The TTL is not slid; polling a
    /// transaction doesn't keep it alive.
    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.lock().get(id).cloned()
    }

    /// Advances a transaction's state, stamping `updated`. Only
    /// forward transitions through the FSM are accepted.
    pub fn update(
        &self,
        id: &str,
        state: State,
        message: &str,
    ) -> Result<()> {
        let mut entries = self.lock();
        let txn = entries.get_mut(id).ok_or(Error::NotFound)?;

        if !txn.state.can_advance(state) {
            return Err(Error::Internal(format!(
                "transaction {} can't move from {} to {}",
                id, txn.state, state
            )));
        }

        txn.state = state;
        txn.message = message.to_string();
        txn.updated = Utc::now();
        Ok(())
    }

    /// Removes a record outright. Only used to undo a transaction
    /// whose write was never accepted onto the queue; such a
    /// transaction was never observable.
    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    // Drops every record whose last update is older than the TTL.

    fn sweep(&self) {
        let Ok(ttl) = ChronoDuration::from_std(self.ttl) else {
            return;
        };
        let cutoff = Utc::now() - ttl;
        let mut entries = self.lock();
        let before = entries.len();

        entries.retain(|_, txn| txn.updated > cutoff);

        let dropped = before - entries.len();

        if dropped > 0 {
            debug!("swept {} expired transactions", dropped)
        }
    }

    /// Starts the background sweeper. It runs until the token
    /// fires.
    pub fn start_sweeper(
        &self,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.ttl.div_f64(4.0).max(Duration::from_secs(1));

        tokio::spawn(async move {
            info!("transaction sweeper running");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("transaction sweeper stopping");
                        return;
                    }
                    _ = tokio::time::sleep(period) => cache.sweep()
                }
            }
        })
    }

    /// Marks every non-terminal transaction as failed with the given
    /// message. Called during shutdown, after the write loop has
    /// drained, so nothing is left dangling in PENDING forever.
    pub fn fail_in_flight(&self, message: &str) {
        let now = Utc::now();
        let mut entries = self.lock();

        for txn in entries.values_mut() {
            if !txn.state.is_terminal() {
                warn!(id = &txn.id, "failing in-flight transaction");
                txn.state = State::Error;
                txn.message = message.to_string();
                txn.updated = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Transactions {
        Transactions::new(Duration::from_secs(300))
    }

    #[test]
    fn test_create_and_get() {
        let txns = cache();
        let txn = txns.create();

        assert_eq!(txn.state, State::Pending);

        let found = txns.get(&txn.id).unwrap();

        assert_eq!(found, txn);
        assert!(txns.get("nope").is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let txns = cache();
        let mut ids: Vec<_> =
            (0..100).map(|_| txns.create().id).collect();

        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_update_moves_forward() {
        let txns = cache();
        let txn = txns.create();

        txns.update(&txn.id, State::Writing, "write in progress")
            .unwrap();

        let t = txns.get(&txn.id).unwrap();

        assert_eq!(t.state, State::Writing);
        assert_eq!(t.message, "write in progress");
        assert!(t.updated >= t.created);

        txns.update(&txn.id, State::Done, "").unwrap();
        assert_eq!(txns.get(&txn.id).unwrap().state, State::Done);
    }

    #[test]
    fn test_update_rejects_backward() {
        let txns = cache();
        let txn = txns.create();

        txns.update(&txn.id, State::Writing, "").unwrap();
        txns.update(&txn.id, State::Error, "boom").unwrap();

        // Terminal states are sticky.

        assert!(txns.update(&txn.id, State::Writing, "").is_err());
        assert!(txns.update(&txn.id, State::Done, "").is_err());
        assert_eq!(txns.get(&txn.id).unwrap().state, State::Error);
    }

    #[test]
    fn test_update_rejects_pending_to_done() {
        let txns = cache();
        let txn = txns.create();

        assert!(txns.update(&txn.id, State::Done, "").is_err());
    }

    #[test]
    fn test_update_unknown_id() {
        let txns = cache();

        assert_eq!(
            txns.update("nope", State::Writing, ""),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_remove() {
        let txns = cache();
        let txn = txns.create();

        txns.remove(&txn.id);
        assert!(txns.get(&txn.id).is_none());
    }

    #[test]
    fn test_sweep() {
        let txns = Transactions::new(Duration::from_secs(60));
        let old = txns.create();
        let fresh = txns.create();

        // Age the first record past the TTL by hand.

        {
            let mut entries = txns.lock();
            let txn = entries.get_mut(&old.id).unwrap();

            txn.updated = Utc::now() - ChronoDuration::seconds(61);
        }

        txns.sweep();

        assert!(txns.get(&old.id).is_none());
        assert!(txns.get(&fresh.id).is_some());
    }

    #[test]
    fn test_fail_in_flight() {
        let txns = cache();
        let pending = txns.create();
        let done = txns.create();

        txns.update(&done.id, State::Writing, "").unwrap();
        txns.update(&done.id, State::Done, "").unwrap();

        txns.fail_in_flight("write cancelled before execution");

        let t = txns.get(&pending.id).unwrap();

        assert_eq!(t.state, State::Error);
        assert_eq!(t.message, "write cancelled before execution");

        // Terminal transactions are left alone.

        assert_eq!(txns.get(&done.id).unwrap().state, State::Done);
    }

    #[tokio::test]
    async fn test_sweeper_task() {
        let txns = Transactions::new(Duration::from_millis(500));
        let txn = txns.create();
        let token = CancellationToken::new();
        let task = txns.start_sweeper(token.clone());

        // The sweeper runs at least once a second; after two
        // periods the record is past its 500 ms TTL and gone.

        tokio::time::sleep(Duration::from_millis(2200)).await;

        assert!(txns.get(&txn.id).is_none());

        token.cancel();
        task.await.unwrap();
    }
}
