//! Cooperative back-pressure tokens.
//!
//! Downstream stages (submission, publish) park a token to pause polling
//! without dropping messages. `wait` blocks while the set is non-empty. The
//! only guarantee is liveness: once the set empties every waiter wakes.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

/// Opaque park token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParkToken(Uuid);

impl ParkToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParkToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Parkers {
    tokens: Mutex<HashSet<ParkToken>>,
    count_tx: watch::Sender<usize>,
}

impl Parkers {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            tokens: Mutex::new(HashSet::new()),
            count_tx,
        }
    }

    pub fn park(&self, token: ParkToken) {
        let mut tokens = self.tokens.lock();
        if tokens.insert(token) {
            self.count_tx.send_replace(tokens.len());
        }
    }

    pub fn unpark(&self, token: ParkToken) {
        let mut tokens = self.tokens.lock();
        if tokens.remove(&token) {
            self.count_tx.send_replace(tokens.len());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// Returns immediately if no token is parked, otherwise blocks until the
    /// set empties.
    pub async fn wait(&self) {
        let mut count_rx = self.count_tx.subscribe();
        while *count_rx.borrow_and_update() != 0 {
            if count_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Parkers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_when_empty() {
        let parkers = Parkers::new();
        // No token parked: wait completes immediately.
        tokio::time::timeout(Duration::from_millis(10), parkers.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_unparked() {
        let parkers = Arc::new(Parkers::new());
        let token = ParkToken::new();
        parkers.park(token);

        let waiter = {
            let parkers = parkers.clone();
            tokio::spawn(async move { parkers.wait().await })
        };

        // Still parked: the waiter must not complete.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        parkers.unpark(token);
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_all_waiters_wake() {
        let parkers = Arc::new(Parkers::new());
        let t1 = ParkToken::new();
        let t2 = ParkToken::new();
        parkers.park(t1);
        parkers.park(t2);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let parkers = parkers.clone();
                tokio::spawn(async move { parkers.wait().await })
            })
            .collect();

        parkers.unpark(t1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        parkers.unpark(t2);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(100), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unpark_unknown_token_is_noop() {
        let parkers = Parkers::new();
        parkers.park(ParkToken::new());
        parkers.unpark(ParkToken::new());
        assert!(!parkers.is_empty());
    }
}
