//! The `SharedStore` contract, §1/§6.5: the hypervisor's coordination tree
//! used by the attach protocol. Accessed only through this minimal
//! interface; no concrete backend is implemented here.

use std::time::Duration;

use crate::error::Result;

/// Directory permissions as written by the plug sequence, §4.5.2 steps 1-2:
/// one owning domain, plus a list of other domains granted read access.
#[derive(Debug, Clone)]
pub struct Permissions {
    pub owner_domid: u32,
    pub readers: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    /// Transient conflict; caller restarts the sequence from its first step
    /// per §4.5.2 step 5.
    Retry,
}

/// The outcome of the "wait until predicate over two keys" primitive,
/// §4.5.4 / Design Notes §9: one combined wait rather than two independently
/// awaited watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Both keys satisfied the predicate before the deadline.
    Satisfied,
    /// The deadline elapsed first.
    TimedOut,
}

pub trait SharedStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Option<String>>;
    async fn write(&self, path: &str, value: &str) -> Result<()>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn set_permissions(&self, path: &str, perms: Permissions) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    /// Registers watch interest in `path`; wake-ups are delivered only
    /// through [`SharedStore::wait_for_states`], per the Design Notes'
    /// "single combined primitive" guidance.
    async fn watch(&self, path: &str) -> Result<()>;
    async fn transaction_start(&self) -> Result<TransactionId>;
    async fn transaction_end(&self, txn: TransactionId) -> Result<TxnOutcome>;

    /// Blocks until `read(key_a)` and `read(key_b)` both equal one of
    /// `accepted` (by value; a missing `key_b` counts as accepted once
    /// `treat_missing_b_as_success` is set, modeling "the guest vanished"),
    /// or `deadline` elapses.
    async fn wait_for_states(
        &self,
        key_a: &str,
        key_b: &str,
        accepted: &[&str],
        treat_missing_b_as_success: bool,
        deadline: Duration,
    ) -> Result<WaitOutcome>;
}

/// An in-memory [`SharedStore`] for tests: polls its own map instead of a
/// real transport, but preserves the same interface and the same
/// two-key-wait semantics as a real backend would.
#[derive(Default)]
pub struct InMemorySharedStore {
    tree: std::sync::Mutex<std::collections::BTreeMap<String, String>>,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, path: &str, value: &str) {
        self.tree
            .lock()
            .unwrap()
            .insert(path.to_string(), value.to_string());
    }
}

impl SharedStore for InMemorySharedStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.tree.lock().unwrap().get(path).cloned())
    }

    async fn write(&self, path: &str, value: &str) -> Result<()> {
        self.tree
            .lock()
            .unwrap()
            .insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn mkdir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn set_permissions(&self, _path: &str, _perms: Permissions) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        let prefix = format!("{path}/");
        tree.retain(|k, _| k != path && !k.starts_with(&prefix));
        Ok(())
    }

    async fn watch(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn transaction_start(&self) -> Result<TransactionId> {
        Ok(TransactionId(0))
    }

    async fn transaction_end(&self, _txn: TransactionId) -> Result<TxnOutcome> {
        Ok(TxnOutcome::Committed)
    }

    async fn wait_for_states(
        &self,
        key_a: &str,
        key_b: &str,
        accepted: &[&str],
        treat_missing_b_as_success: bool,
        deadline: Duration,
    ) -> Result<WaitOutcome> {
        let start = tokio::time::Instant::now();
        loop {
            let a = self.read(key_a).await?;
            let b = self.read(key_b).await?;

            let a_ok = a.as_deref().is_some_and(|v| accepted.contains(&v));
            let b_ok = match &b {
                Some(v) => accepted.contains(&v.as_str()),
                None => treat_missing_b_as_success,
            };
            if a_ok && b_ok {
                return Ok(WaitOutcome::Satisfied);
            }
            if start.elapsed() >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_states_succeeds_once_both_keys_match() {
        let store = InMemorySharedStore::new();
        store.write("a/state", "initializing").await.unwrap();
        store.write("b/state", "initializing").await.unwrap();

        let store = std::sync::Arc::new(store);
        let waiter = store.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_states(
                    "a/state",
                    "b/state",
                    &["connected"],
                    false,
                    Duration::from_secs(1),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.write("a/state", "connected").await.unwrap();
        store.write("b/state", "connected").await.unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), WaitOutcome::Satisfied);
    }

    #[tokio::test]
    async fn wait_for_states_times_out() {
        let store = InMemorySharedStore::new();
        let outcome = store
            .wait_for_states(
                "a/state",
                "b/state",
                &["connected"],
                false,
                Duration::from_millis(30),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn missing_b_treated_as_success_when_requested() {
        let store = InMemorySharedStore::new();
        store.write("a/state", "closed").await.unwrap();
        let outcome = store
            .wait_for_states(
                "a/state",
                "b/state",
                &["closed"],
                true,
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Satisfied);
    }
}
