// Memoized Build Cache
// Single-flight cache keyed on a projection of matrix entry fields

use crate::error::ServiceResult;
use crate::matrix::MatrixEntry;

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

/// Key identifying one cached computation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MemoKey(String);

impl MemoKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The subset of entry fields a computation depends on.
///
/// Entries that agree on every projected field share one computation. The
/// caller guarantees that fields outside the projection do not change the
/// computed value; nothing here can check that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProjection {
    names: BTreeSet<String>,
}

impl KeyProjection {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Render the key for `entry` as `name=canonical;...` in name order
    pub fn key(&self, entry: &MatrixEntry) -> ServiceResult<MemoKey> {
        let parts = self
            .names
            .iter()
            .map(|name| {
                entry
                    .require(name)
                    .map(|value| format!("{}={}", name, value.canonical()))
            })
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok(MemoKey(parts.join(";")))
    }
}

/// Failure of a cached computation, shared by every entry on its key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ComputeError {
    message: String,
}

impl ComputeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Outcome of a cached computation
pub type MemoOutcome<T> = Result<T, ComputeError>;

type Cell<T> = Arc<OnceCell<MemoOutcome<T>>>;

/// Concurrent single-flight cache.
///
/// The first caller for a key inserts an empty cell and becomes its producer;
/// later callers find the cell and wait on it. Lookup and insert happen under
/// one short lock, so deciding to reuse never waits for the value itself.
/// Values and failures are both cached for the lifetime of the cache.
///
/// Computations run as their own tasks, so a panic is cached as a
/// `ComputeError` like any other failure. Cancelling the producer while it
/// waits leaves the cell empty, and the next caller computes again.
pub struct MemoCache<T> {
    cells: Mutex<HashMap<MemoKey, Cell<T>>>,
    computations: AtomicUsize,
}

impl<T> Default for MemoCache<T> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            computations: AtomicUsize::new(0),
        }
    }
}

impl<T: Clone + Send + Sync> MemoCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for the entry's projected key, computing it if no other caller
    /// has. Fails only when the entry lacks a projected field.
    pub async fn get_or_compute<F, Fut>(
        &self,
        entry: &MatrixEntry,
        projection: &KeyProjection,
        compute: F,
    ) -> ServiceResult<MemoOutcome<T>>
    where
        T: 'static,
        F: FnOnce(MemoKey) -> Fut,
        Fut: Future<Output = MemoOutcome<T>> + Send + 'static,
    {
        let key = projection.key(entry)?;
        Ok(self.get_or_compute_key(key, compute).await)
    }

    pub async fn get_or_compute_key<F, Fut>(&self, key: MemoKey, compute: F) -> MemoOutcome<T>
    where
        T: 'static,
        F: FnOnce(MemoKey) -> Fut,
        Fut: Future<Output = MemoOutcome<T>> + Send + 'static,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(key.clone()).or_default().clone()
        };

        cell.get_or_init(|| async move {
            self.computations.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(key = %key, "computing memo entry");
            match tokio::spawn(compute(key.clone())).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "memo computation died");
                    Err(ComputeError::new(format!("computation for {} died: {}", key, err)))
                }
            }
        })
        .await
        .clone()
    }

    /// Number of computations that actually ran
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    /// Number of distinct keys seen so far
    pub async fn len(&self) -> usize {
        self.cells.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
