//! Per-host store of issued leaf credentials.
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::ca::LeafCredential;

/// Eviction policy of a [`HostCertCache`].
///
/// The default keeps every entry for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachePolicy {
  /// Upper bound on cached hosts
  pub max_entries: Option<u64>,
  /// Entries older than this are dropped and re-issued on next use
  pub time_to_live: Option<Duration>,
}

/// Concurrent map from hostname to its leaf credential.
///
/// Lookups never block each other. Two connections missing the same host at
/// once may both issue; whichever stores last is served from then on.
#[derive(Debug, Clone)]
pub struct HostCertCache {
  inner: Cache<String, Arc<LeafCredential>>,
}

impl Default for HostCertCache {
  fn default() -> Self {
    HostCertCache::new(CachePolicy::default())
  }
}

impl HostCertCache {
  /// An empty cache obeying `policy`.
  pub fn new(policy: CachePolicy) -> Self {
    let mut builder = Cache::builder();
    if let Some(max) = policy.max_entries {
      builder = builder.max_capacity(max);
    }
    if let Some(ttl) = policy.time_to_live {
      builder = builder.time_to_live(ttl);
    }
    HostCertCache {
      inner: builder.build(),
    }
  }

  /// Cached credential for `host`.
  pub async fn get(&self, host: &str) -> Option<Arc<LeafCredential>> {
    self.inner.get(host).await
  }

  /// Store `leaf` under `host`, replacing any previous entry.
  pub async fn store(&self, host: &str, leaf: Arc<LeafCredential>) {
    self.inner.insert(host.to_string(), leaf).await;
  }

  /// Number of cached hosts.
  ///
  /// Pending evictions are applied first so the count is exact.
  pub async fn len(&self) -> u64 {
    self.inner.run_pending_tasks().await;
    self.inner.entry_count()
  }

  /// Whether nothing is cached.
  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Drop every entry.
  pub async fn invalidate_all(&self) {
    self.inner.invalidate_all();
    self.inner.run_pending_tasks().await;
  }
}
