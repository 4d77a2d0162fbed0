//! Count-limited named resources with blocking reservation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::tree::ExecTree;

/// A named, count-limited resource shared by the jobs of a tree.
///
/// `avail < 0` means unbounded. At capacity, a blocking reservation parks on
/// the wake latch until a holder releases, bounded by a timeout. Releases are
/// visible before parked reservers wake.
#[derive(Debug)]
pub struct ExecResource {
    name: String,
    uuid: Uuid,
    avail: i64,
    used: Mutex<i64>,
    wake: watch::Sender<u64>,
}

impl ExecResource {
    /// Creates a resource and registers it with `tree`.
    pub fn new(tree: &Arc<ExecTree>, name: impl Into<String>, avail: i64) -> Arc<Self> {
        Self::with_uuid(tree, name, avail, Uuid::new_v4())
    }

    pub(crate) fn with_uuid(
        tree: &Arc<ExecTree>,
        name: impl Into<String>,
        avail: i64,
        uuid: Uuid,
    ) -> Arc<Self> {
        let resource = Arc::new(Self {
            name: name.into(),
            uuid,
            avail,
            used: Mutex::new(0),
            wake: watch::channel(0).0,
        });
        tree.register_resource(Arc::clone(&resource));
        resource
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identity used by serialized documents.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Capacity; negative means unbounded.
    pub fn avail(&self) -> i64 {
        self.avail
    }

    /// Number of reservations currently held.
    pub fn used(&self) -> i64 {
        *self.used.lock().unwrap()
    }

    /// Attempts to reserve one unit.
    ///
    /// Returns `true` immediately for unbounded resources. On a blocking
    /// timeout the counters are left untouched and `false` is returned.
    pub async fn reserve(&self, blocking: bool, timeout: Duration) -> bool {
        if self.avail < 0 {
            return true;
        }
        let deadline = Instant::now() + timeout;
        // Subscribing before the first capacity check closes the race with a
        // release landing between the check and the wait.
        let mut wake = self.wake.subscribe();
        loop {
            {
                let mut used = self.used.lock().unwrap();
                if *used < self.avail {
                    *used += 1;
                    return true;
                }
            }
            if !blocking {
                return false;
            }
            match tokio::time::timeout_at(deadline, wake.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return false,
                Err(_) => {
                    tracing::debug!(resource = %self.name, "reservation timed out");
                    return false;
                }
            }
        }
    }

    /// Releases one unit (floored at zero) and wakes parked reservers.
    pub fn release(&self) {
        if self.avail < 0 {
            return;
        }
        {
            let mut used = self.used.lock().unwrap();
            *used = (*used - 1).max(0);
        }
        self.wake.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::tree::ExecTree;

    #[tokio::test]
    async fn unbounded_never_blocks() {
        let tree = ExecTree::new("t");
        let resource = ExecResource::new(&tree, "mem", -1);
        for _ in 0..100 {
            assert!(resource.reserve(true, Duration::from_millis(1)).await);
        }
        assert_eq!(resource.used(), 0);
        resource.release();
        assert_eq!(resource.used(), 0);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let tree = ExecTree::new("t");
        let resource = ExecResource::new(&tree, "db", 2);
        assert!(resource.reserve(false, Duration::ZERO).await);
        assert!(resource.reserve(false, Duration::ZERO).await);
        assert!(!resource.reserve(false, Duration::ZERO).await);
        assert_eq!(resource.used(), 2);
        resource.release();
        assert_eq!(resource.used(), 1);
        assert!(resource.reserve(false, Duration::ZERO).await);
    }

    #[tokio::test]
    async fn blocking_reserve_times_out_without_touching_counters() {
        let tree = ExecTree::new("t");
        let resource = ExecResource::new(&tree, "db", 1);
        assert!(resource.reserve(true, Duration::from_millis(10)).await);
        let started = std::time::Instant::now();
        assert!(!resource.reserve(true, Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(resource.used(), 1);
    }

    #[tokio::test]
    async fn blocking_reserve_wakes_on_release() {
        let tree = ExecTree::new("t");
        let resource = ExecResource::new(&tree, "db", 1);
        assert!(resource.reserve(true, Duration::from_millis(10)).await);

        let releaser = Arc::clone(&resource);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.release();
        });

        assert!(resource.reserve(true, Duration::from_secs(2)).await);
        assert_eq!(resource.used(), 1);
    }

    #[tokio::test]
    async fn release_floors_at_zero() {
        let tree = ExecTree::new("t");
        let resource = ExecResource::new(&tree, "db", 3);
        resource.release();
        assert_eq!(resource.used(), 0);
    }
}
