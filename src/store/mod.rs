mod error;
mod tables;
mod transaction;

pub use error::StoreError;
pub use tables::Tables;
pub use transaction::Transaction;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};
use tracing::{info, warn};

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

// ── WAL writer channel ───────────────────────────────────

enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Commits hold the tables write lock
/// until their append is durable, so appends arrive one at a time and each
/// gets its own fsync. Compaction goes through the same queue and never
/// interleaves with an append.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let flush_start = std::time::Instant::now();
                let result = wal.append(&commit);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                let _ = response.send(result);
            }
            WalCommand::Compact { snapshot, response } => {
                let result = Wal::write_compact_file(wal.path(), &snapshot)
                    .and_then(|()| wal.swap_compact_file());
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

/// Durable Store: source of truth for printers, users, reservations and the
/// quota setting. State lives in memory and every committed transaction is
/// appended to the WAL before it becomes visible.
pub struct Store {
    tables: RwLock<Tables>,
    wal_tx: mpsc::Sender<WalCommand>,
    #[cfg(test)]
    fail_commits: std::sync::atomic::AtomicU32,
}

impl Store {
    /// Replay the WAL at `path` and start its writer task.
    /// Must be called from inside a tokio runtime.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let replay = Wal::replay(path)?;
        if replay.discarded > 0 {
            warn!(
                offset = replay.valid_len,
                bytes = replay.discarded,
                "dropping torn WAL tail at {}",
                path.display()
            );
        }
        let commits = replay.commits;
        let wal = Wal::open(path, replay.valid_len)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut tables = Tables::default();
        let mut scratch = Vec::new();
        for commit in &commits {
            for mutation in &commit.mutations {
                tables.apply(mutation, &mut scratch);
            }
            scratch.clear();
        }
        info!(
            commits = commits.len(),
            resources = tables.resources.len(),
            users = tables.users.len(),
            reservations = tables.reservations.len(),
            "store replayed {}",
            path.display()
        );

        Ok(Self {
            tables: RwLock::new(tables),
            wal_tx,
            #[cfg(test)]
            fail_commits: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Hand a commit to the writer task and wait until it is on disk.
    async fn wal_append(&self, commit: Commit) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| StoreError::WriterShutDown)?;
        rx.await.map_err(|_| StoreError::WriterShutDown)??;
        Ok(())
    }

    /// Begin a write transaction. Waits for any other writer to finish.
    pub async fn begin(&self) -> Transaction<'_> {
        Transaction {
            tables: self.tables.write().await,
            store: self,
            staged: Vec::new(),
            undo: Vec::new(),
            committed: false,
        }
    }

    /// Shared read access to committed state.
    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    pub async fn resource(&self, id: ResourceId) -> Option<Resource> {
        self.read().await.resource(id).cloned()
    }

    pub async fn user(&self, id: UserId) -> Option<User> {
        self.read().await.user(id).cloned()
    }

    pub async fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.read().await.reservation(id).cloned()
    }

    pub async fn active_reservations(&self) -> Vec<Reservation> {
        self.read().await.active_reservations().cloned().collect()
    }

    pub async fn active_count_for_user(&self, user_id: UserId) -> usize {
        self.read().await.active_count_for_user(user_id)
    }

    pub async fn read_quota_limit(&self) -> Option<u32> {
        self.read().await.quota_limit
    }

    pub async fn write_quota_limit(&self, limit: u32) -> Result<(), StoreError> {
        let mut tx = self.begin().await;
        tx.set_quota_limit(limit);
        tx.commit().await
    }

    /// Add a printer to the directory. Ids map 1:1 onto relay channels.
    pub async fn insert_resource(&self, resource: Resource) -> Result<(), StoreError> {
        if !(MIN_RESOURCE_ID..=MAX_RESOURCE_ID).contains(&resource.id) {
            return Err(StoreError::InvalidRow {
                table: "resource",
                reason: "id outside actuation channel range",
            });
        }
        if resource.name.len() > MAX_NAME_LEN || resource.group.len() > MAX_GROUP_LEN {
            return Err(StoreError::InvalidRow {
                table: "resource",
                reason: "name too long",
            });
        }
        let mut tx = self.begin().await;
        if tx.resource(resource.id).is_some() {
            return Err(StoreError::Duplicate {
                table: "resource",
                id: u64::from(resource.id),
            });
        }
        if tx.tables.resources.len() >= MAX_RESOURCES {
            return Err(StoreError::InvalidRow {
                table: "resource",
                reason: "all actuation channels in use",
            });
        }
        tx.put_resource(resource);
        tx.commit().await
    }

    pub async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        if user.display_name.len() > MAX_NAME_LEN || user.scope.len() > MAX_GROUP_LEN {
            return Err(StoreError::InvalidRow {
                table: "user",
                reason: "name too long",
            });
        }
        let mut tx = self.begin().await;
        if tx.user(user.id).is_some() {
            return Err(StoreError::Duplicate {
                table: "user",
                id: u64::from(user.id),
            });
        }
        tx.put_user(user);
        tx.commit().await
    }

    /// Rewrite the WAL as a single snapshot of the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        // The read guard keeps writers out until the swap is done, and any
        // appends already queued reach the old file before the swap.
        let tables = self.read().await;
        let snapshot = tables.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| StoreError::WriterShutDown)?;
        rx.await.map_err(|_| StoreError::WriterShutDown)??;
        drop(tables);
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("printbay_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn printer(id: ResourceId) -> Resource {
        Resource {
            id,
            name: format!("P{id}"),
            group: "main".into(),
            busy: false,
            last_holder: None,
            privileged: false,
        }
    }

    fn user(id: UserId) -> User {
        User {
            id,
            display_name: format!("user{id}"),
            trained: true,
            admin: false,
            privileged_access: false,
            scope: "main".into(),
            ban_until: None,
            weekly_quota_minutes: 120,
        }
    }

    #[tokio::test]
    async fn committed_transaction_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let rid = {
            let store = Store::open(&path).unwrap();
            store.insert_resource(printer(1)).await.unwrap();
            store.insert_user(user(7)).await.unwrap();

            let mut tx = store.begin().await;
            let mut p = tx.resource(1).cloned().unwrap();
            p.busy = true;
            tx.put_resource(p);
            let rid = tx.insert_reservation(1, 7, 0, 60_000, "main".into());
            tx.commit().await.unwrap();
            rid
        };

        let store = Store::open(&path).unwrap();
        assert!(store.resource(1).await.unwrap().busy);
        let r = store.reservation(rid).await.unwrap();
        assert!(r.active);
        assert_eq!(r.user_id, 7);
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let path = test_wal_path("dropped.wal");
        let store = Store::open(&path).unwrap();
        store.insert_resource(printer(1)).await.unwrap();

        {
            let mut tx = store.begin().await;
            let mut p = tx.resource(1).cloned().unwrap();
            p.busy = true;
            tx.put_resource(p);
            tx.insert_reservation(1, 7, 0, 60_000, "main".into());
        }

        assert!(!store.resource(1).await.unwrap().busy);
        assert!(store.read().await.reservations.is_empty());
        assert_eq!(store.read().await.next_reservation_id, 1);
    }

    #[tokio::test]
    async fn failed_commit_rolls_back() {
        let path = test_wal_path("failed_commit.wal");
        let store = Store::open(&path).unwrap();
        store.insert_user(user(7)).await.unwrap();

        store.fail_next_commits(1);
        let mut tx = store.begin().await;
        let mut u = tx.user(7).cloned().unwrap();
        u.weekly_quota_minutes = 0;
        tx.put_user(u);
        assert!(matches!(tx.commit().await, Err(StoreError::Injected)));

        assert_eq!(store.user(7).await.unwrap().weekly_quota_minutes, 120);
        drop(store);
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.user(7).await.unwrap().weekly_quota_minutes, 120);
    }

    #[tokio::test]
    async fn insert_resource_validates_channel_range() {
        let path = test_wal_path("channel_range.wal");
        let store = Store::open(&path).unwrap();
        assert!(matches!(
            store.insert_resource(printer(0)).await,
            Err(StoreError::InvalidRow { .. })
        ));
        assert!(matches!(
            store.insert_resource(printer(29)).await,
            Err(StoreError::InvalidRow { .. })
        ));
        store.insert_resource(printer(28)).await.unwrap();
        assert!(matches!(
            store.insert_resource(printer(28)).await,
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn quota_limit_round_trips_through_wal() {
        let path = test_wal_path("quota_limit.wal");
        {
            let store = Store::open(&path).unwrap();
            assert_eq!(store.read_quota_limit().await, None);
            store.write_quota_limit(3).await.unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.read_quota_limit().await, Some(3));
    }

    #[tokio::test]
    async fn torn_tail_is_cut_before_new_commits() {
        use std::io::Write;

        let path = test_wal_path("torn_tail.wal");
        {
            let store = Store::open(&path).unwrap();
            store.insert_resource(printer(1)).await.unwrap();
        }
        // Crash mid-frame: a length prefix with no payload behind it.
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&64u32.to_le_bytes()).unwrap();
        }
        {
            let store = Store::open(&path).unwrap();
            assert!(store.resource(1).await.is_some());
            store.insert_user(user(7)).await.unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert!(store.resource(1).await.is_some());
        assert_eq!(store.user(7).await.unwrap().weekly_quota_minutes, 120);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_each_reach_disk() {
        let path = test_wal_path("concurrent_commits.wal");
        {
            let store = Arc::new(Store::open(&path).unwrap());
            let inserts = (1..=12).map(|id| {
                let store = store.clone();
                tokio::spawn(async move { store.insert_user(user(id)).await })
            });
            for result in futures::future::join_all(inserts).await {
                result.unwrap().unwrap();
            }
            assert_eq!(store.appends_since_compact().await, 12);
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.read().await.users.len(), 12);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction.wal");
        {
            let store = Store::open(&path).unwrap();
            store.insert_resource(printer(1)).await.unwrap();
            for i in 0..20 {
                let mut tx = store.begin().await;
                let id = tx.insert_reservation(1, 7, i, i + 1, "main".into());
                let mut r = tx.reservation(id).cloned().unwrap();
                r.active = false;
                tx.put_reservation(r);
                tx.commit().await.unwrap();
            }
            assert_eq!(store.appends_since_compact().await, 21);
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }
        let store = Store::open(&path).unwrap();
        let tables = store.read().await;
        assert_eq!(tables.reservations.len(), 20);
        assert_eq!(tables.next_reservation_id, 21);
        assert_eq!(tables.active_reservations().count(), 0);
    }
}
