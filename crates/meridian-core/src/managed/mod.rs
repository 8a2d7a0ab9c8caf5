//! Concurrently-iterated collection with cooperative deletion.
//!
//! A [`ManagedList`] holds entries that a pool of worker tasks repeatedly
//! walks, doing one unit of work per pass. Workers only ever *mark* entries
//! (for the broker: flipping an admission entry inactive); they never change
//! the structure of the list. Structural removal is the overseer's job and
//! happens only while every worker is quiesced at a barrier:
//!
//! ```text
//!            overseer                         each worker
//!     ┌──────────────────────┐        ┌─────────────────────────┐
//!     │ lock list, lock      │        │ loop:                   │
//!     │ census               │        │   stop?      -> exit    │
//!     │ post await × n ──────┼───────>│   await?     -> post    │
//!     │ wait waiting × n <───┼────────┼── waiting, block on     │
//!     │ remove marked entries│        │   continue              │
//!     │ post continue × n ───┼───────>│   manage() (one pass)   │
//!     │ unlock               │        └─────────────────────────┘
//!     └──────────────────────┘
//! ```
//!
//! While the overseer is inside the critical section it holds the census
//! lock, so no worker can register or deregister; every live worker is
//! parked on the continue signal and holds no per-entry lock. Removing
//! entries is therefore safe even though workers keep `Arc` references to
//! them on their stacks — a removed entry simply dies when the last
//! reference drops.
//!
//! The overseer also rescales the pool each pass: the steward names a
//! desired worker count and the overseer spawns the difference or posts
//! stop signals for the surplus. Any worker may consume any stop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Errors surfaced by the overseer and the pool lifecycle.
///
/// Worker-local failures never cross a worker boundary; they are converted
/// into entry state by the steward. Errors of this type are the overseer's
/// own and propagate to the hosting process.
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    /// No runtime was available to spawn workers or the overseer on.
    #[error("cannot spawn list tasks: {0}")]
    Spawn(#[from] tokio::runtime::TryCurrentError),

    /// The overseer task itself died (panicked or was cancelled).
    #[error("overseer task failed: {0}")]
    Overseer(#[from] tokio::task::JoinError),
}

/// The pluggable behavior of a [`ManagedList`].
///
/// A steward decides what a unit of work is, when compaction pays off, how
/// many workers the list deserves, and which entries compaction removes.
#[async_trait]
pub trait Steward: Send + Sync + 'static {
    /// The entry type stored in the list.
    type Entry: Send + Sync + 'static;

    /// Do one unit of work over the current entries.
    ///
    /// Called in a tight loop by every worker; it must walk the entries at
    /// most once and return. Looping internally would starve the stop and
    /// barrier signals the worker loop checks between calls.
    async fn manage(&self, entries: &[Arc<Self::Entry>]);

    /// May the overseer begin a compaction pass?
    fn should_compact(&self, entries: &[Arc<Self::Entry>]) -> bool;

    /// Worker count the list should be running, given the current entries
    /// and the live count. The list clamps the answer to its maximum.
    fn desired_workers(&self, entries: &[Arc<Self::Entry>], live: usize) -> usize;

    /// Whether compaction should remove `entry`. Implementations normally
    /// return the negation of the entry's active flag.
    fn should_remove(&self, entry: &Self::Entry) -> bool;
}

/// Worker census. Guarded by the census lock; the barrier reads `live`
/// under it, and workers register/deregister under it.
struct Census {
    live: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Shared<S: Steward> {
    steward: S,
    /// Structural lock: inserts and compaction. Workers take it only long
    /// enough to clone a snapshot of the entry pointers.
    entries: Mutex<Vec<Arc<S::Entry>>>,
    census: Mutex<Census>,
    /// True while the overseer is inside the compaction critical section.
    /// Lets a deregistering worker distinguish "census lock held by the
    /// barrier" from ordinary register/deregister contention.
    compacting: AtomicBool,
    await_signal: Semaphore,
    waiting_signal: Semaphore,
    continue_signal: Semaphore,
    stop_signal: Semaphore,
    max_workers: usize,
}

struct OverseerTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<(), ListError>>,
}

/// A concurrent collection managed by an elastic pool of workers and a
/// periodic overseer. See the module docs for the synchronization scheme.
pub struct ManagedList<S: Steward> {
    shared: Arc<Shared<S>>,
    overseer: Mutex<Option<OverseerTask>>,
}

impl<S: Steward> ManagedList<S> {
    /// Create a list driven by `steward`, with at most `max_workers`
    /// concurrent workers.
    pub fn new(steward: S, max_workers: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                steward,
                entries: Mutex::new(Vec::new()),
                census: Mutex::new(Census {
                    live: 0,
                    handles: Vec::new(),
                }),
                compacting: AtomicBool::new(false),
                await_signal: Semaphore::new(0),
                waiting_signal: Semaphore::new(0),
                continue_signal: Semaphore::new(0),
                stop_signal: Semaphore::new(0),
                max_workers,
            }),
            overseer: Mutex::new(None),
        }
    }

    /// The steward driving this list.
    pub fn steward(&self) -> &S {
        &self.shared.steward
    }

    /// Append an entry. Blocks only on the structural lock.
    pub async fn insert(&self, entry: S::Entry) {
        self.shared.entries.lock().await.push(Arc::new(entry));
    }

    /// Clone the current entry pointers.
    pub async fn snapshot(&self) -> Vec<Arc<S::Entry>> {
        self.shared.entries.lock().await.clone()
    }

    /// Number of entries currently in the list.
    pub async fn len(&self) -> usize {
        self.shared.entries.lock().await.len()
    }

    /// Whether the list holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.shared.entries.lock().await.is_empty()
    }

    /// Number of registered workers.
    pub async fn live_workers(&self) -> usize {
        self.shared.census.lock().await.live
    }

    /// Synchronous mode: run one `manage` pass on the caller's task, then
    /// attempt a compaction. Useful without any spawned workers.
    pub async fn spin(&self) {
        let snapshot = self.snapshot().await;
        self.shared.steward.manage(&snapshot).await;
        // Re-snapshot: the pass may have marked entries.
        let snapshot = self.snapshot().await;
        if self.shared.steward.should_compact(&snapshot) {
            compact(&self.shared).await;
        }
    }

    /// One overseer pass: compact when the steward's heuristic says so,
    /// then rescale the worker pool.
    ///
    /// # Errors
    ///
    /// [`ListError::Spawn`] when new workers cannot be spawned.
    pub async fn oversee(&self) -> Result<(), ListError> {
        oversee_pass(&self.shared).await
    }

    /// Spawn the overseer task, invoking [`oversee`](Self::oversee) every
    /// `period` until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// [`ListError::Spawn`] when no runtime is available.
    pub async fn start(&self, period: Duration) -> Result<(), ListError> {
        let mut slot = self.overseer.lock().await;
        if slot.is_some() {
            warn!("overseer already running; start ignored");
            return Ok(());
        }
        let runtime = Handle::try_current()?;
        let (stop, mut stopped) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(period) => {
                        if let Err(err) = oversee_pass(&shared).await {
                            error!(error = %err, "overseer pass failed");
                            return Err(err);
                        }
                    }
                }
            }
            Ok(())
        });
        *slot = Some(OverseerTask { stop, handle });
        Ok(())
    }

    /// Stop the overseer, signal every worker to terminate, await their
    /// exit, and release the list. Dropped entries close whatever
    /// connections they own.
    ///
    /// # Errors
    ///
    /// Propagates an error the overseer task died with.
    pub async fn shutdown(&self) -> Result<(), ListError> {
        if let Some(task) = self.overseer.lock().await.take() {
            let _ = task.stop.send(true);
            task.handle.await??;
        }

        let handles = {
            let mut census = self.shared.census.lock().await;
            self.shared.stop_signal.add_permits(census.live);
            std::mem::take(&mut census.handles)
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "list worker terminated abnormally");
            }
        }

        self.shared.entries.lock().await.clear();
        Ok(())
    }
}

/// One overseer pass over the list: compaction when the heuristic allows
/// it, then pool rescaling against the post-compaction queue depth.
async fn oversee_pass<S: Steward>(shared: &Arc<Shared<S>>) -> Result<(), ListError> {
    let snapshot = shared.entries.lock().await.clone();
    if shared.steward.should_compact(&snapshot) {
        compact(shared).await;
    }
    let snapshot = shared.entries.lock().await.clone();
    rescale(shared, &snapshot).await
}

/// Compaction critical section. Lock order is fixed: structural lock, then
/// census lock; the worker exit path depends on it.
async fn compact<S: Steward>(shared: &Arc<Shared<S>>) {
    let mut entries = shared.entries.lock().await;
    let census = shared.census.lock().await;
    shared.compacting.store(true, Ordering::Release);

    let n = census.live;
    shared.await_signal.add_permits(n);
    for _ in 0..n {
        if !consume(&shared.waiting_signal).await {
            break;
        }
    }

    let before = entries.len();
    entries.retain(|entry| !shared.steward.should_remove(entry));
    let removed = before - entries.len();

    shared.continue_signal.add_permits(n);
    shared.compacting.store(false, Ordering::Release);
    drop(census);
    drop(entries);
    if removed > 0 {
        debug!(removed, remaining = before - removed, "compacted list");
    }
}

/// Resize the worker pool toward the steward's desired count and prune
/// handles of workers that already exited.
async fn rescale<S: Steward>(
    shared: &Arc<Shared<S>>,
    entries: &[Arc<S::Entry>],
) -> Result<(), ListError> {
    let mut census = shared.census.lock().await;
    census.handles.retain(|handle| !handle.is_finished());

    let live = census.live;
    let desired = shared
        .steward
        .desired_workers(entries, live)
        .min(shared.max_workers);

    if desired > live {
        let runtime = Handle::try_current()?;
        for _ in 0..desired - live {
            let worker_shared = Arc::clone(shared);
            census.handles.push(runtime.spawn(worker_loop(worker_shared)));
        }
        debug!(spawned = desired - live, "scaled worker pool up");
    } else if desired < live {
        shared.stop_signal.add_permits(live - desired);
        debug!(stopping = live - desired, "scaled worker pool down");
    }
    Ok(())
}

/// The loop every worker runs: observe stop, participate in barriers, do
/// one `manage` pass, repeat.
async fn worker_loop<S: Steward>(shared: Arc<Shared<S>>) {
    {
        let mut census = shared.census.lock().await;
        census.live += 1;
    }
    debug!("list worker started");

    loop {
        if try_consume(&shared.stop_signal) {
            break;
        }
        if try_consume(&shared.await_signal) {
            shared.waiting_signal.add_permits(1);
            if !consume(&shared.continue_signal).await {
                break;
            }
        }

        // Never block on the structural lock: during a barrier the overseer
        // holds it while waiting for this worker to reach the await check
        // above. Skip the pass and come back around instead.
        let snapshot = match shared.entries.try_lock() {
            Ok(entries) => entries.clone(),
            Err(_) => {
                tokio::task::yield_now().await;
                continue;
            }
        };
        let pass = AssertUnwindSafe(shared.steward.manage(&snapshot)).catch_unwind();
        if let Err(payload) = pass.await {
            error!(
                panic = panic_message(payload.as_ref()),
                "manage() panicked; terminating this worker"
            );
            break;
        }
        tokio::task::yield_now().await;
    }

    deregister(&shared).await;
    debug!("list worker stopped");
}

/// Remove this worker from the census.
///
/// If the census lock is held by a compaction barrier, this worker is still
/// counted in the barrier's target, so it must participate in exactly one
/// await/waiting/continue cycle before deregistering; otherwise the
/// overseer would wait for a waiting signal that never comes.
async fn deregister<S: Steward>(shared: &Arc<Shared<S>>) {
    loop {
        if let Ok(mut census) = shared.census.try_lock() {
            census.live -= 1;
            return;
        }
        // A barrier in progress has posted one await permit per counted
        // worker, this one included. Ordinary register/deregister
        // contention has not; retry until the lock frees up.
        if shared.compacting.load(Ordering::Acquire) && try_consume(&shared.await_signal) {
            shared.waiting_signal.add_permits(1);
            let _ = consume(&shared.continue_signal).await;
            let mut census = shared.census.lock().await;
            census.live -= 1;
            return;
        }
        tokio::task::yield_now().await;
    }
}

/// Consume one permit if immediately available.
fn try_consume(sem: &Semaphore) -> bool {
    match sem.try_acquire() {
        Ok(permit) => {
            permit.forget();
            true
        }
        Err(_) => false,
    }
}

/// Consume one permit, waiting for it. Returns false if the semaphore was
/// closed out from under us.
async fn consume(sem: &Semaphore) -> bool {
    match sem.acquire().await {
        Ok(permit) => {
            permit.forget();
            true
        }
        Err(_) => false,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}
