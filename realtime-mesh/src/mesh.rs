use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

use hashbrown::HashMap;

use crate::commit::commit;
use crate::config::ContentionPolicy;
use crate::listen::{DynListener, IntoListener, Listen as _, Notifier};
use crate::{MeshConfig, Section, SectionConfig, SectionId, Snapshot, SubmitError, UpdateBatch};

/// Message delivered to listeners of a [`RealtimeMesh`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum MeshEvent {
    /// A new version of a section was committed.
    ///
    /// For any one section, these are delivered in strictly increasing version order.
    Published(Arc<Snapshot>),
    /// The section was removed. No further events concern it.
    Removed(SectionId),
}

impl MeshEvent {
    /// Returns the section this event concerns.
    pub fn section(&self) -> SectionId {
        match self {
            MeshEvent::Published(snapshot) => snapshot.section(),
            MeshEvent::Removed(id) => *id,
        }
    }
}

/// Read-only access to published mesh section data, for consumers which do not need to know
/// how the data is produced.
pub trait MeshDataProvider: Send + Sync {
    /// Returns the identifiers of all existing sections, in increasing order.
    fn section_ids(&self) -> Vec<SectionId>;

    /// Returns the latest published snapshot of the section, or [`None`] if it does not exist.
    fn snapshot(&self, section: SectionId) -> Option<Arc<Snapshot>>;

    /// Registers a listener for [`MeshEvent`]s.
    fn listen_events(&self, listener: DynListener<MeshEvent>);
}

/// Owner of a set of [`Section`]s, and the point through which they are modified.
///
/// All methods take `&self` and may be called from any thread. Submissions to distinct
/// sections proceed in parallel; submissions to the same section are serialized according
/// to [`MeshConfig::contention`]. Nothing here ever waits for a consumer.
pub struct RealtimeMesh {
    config: MeshConfig,
    sections: RwLock<HashMap<SectionId, Arc<SectionCell>>>,
    notifier: Notifier<MeshEvent>,
    next_id: AtomicU32,
}

struct SectionCell {
    /// Producer-side state. Held for the whole of a commit, including notification, so that
    /// listeners observe each section's versions in order.
    staged: Mutex<Section>,
    published: RwLock<Arc<Snapshot>>,
    /// Set, while `staged` is locked, when the section has been removed.
    removed: AtomicBool,
}

impl RealtimeMesh {
    /// Creates a mesh with no sections.
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            sections: RwLock::new(HashMap::new()),
            notifier: Notifier::new(),
            next_id: AtomicU32::new(0),
        }
    }

    /// Returns the configuration this mesh was created with.
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Creates an empty section at [`Version::INITIAL`](crate::Version::INITIAL).
    ///
    /// No event is delivered until the first commit.
    pub fn create_section(&self, config: SectionConfig) -> SectionId {
        let id = SectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cell = Arc::new(SectionCell {
            published: RwLock::new(Arc::new(Snapshot::initial(id, config.clone()))),
            staged: Mutex::new(Section::new(id, config)),
            removed: AtomicBool::new(false),
        });
        self.sections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cell);
        log::trace!("created section {id}");
        id
    }

    /// Removes a section, waiting for any commit in progress on it to finish, and notifies
    /// listeners with [`MeshEvent::Removed`].
    ///
    /// Returns false if there was no such section.
    pub fn remove_section(&self, id: SectionId) -> bool {
        let Some(cell) = self
            .sections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        else {
            return false;
        };
        let _staged = lock(&cell.staged);
        cell.removed.store(true, Ordering::Release);
        self.notifier.notify(&MeshEvent::Removed(id));
        log::trace!("removed section {id}");
        true
    }

    /// Validates and applies `batch`, then publishes and returns the new snapshot.
    ///
    /// The snapshot is delivered to listeners before this returns. On error, the section is
    /// unchanged and nothing is delivered.
    pub fn submit(&self, batch: UpdateBatch) -> Result<Arc<Snapshot>, SubmitError> {
        let id = batch.section;
        let cell = self.cell(id).ok_or(SubmitError::UnknownSection(id))?;

        let mut staged = match self.config.contention {
            ContentionPolicy::Block => lock(&cell.staged),
            ContentionPolicy::Fail => match cell.staged.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return Err(SubmitError::Busy(id)),
            },
        };
        if cell.removed.load(Ordering::Acquire) {
            return Err(SubmitError::UnknownSection(id));
        }

        let snapshot = commit(&mut staged, &batch, &self.config)?;
        *cell
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        self.notifier
            .notify(&MeshEvent::Published(Arc::clone(&snapshot)));
        drop(staged);
        Ok(snapshot)
    }

    /// Submits several batches, returning their results in the same order.
    ///
    /// If the `auto-threads` feature is enabled, batches are committed in parallel on the
    /// `rayon` thread pool. Batches for the same section are still serialized, but their
    /// relative order is then unspecified.
    pub fn submit_many(
        &self,
        batches: Vec<UpdateBatch>,
    ) -> Vec<Result<Arc<Snapshot>, SubmitError>> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "auto-threads")] {
                use rayon::iter::{IntoParallelIterator as _, ParallelIterator as _};
                batches.into_par_iter().map(|batch| self.submit(batch)).collect()
            } else {
                batches.into_iter().map(|batch| self.submit(batch)).collect()
            }
        }
    }

    /// Returns the latest published snapshot of the section.
    ///
    /// This never waits for a commit in progress; it returns the previous version instead.
    pub fn snapshot(&self, id: SectionId) -> Option<Arc<Snapshot>> {
        let cell = self.cell(id)?;
        let published = cell
            .published
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Some(Arc::clone(&published))
    }

    /// Calls `f` with the staged state of the section, waiting for any commit in progress.
    pub fn with_section<R>(&self, id: SectionId, f: impl FnOnce(&Section) -> R) -> Option<R> {
        let cell = self.cell(id)?;
        let staged = lock(&cell.staged);
        Some(f(&staged))
    }

    /// Returns the identifiers of all existing sections, in increasing order.
    pub fn section_ids(&self) -> Vec<SectionId> {
        let mut ids: Vec<SectionId> = self
            .sections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Registers a listener for [`MeshEvent`]s.
    ///
    /// Listeners are called on the submitting thread while the section is locked, so they
    /// must not submit to the same section, and should do no more than forward the event.
    pub fn listen(&self, listener: impl IntoListener<DynListener<MeshEvent>, MeshEvent>) {
        self.notifier.listen(listener);
    }

    fn cell(&self, id: SectionId) -> Option<Arc<SectionCell>> {
        self.sections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl MeshDataProvider for RealtimeMesh {
    fn section_ids(&self) -> Vec<SectionId> {
        RealtimeMesh::section_ids(self)
    }
    fn snapshot(&self, section: SectionId) -> Option<Arc<Snapshot>> {
        RealtimeMesh::snapshot(self, section)
    }
    fn listen_events(&self, listener: DynListener<MeshEvent>) {
        self.notifier.listen_raw(listener);
    }
}

impl std::fmt::Debug for RealtimeMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeMesh")
            .field("config", &self.config)
            .field("sections", &self.section_ids())
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

/// Lock ignoring poisoning: every critical section in this crate leaves its data consistent
/// before doing anything that could panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
