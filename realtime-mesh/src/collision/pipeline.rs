use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use hashbrown::HashMap;

use super::{CollisionRepresentation, CookFailed, InstallError, PhysicsWorld, cook};
use crate::config::CollisionConfig;
use crate::listen::Listener;
use crate::mesh::{MeshDataProvider, MeshEvent};
use crate::{SectionId, Snapshot, Version};

/// Where a section is in its collision lifecycle, as reported by
/// [`CollisionCookPipeline::phase()`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CookPhase {
    /// Nothing is being cooked and nothing is installed.
    Idle,
    /// At least one cook is queued, running, or finished but not yet processed by
    /// [`CollisionCookPipeline::poll()`].
    Cooking,
    /// The installed representation was cooked from the latest committed version.
    Installed,
    /// A representation is installed, but it was cooked from an older version than the latest
    /// committed one, and nothing is cooking.
    Stale,
}

/// A failure reported by [`CollisionCookPipeline::poll()`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CollisionError {
    /// See [`CookFailed`].
    #[error("cooking failed")]
    Cook(#[from] CookFailed),
    /// See [`InstallError`].
    #[error("install failed")]
    Install(#[from] InstallError),
}

/// What [`CollisionCookPipeline::poll()`] did.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct CookReport {
    /// Representations installed into the physics world.
    pub installed: Vec<(SectionId, Version)>,
    /// Cook results discarded because a newer version was committed meanwhile.
    pub discarded: Vec<(SectionId, Version)>,
    /// Failures. A retry has been scheduled unless the retry limit was reached.
    pub failures: Vec<(SectionId, Version, CollisionError)>,
    /// Sections whose collision was removed from the physics world.
    pub removed: Vec<SectionId>,
}

/// Cooks collision representations from published snapshots, off the mutation path, and
/// installs them into a [`PhysicsWorld`].
///
/// The pipeline learns of snapshots through its [`requester()`](Self::requester), which
/// should be registered with the mesh. Cooking jobs are run by a [`CookWorkerPool`] or by
/// [`run_pending_cooks()`](Self::run_pending_cooks), and finished results are installed
/// by [`poll()`](Self::poll), which is the only place the physics world is used.
pub struct CollisionCookPipeline<W> {
    world: W,
    shared: Arc<Shared>,
    queue: CookJobQueue,
    results: flume::Receiver<CookResult>,
}

/// State shared with the [`CookRequester`]s.
struct Shared {
    config: CollisionConfig,
    jobs: flume::Sender<CookJob>,
    states: Mutex<HashMap<SectionId, SectionState>>,
}

#[derive(Debug, Default)]
struct SectionState {
    /// Latest committed version known.
    latest: Version,
    latest_snapshot: Option<Arc<Snapshot>>,
    /// Newest version queued or being cooked, if any cooks are in flight.
    cooking: Option<Version>,
    /// Number of cooks queued, running, or finished but not yet polled.
    in_flight: usize,
    installed: Option<Version>,
    /// Failures so far of cooking or installing `latest`.
    retries: u32,
    /// Collision was disabled or the section removed, and the physics world has not yet been
    /// told.
    removal_pending: bool,
    removed: bool,
}

struct CookJob {
    snapshot: Arc<Snapshot>,
}

struct CookResult {
    section: SectionId,
    version: Version,
    result: Result<CollisionRepresentation, CookFailed>,
}

/// Access to the pipeline's queue of cooking jobs, which may be used from any thread.
///
/// Obtain this from [`CollisionCookPipeline::job_queue()`].
#[derive(Clone)]
pub struct CookJobQueue {
    jobs: flume::Receiver<CookJob>,
    results: flume::Sender<CookResult>,
    config: CollisionConfig,
}

/// [`Listener`] which requests cooks for published snapshots.
///
/// Obtain this from [`CollisionCookPipeline::requester()`]. It stops listening when the
/// pipeline is dropped.
#[derive(Clone)]
pub struct CookRequester {
    shared: Weak<Shared>,
}

impl<W: PhysicsWorld> CollisionCookPipeline<W> {
    /// Creates a pipeline which installs collision into `world`.
    pub fn new(world: W, config: CollisionConfig) -> Self {
        let (job_sender, job_receiver) = flume::unbounded();
        let (result_sender, result_receiver) = flume::unbounded();
        Self {
            world,
            queue: CookJobQueue {
                jobs: job_receiver,
                results: result_sender,
                config: config.clone(),
            },
            shared: Arc::new(Shared {
                config,
                jobs: job_sender,
                states: Mutex::new(HashMap::new()),
            }),
            results: result_receiver,
        }
    }

    /// Returns a listener to register with the mesh, through which the pipeline learns of new
    /// snapshots and removed sections.
    pub fn requester(&self) -> CookRequester {
        CookRequester {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Starts following every section of `provider`, including its current snapshots.
    pub fn attach(&self, provider: &dyn MeshDataProvider) {
        let requester = self.requester();
        provider.listen_events(Arc::new(requester.clone()));
        for id in provider.section_ids() {
            if let Some(snapshot) = provider.snapshot(id)
                && snapshot.version() > Version::INITIAL
            {
                requester.receive(&[MeshEvent::Published(snapshot)]);
            }
        }
    }

    /// Returns the job queue, for running cooks on other threads.
    pub fn job_queue(&self) -> &CookJobQueue {
        &self.queue
    }

    /// Requests a cook of `snapshot` directly, as if it had been published to the requester.
    ///
    /// Does nothing if a cook of the same or a newer version is already in flight or installed.
    pub fn request_cook(&self, snapshot: Arc<Snapshot>) {
        self.shared.request_cook(snapshot);
    }

    /// Runs all queued cooks on the calling thread. Returns how many were run.
    pub fn run_pending_cooks(&self) -> usize {
        let mut count = 0;
        while self.queue.try_run_one() {
            count += 1;
        }
        count
    }

    /// Runs at most one queued cook on the calling thread. Returns whether one was run.
    pub fn run_one_cook(&self) -> bool {
        self.queue.try_run_one()
    }

    /// Returns the physics world.
    pub fn world(&self) -> &W {
        &self.world
    }

    /// Returns the physics world, mutably.
    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    /// Returns where the section is in its collision lifecycle.
    pub fn phase(&self, section: SectionId) -> CookPhase {
        let states = self.shared.lock_states();
        let Some(state) = states.get(&section) else {
            return CookPhase::Idle;
        };
        if state.in_flight > 0 {
            CookPhase::Cooking
        } else {
            match state.installed {
                Some(v) if v == state.latest => CookPhase::Installed,
                Some(_) => CookPhase::Stale,
                None => CookPhase::Idle,
            }
        }
    }

    /// Returns the version of the installed representation of the section, if any.
    pub fn installed_version(&self, section: SectionId) -> Option<Version> {
        self.shared.lock_states().get(&section)?.installed
    }

    /// Processes finished cooks and pending removals, installing and removing collision in the
    /// physics world as needed.
    ///
    /// A result cooked from a version older than the latest committed one is discarded and a
    /// fresh cook requested. Failed cooks and installs leave the previous representation in
    /// place and are retried, up to [`CollisionConfig::max_retries`] times per version.
    pub fn poll(&mut self) -> CookReport {
        let mut report = CookReport::default();

        // Removals first, so that results for removed sections are seen as such.
        let removals: Vec<SectionId> = {
            let mut states = self.shared.lock_states();
            let ids = states
                .iter_mut()
                .filter(|(_, state)| state.removal_pending)
                .map(|(&id, state)| {
                    state.removal_pending = false;
                    state.installed = None;
                    id
                })
                .collect();
            states.retain(|_, state| !(state.removed && state.in_flight == 0));
            ids
        };
        for id in removals {
            self.world.remove_collision(id);
            report.removed.push(id);
        }

        for CookResult {
            section,
            version,
            result,
        } in self.results.drain().collect::<Vec<_>>()
        {
            let decision = self.shared.finish_cook(section, version);
            match decision {
                Finish::Drop => {}
                Finish::Stale => {
                    log::debug!("{section}: discarding collision cooked from stale {version}");
                    report.discarded.push((section, version));
                    self.shared.request_latest(section);
                }
                Finish::Current => {
                    let outcome = result
                        .map_err(CollisionError::from)
                        .and_then(|representation| {
                            self.world
                                .install_collision(section, representation)
                                .map_err(CollisionError::from)
                        });
                    match outcome {
                        Ok(()) => {
                            self.shared.installed(section, version);
                            report.installed.push((section, version));
                        }
                        Err(error) => {
                            log::warn!("{section}: collision for {version} not installed: {error}");
                            self.shared.retry(section, version);
                            report.failures.push((section, version, error));
                        }
                    }
                }
            }
        }
        report
    }
}

impl<W: fmt::Debug> fmt::Debug for CollisionCookPipeline<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollisionCookPipeline")
            .field("world", &self.world)
            .field("config", &self.shared.config)
            .field("queued", &self.shared.jobs.len())
            .finish_non_exhaustive()
    }
}

/// What to do with a finished cook.
enum Finish {
    /// The section is gone or no longer wants collision.
    Drop,
    /// A newer version has been committed.
    Stale,
    Current,
}

impl Shared {
    fn lock_states(&self) -> MutexGuard<'_, HashMap<SectionId, SectionState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_cook(&self, snapshot: Arc<Snapshot>) {
        let mut states = self.lock_states();
        let state = states.entry(snapshot.section()).or_default();
        if state.removed || snapshot.version() < state.latest {
            return;
        }
        if snapshot.version() > state.latest {
            state.latest = snapshot.version();
            state.retries = 0;
        }
        if !snapshot.collision_enabled() {
            state.latest_snapshot = None;
            if state.installed.is_some() {
                state.removal_pending = true;
            }
            return;
        }
        state.latest_snapshot = Some(Arc::clone(&snapshot));
        state.removal_pending = false;
        self.enqueue(state, snapshot);
    }

    /// Queues a cook of `snapshot` unless one of the same or a newer version is in flight or
    /// installed.
    fn enqueue(&self, state: &mut SectionState, snapshot: Arc<Snapshot>) {
        let version = snapshot.version();
        if state.cooking.is_some_and(|v| v >= version) || state.installed.is_some_and(|v| v >= version)
        {
            return;
        }
        state.cooking = Some(version);
        state.in_flight += 1;
        // The receiver lives as long as `self`, in the pipeline's job queue.
        let _ = self.jobs.send(CookJob { snapshot });
    }

    fn request_latest(&self, section: SectionId) {
        let mut states = self.lock_states();
        if let Some(state) = states.get_mut(&section)
            && let Some(snapshot) = state.latest_snapshot.clone()
        {
            self.enqueue(state, snapshot);
        }
    }

    fn remove(&self, section: SectionId) {
        let mut states = self.lock_states();
        let state = states.entry(section).or_default();
        state.removed = true;
        state.latest_snapshot = None;
        state.removal_pending = state.installed.is_some();
    }

    fn finish_cook(&self, section: SectionId, version: Version) -> Finish {
        let mut states = self.lock_states();
        let Some(state) = states.get_mut(&section) else {
            return Finish::Drop;
        };
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            state.cooking = None;
        }
        if state.removed || state.latest_snapshot.is_none() {
            Finish::Drop
        } else if version < state.latest {
            Finish::Stale
        } else {
            Finish::Current
        }
    }

    fn installed(&self, section: SectionId, version: Version) {
        if let Some(state) = self.lock_states().get_mut(&section) {
            state.installed = Some(version);
            state.retries = 0;
        }
    }

    fn retry(&self, section: SectionId, version: Version) {
        let mut states = self.lock_states();
        let Some(state) = states.get_mut(&section) else {
            return;
        };
        if version != state.latest {
            // A newer version is already on its way.
            return;
        }
        if state.retries >= self.config.max_retries {
            log::warn!("{section}: giving up on collision for {version} after {} retries", state.retries);
            return;
        }
        state.retries += 1;
        if let Some(snapshot) = state.latest_snapshot.clone() {
            self.enqueue(state, snapshot);
        }
    }
}

impl CookJobQueue {
    /// Waits for a job and runs it. Returns false if the pipeline has been dropped and there
    /// will never be more jobs.
    pub fn run_next_blocking(&self) -> bool {
        match self.jobs.recv() {
            Ok(job) => {
                self.run(job);
                true
            }
            Err(flume::RecvError::Disconnected) => false,
        }
    }

    fn try_run_one(&self) -> bool {
        match self.jobs.try_recv() {
            Ok(job) => {
                self.run(job);
                true
            }
            Err(flume::TryRecvError::Empty | flume::TryRecvError::Disconnected) => false,
        }
    }

    fn run(&self, CookJob { snapshot }: CookJob) {
        let result = cook(&snapshot, &self.config);
        if let Err(error) = &result {
            log::trace!(
                "{}: cooking {} failed: {error}",
                snapshot.section(),
                snapshot.version()
            );
        }
        // If the pipeline is gone, nobody wants the result.
        let _ = self.results.send(CookResult {
            section: snapshot.section(),
            version: snapshot.version(),
            result,
        });
    }

    /// Returns the number of jobs waiting to be run.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns whether no jobs are waiting to be run.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl fmt::Debug for CookJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookJobQueue")
            .field("queued", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl Listener<MeshEvent> for CookRequester {
    fn receive(&self, messages: &[MeshEvent]) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        for message in messages {
            match message {
                MeshEvent::Published(snapshot) => shared.request_cook(Arc::clone(snapshot)),
                MeshEvent::Removed(section) => shared.remove(*section),
            }
        }
        true
    }
}

impl fmt::Debug for CookRequester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookRequester")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

/// Threads which run cooking jobs from a [`CookJobQueue`].
///
/// The threads exit once the [`CollisionCookPipeline`] is dropped and the queue is empty.
#[derive(Debug)]
pub struct CookWorkerPool {
    threads: Vec<thread::JoinHandle<()>>,
}

impl CookWorkerPool {
    /// Spawns `count` worker threads.
    pub fn new(queue: &CookJobQueue, count: usize) -> std::io::Result<Self> {
        let threads = (0..count)
            .map(|i| {
                let queue = queue.clone();
                thread::Builder::new()
                    .name(format!("collision cook {i}"))
                    .spawn(move || while queue.run_next_blocking() {})
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self { threads })
    }

    /// Number of threads.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Returns whether there are no threads.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Waits for all threads to exit, which they do once the pipeline has been dropped.
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                log::error!("collision cook thread panicked");
            }
        }
    }
}
