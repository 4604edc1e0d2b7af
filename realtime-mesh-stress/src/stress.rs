//! Producers, a render loop, and collision cooking, all running at once against in-memory
//! stand-ins for the graphics API and physics engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use rand::{Rng as _, SeedableRng as _};

use realtime_mesh::collision::{CollisionCookPipeline, CookPhase, CookWorkerPool};
use realtime_mesh::lod::{LodSelector, ViewParams};
use realtime_mesh::render::RenderProxySynchronizer;
use realtime_mesh::testing::{RecordingPhysicsWorld, RecordingUploadBuffer};
use realtime_mesh::{
    BoundingSphere, MeshConfig, MeshVector, Position, RealtimeMesh, SectionConfig, SectionId,
    StreamData, StreamKind, StreamSet, UpdateBatch, shapes,
};

/// Side length of each section's square of terrain.
const SECTION_SIZE: f32 = 8.0;
/// LOD 0 is drawn while a section covers at least this fraction of the view height.
const FINE_SCREEN_SIZE: f32 = 0.3;
const COARSE_SCREEN_SIZE: f32 = 0.05;
/// How long the consumers get to catch up after the producers stop, and to release
/// everything after the sections are removed.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// What to run.
#[derive(Clone, Debug)]
pub(crate) struct StressParams {
    pub(crate) config: MeshConfig,
    pub(crate) sections: u32,
    /// Cells along each side of a section's most detailed LOD.
    pub(crate) grid: u32,
    pub(crate) producers: usize,
    pub(crate) duration: Duration,
    pub(crate) frame_period: Duration,
    pub(crate) seed: u64,
}

/// Counts of what happened during a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Stats {
    pub(crate) commits: u64,
    pub(crate) busy: u64,
    pub(crate) rejected: u64,
    pub(crate) frames: u64,
    pub(crate) swaps: u64,
    pub(crate) superseded: u64,
    pub(crate) bytes_uploaded: u64,
    pub(crate) upload_failures: u64,
    pub(crate) lod_changes: u64,
    pub(crate) drawn: u64,
    pub(crate) cooks_installed: u64,
    pub(crate) cooks_discarded: u64,
    pub(crate) cook_failures: u64,
    /// Sections whose collision was left older than their final version because cooking
    /// it kept failing.
    pub(crate) collision_abandoned: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            commits,
            busy,
            rejected,
            frames,
            swaps,
            superseded,
            bytes_uploaded,
            upload_failures,
            lod_changes,
            drawn,
            cooks_installed,
            cooks_discarded,
            cook_failures,
            collision_abandoned,
        } = self;
        writeln!(f, "commits:    {commits} ({busy} busy, {rejected} rejected)")?;
        writeln!(
            f,
            "render:     {frames} frames, {drawn} draws, {swaps} swaps, {superseded} superseded, \
             {lod_changes} LOD changes"
        )?;
        writeln!(
            f,
            "upload:     {bytes_uploaded} bytes, {upload_failures} failures"
        )?;
        write!(
            f,
            "collision:  {cooks_installed} installed, {cooks_discarded} discarded as stale, \
             {cook_failures} failures, {collision_abandoned} abandoned"
        )
    }
}

#[derive(Debug, Default)]
struct ProducerCounts {
    commits: AtomicU64,
    busy: AtomicU64,
    rejected: AtomicU64,
}

/// Runs producers against the mesh for `params.duration` while consuming on the calling
/// thread, then waits for the consumers to catch up, removes every section, and waits for
/// everything to be released.
///
/// Fails if the consumers do not converge on the final state.
pub(crate) fn run(params: &StressParams) -> Result<Stats, anyhow::Error> {
    let mesh = RealtimeMesh::new(params.config.clone());
    let placements = create_sections(&mesh, params)?;
    let ids: Vec<SectionId> = placements.iter().map(|&(id, _)| id).collect();

    let mut consumer = Consumer::new(&mesh, params, placements)?;

    let counts = ProducerCounts::default();
    let stop = AtomicBool::new(false);
    let run_result = thread::scope(|scope| {
        let (mesh, ids, counts, stop) = (&mesh, &ids, &counts, &stop);
        let spawned = (0..params.producers)
            .map(|i| {
                let seed = params.seed.wrapping_add(i as u64);
                thread::Builder::new()
                    .name(format!("producer {i}"))
                    .spawn_scoped(scope, move || produce(mesh, ids, params, seed, stop, counts))
            })
            .collect::<std::io::Result<Vec<_>>>();
        let handles = match spawned {
            Ok(handles) => handles,
            Err(error) => {
                stop.store(true, Ordering::Relaxed);
                return Err(anyhow::Error::new(error).context("failed to start producer threads"));
            }
        };
        log::info!("running {} producers for {:?}", handles.len(), params.duration);

        consumer.run_until(Instant::now() + params.duration);
        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;
        }
        Ok(())
    });
    run_result?;

    consumer.settle(&mesh, &ids)?;
    for &id in &ids {
        mesh.remove_section(id);
    }
    consumer.drain_removals()?;

    let mut stats = consumer.finish();
    stats.commits = counts.commits.into_inner();
    stats.busy = counts.busy.into_inner();
    stats.rejected = counts.rejected.into_inner();
    Ok(stats)
}

/// Creates the sections in a square grid, each with a detailed and a coarse LOD, and returns
/// where each one is placed.
fn create_sections(
    mesh: &RealtimeMesh,
    params: &StressParams,
) -> Result<Vec<(SectionId, MeshVector)>, anyhow::Error> {
    let columns = f64::from(params.sections).sqrt().ceil().max(1.0) as u32;
    let mut placements = Vec::new();
    let mut batches = Vec::new();
    for i in 0..params.sections {
        let id = mesh.create_section(SectionConfig {
            // Half the sections have collision, so that both kinds are exercised.
            collision_enabled: i % 2 == 0,
            ..SectionConfig::default()
        });
        batches.push(
            UpdateBatch::new(id)
                .replace_all(terrain(params.grid, 0.0, i as f32))
                .set_screen_size(0, FINE_SCREEN_SIZE)
                .set_lod(1, terrain(coarse(params.grid), 0.0, i as f32), COARSE_SCREEN_SIZE),
        );
        let offset = MeshVector::new(
            (i % columns) as f32 * SECTION_SIZE,
            (i / columns) as f32 * SECTION_SIZE,
            0.0,
        );
        placements.push((id, offset));
    }
    for (result, &(id, _)) in mesh.submit_many(batches).into_iter().zip(&placements) {
        result.with_context(|| format!("failed to initialize section {id}"))?;
    }
    Ok(placements)
}

fn coarse(grid: u32) -> u32 {
    (grid / 4).max(1)
}

/// Rolling hills which move with `time`.
fn terrain(divisions: u32, time: f32, phase: f32) -> StreamSet {
    shapes::height_field(divisions, SECTION_SIZE, [96, 160, 64, 255], move |x, y| {
        0.5 * (x * 0.8 + time + phase).sin() * (y * 0.6 - time).cos()
    })
}

fn vertex_range(
    streams: &StreamSet,
    kind: StreamKind,
    range: std::ops::Range<usize>,
) -> Vec<[f32; 3]> {
    streams
        .get(kind)
        .and_then(StreamData::as_slice::<[f32; 3]>)
        .and_then(|vertices| vertices.get(range))
        .map(<[_]>::to_vec)
        .unwrap_or_default()
}

/// Body of a producer thread: repeatedly picks a section and either rewrites a band of rows
/// of its detailed LOD or replaces all of its geometry.
fn produce(
    mesh: &RealtimeMesh,
    ids: &[SectionId],
    params: &StressParams,
    seed: u64,
    stop: &AtomicBool,
    counts: &ProducerCounts,
) {
    if ids.is_empty() {
        return;
    }
    let mut rng = rand_xoshiro::Xoshiro256Plus::seed_from_u64(seed);
    let start = Instant::now();
    let n = params.grid.max(1) as usize;
    let stride = n + 1;

    while !stop.load(Ordering::Relaxed) {
        let index = rng.random_range(0..ids.len());
        let id = ids[index];
        let time = start.elapsed().as_secs_f32();
        let phase = index as f32;
        let fine = terrain(params.grid, time, phase);

        let batch = if rng.random_bool(0.05) {
            UpdateBatch::new(id).replace_all(fine).set_lod(
                1,
                terrain(coarse(params.grid), time, phase),
                COARSE_SCREEN_SIZE,
            )
        } else {
            let first_row = rng.random_range(0..=n);
            let rows = rng.random_range(1..=(stride - first_row).min(4));
            let vertices = first_row * stride..(first_row + rows) * stride;
            UpdateBatch::new(id)
                .write_range(
                    0,
                    StreamKind::Position,
                    vertices.start,
                    vertex_range(&fine, StreamKind::Position, vertices.clone()),
                )
                .write_range(
                    0,
                    StreamKind::Normal,
                    vertices.start,
                    vertex_range(&fine, StreamKind::Normal, vertices),
                )
        };

        match mesh.submit(batch) {
            Ok(snapshot) => {
                log::trace!("committed {id} {}", snapshot.version());
                counts.commits.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) if error.is_transient() => {
                counts.busy.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                log::warn!("commit to {id} rejected: {error}");
                counts.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        thread::yield_now();
    }
}

/// Everything which runs on the render thread.
struct Consumer {
    sync: RenderProxySynchronizer<RecordingUploadBuffer>,
    pipeline: CollisionCookPipeline<RecordingPhysicsWorld>,
    pool: CookWorkerPool,
    selector: LodSelector,
    placements: Vec<(SectionId, MeshVector)>,
    frame_period: Duration,
    start: Instant,
    stats: Stats,
}

impl Consumer {
    fn new(
        mesh: &RealtimeMesh,
        params: &StressParams,
        placements: Vec<(SectionId, MeshVector)>,
    ) -> Result<Self, anyhow::Error> {
        let collision = &params.config.collision;
        let mut sync = RenderProxySynchronizer::new(RecordingUploadBuffer::new());
        sync.attach(mesh);
        let pipeline = CollisionCookPipeline::new(RecordingPhysicsWorld::new(), collision.clone());
        pipeline.attach(mesh);
        let pool = CookWorkerPool::new(pipeline.job_queue(), collision.worker_threads)
            .context("failed to start collision cook threads")?;
        Ok(Self {
            sync,
            pipeline,
            pool,
            selector: LodSelector::new(params.config.lod.clone()),
            placements,
            frame_period: params.frame_period,
            start: Instant::now(),
            stats: Stats::default(),
        })
    }

    fn run_until(&mut self, deadline: Instant) {
        let mut next_frame = Instant::now();
        while Instant::now() < deadline {
            self.frame();
            next_frame += self.frame_period;
            if let Some(wait) = next_frame.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
    }

    /// Circles the eye around the grid of sections, moving nearer and farther.
    fn view(&self) -> ViewParams {
        let t = self.start.elapsed().as_secs_f32();
        let extent = self
            .placements
            .iter()
            .fold(MeshVector::zero(), |max, &(_, offset)| max.max(offset))
            + MeshVector::new(SECTION_SIZE, SECTION_SIZE, 0.0);
        let center = Position::origin() + extent / 2.0;
        let radius = extent.x.max(extent.y) * (1.0 + 0.75 * (t * 0.3).sin());
        ViewParams {
            eye: center + MeshVector::new(radius * t.cos(), radius * t.sin(), SECTION_SIZE),
            ..ViewParams::default()
        }
    }

    fn frame(&mut self) {
        self.stats.frames += 1;

        let report = self.sync.swap();
        self.stats.swaps += report.swapped.len() as u64;
        self.stats.superseded += report.superseded as u64;
        self.stats.bytes_uploaded += report.bytes_uploaded as u64;
        self.stats.upload_failures += report.failed.len() as u64;

        let view = self.view();
        let estimates: Vec<(SectionId, f32)> = self
            .placements
            .iter()
            .filter_map(|&(id, offset)| {
                let sphere = self.sync.front(id)?.bounds().sphere()?;
                let placed = BoundingSphere {
                    center: sphere.center + offset,
                    ..sphere
                };
                Some((id, view.estimate_screen_size(placed)))
            })
            .collect();
        let choices = self.selector.select_all(&estimates, self.sync.fronts());
        self.stats.lod_changes += choices
            .iter()
            .filter(|&&(id, lod)| self.sync.active_lod(id).is_some_and(|active| active != lod))
            .count() as u64;
        self.sync.apply_lod_selection(choices);
        self.stats.drawn += self.sync.draw_list().len() as u64;

        if self.pool.is_empty() {
            self.pipeline.run_pending_cooks();
        }
        let cooked = self.pipeline.poll();
        self.stats.cooks_installed += cooked.installed.len() as u64;
        self.stats.cooks_discarded += cooked.discarded.len() as u64;
        self.stats.cook_failures += cooked.failures.len() as u64;
    }

    /// Runs frames until every section's front snapshot is its latest version and no
    /// collision is cooking.
    fn settle(&mut self, mesh: &RealtimeMesh, ids: &[SectionId]) -> Result<(), anyhow::Error> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            self.frame();
            let lagging = ids
                .iter()
                .filter(|&&id| {
                    let Some(latest) = mesh.snapshot(id) else {
                        return false;
                    };
                    let drawn = self.sync.front(id).map(|front| front.version());
                    drawn != Some(latest.version())
                        || self.pipeline.phase(id) == CookPhase::Cooking
                })
                .count();
            if lagging == 0 {
                break;
            }
            if Instant::now() > deadline {
                anyhow::bail!(
                    "{lagging} sections were not up to date {SETTLE_TIMEOUT:?} after the producers stopped"
                );
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.stats.collision_abandoned = ids
            .iter()
            .filter(|&&id| self.pipeline.phase(id) == CookPhase::Stale)
            .count() as u64;
        log::debug!("consumers caught up");
        Ok(())
    }

    /// Runs frames until every buffer and collision representation has been released.
    fn drain_removals(&mut self) -> Result<(), anyhow::Error> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            self.frame();
            let buffers = self.sync.uploader().live_buffers();
            let collisions = self.pipeline.world().len();
            if buffers == 0 && collisions == 0 {
                return Ok(());
            }
            if Instant::now() > deadline {
                anyhow::bail!(
                    "{buffers} buffers and {collisions} collision representations \
                     outlived their sections"
                );
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn finish(self) -> Stats {
        let Self {
            pipeline,
            pool,
            stats,
            ..
        } = self;
        // The workers exit once the pipeline is gone.
        drop(pipeline);
        pool.join();
        stats
    }
}
