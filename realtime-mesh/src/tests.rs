//! Tests of the whole data flow from producer to consumers.

use std::sync::{Arc, Barrier, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::collision::{
    CollisionCookPipeline, CollisionError, CookFailed, CookPhase, CookWorkerPool,
};
use crate::config::{CollisionConfig, ContentionPolicy};
use crate::lod::LodSelector;
use crate::render::RenderProxySynchronizer;
use crate::testing::{PhysicsEvent, RecordingPhysicsWorld, RecordingUploadBuffer, grid_mesh};
use crate::*;

/// `vertex_count` positions scattered through a 10×10×10 cube, and `index_count` indices.
fn scattered(vertex_count: usize, index_count: usize) -> StreamSet {
    StreamSet::new()
        .with(
            StreamKind::Position,
            (0..vertex_count)
                .map(|i| [(i % 10) as f32, (i / 10 % 10) as f32, (i * 7 % 11) as f32])
                .collect::<Vec<_>>(),
        )
        .with(
            StreamKind::Index,
            (0..index_count)
                .map(|i| (i * 31 % vertex_count) as u32)
                .collect::<Vec<u32>>(),
        )
}

fn collision_section(mesh: &RealtimeMesh) -> SectionId {
    mesh.create_section(SectionConfig {
        collision_enabled: true,
        ..SectionConfig::default()
    })
}

fn write_one(id: SectionId, offset: usize) -> UpdateBatch {
    UpdateBatch::new(id).write_range(0, StreamKind::Position, offset, vec![[0.5f32; 3]])
}

#[test]
fn replace_all_publishes_version_1_with_bounds() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = mesh.create_section(SectionConfig::default());
    assert_eq!(mesh.snapshot(id).unwrap().version(), Version::INITIAL);

    let streams = scattered(100, 150);
    let snapshot = mesh.submit(UpdateBatch::new(id).replace_all(streams.clone())).unwrap();

    assert_eq!(snapshot.version(), Version(1));
    let lod = snapshot.lod(0).unwrap();
    assert_eq!((lod.positions().unwrap().len(), lod.indices().unwrap().len()), (100, 150));
    let aabb = snapshot.bounds().aabb();
    for &p in lod.positions().unwrap() {
        assert!(aabb.contains(Position::from(p)), "{p:?} not in {aabb:?}");
    }
    assert_eq!(mesh.snapshot(id), Some(snapshot));
}

#[test]
fn replace_all_round_trip() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = mesh.create_section(SectionConfig::default());
    let streams = grid_mesh(3);
    let snapshot = mesh.submit(UpdateBatch::new(id).replace_all(streams.clone())).unwrap();

    let lod = snapshot.lod(0).unwrap();
    assert_eq!(lod.streams().count(), streams.len());
    for (kind, data) in streams.iter() {
        assert_eq!(lod.stream(kind).map(StreamSnapshot::data), Some(data), "{kind}");
    }
}

#[rstest]
fn version_increases_by_one_per_commit(#[values(1, 2, 10)] commits: u64) {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = mesh.create_section(SectionConfig::default());
    mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(4))).unwrap();
    for i in 0..commits {
        // Failures in between do not consume versions.
        mesh.submit(UpdateBatch::new(id)).unwrap_err();
        let snapshot = mesh.submit(write_one(id, i as usize)).unwrap();
        assert_eq!(snapshot.version(), Version(i + 2));
    }
    assert_eq!(mesh.snapshot(id).unwrap().version(), Version(commits + 1));
}

#[test]
fn published_snapshots_never_change() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = mesh.create_section(SectionConfig::default());
    let v1 = mesh.submit(UpdateBatch::new(id).replace_all(scattered(20, 30))).unwrap();
    let v1_positions = v1.lod(0).unwrap().positions().unwrap().to_vec();

    let v2 = mesh
        .submit(UpdateBatch::new(id).write_range(
            0,
            StreamKind::Position,
            5,
            vec![[100.0f32; 3]; 5],
        ))
        .unwrap();

    assert_eq!(v1.lod(0).unwrap().positions().unwrap(), &v1_positions[..]);
    assert_eq!(v2.lod(0).unwrap().positions().unwrap()[5], [100.0; 3]);
    // Unwritten streams are shared, not copied.
    let index = |s: &Snapshot| s.lod(0).unwrap().stream(StreamKind::Index).unwrap().clone();
    assert!(index(&v1).shares_data_with(&index(&v2)));
    assert_eq!(v2.changes().get(0, StreamKind::Position), Some(5..10));
    assert_eq!(v2.changes().get(0, StreamKind::Index), None);
}

#[test]
fn write_beyond_maximum_fails_and_changes_nothing() {
    let config = MeshConfig {
        max_stream_elements: 120,
        ..MeshConfig::default()
    };
    let mesh = RealtimeMesh::new(config);
    let id = mesh.create_section(SectionConfig::default());
    let v1 = mesh.submit(UpdateBatch::new(id).replace_all(scattered(100, 150).with(
        StreamKind::Index,
        vec![0u32, 1, 2],
    )))
    .unwrap();

    let error = mesh
        .submit(UpdateBatch::new(id).write_range(
            0,
            StreamKind::Position,
            100,
            vec![[0.0f32; 3]; 21],
        ))
        .unwrap_err();
    assert!(matches!(error, SubmitError::OutOfRange(_)), "{error:?}");
    assert_eq!(mesh.snapshot(id), Some(v1));
    mesh.with_section(id, |section| {
        assert_eq!(section.lod(0).unwrap().vertex_count(), 100);
        assert_eq!(section.version(), Version(1));
    });
}

#[test]
fn failed_commit_notifies_nobody() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = mesh.create_section(SectionConfig::default());
    let (sender, events) = flume::unbounded::<MeshEvent>();
    mesh.listen(sender);

    mesh.submit(UpdateBatch::new(id).remove_lod(0)).unwrap_err();
    assert!(events.is_empty());

    mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(1))).unwrap();
    assert!(matches!(&events.drain().collect::<Vec<_>>()[..], [MeshEvent::Published(s)] if s.version() == Version(1)));
}

#[test]
fn removed_section_rejects_submissions() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = mesh.create_section(SectionConfig::default());
    let (sender, events) = flume::unbounded::<MeshEvent>();
    mesh.listen(sender);

    assert!(mesh.remove_section(id));
    assert!(!mesh.remove_section(id));
    assert_eq!(
        mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(1))),
        Err(SubmitError::UnknownSection(id))
    );
    assert!(mesh.snapshot(id).is_none());
    assert!(matches!(&events.drain().collect::<Vec<_>>()[..], [MeshEvent::Removed(r)] if *r == id));
    // Identifiers are not reused.
    assert_ne!(mesh.create_section(SectionConfig::default()), id);
}

/// Concurrent blocking submissions to one section are all applied exactly once, and
/// listeners observe their versions in order.
#[test]
fn concurrent_blocking_submissions() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let mesh = Arc::new(RealtimeMesh::new(MeshConfig::default()));
    let id = mesh.create_section(SectionConfig::default());
    mesh.submit(UpdateBatch::new(id).replace_all(scattered(THREADS, 0))).unwrap();
    let (sender, events) = flume::unbounded::<MeshEvent>();
    mesh.listen(sender);

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let mesh = Arc::clone(&mesh);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..PER_THREAD)
                    .map(|_| mesh.submit(write_one(id, t)).unwrap().version())
                    .collect::<Vec<Version>>()
            })
        })
        .collect();
    let mut versions: Vec<Version> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    versions.sort();
    versions.dedup();

    let expected: Vec<Version> = (2..=(THREADS * PER_THREAD) as u64 + 1).map(Version).collect();
    assert_eq!(versions, expected);
    let observed: Vec<Version> = events
        .drain()
        .map(|event| match event {
            MeshEvent::Published(s) => s.version(),
            MeshEvent::Removed(_) => panic!("unexpected removal"),
        })
        .collect();
    assert_eq!(observed, expected);
}

/// Retrying on `Busy` loses and duplicates nothing.
#[test]
fn concurrent_failing_submissions() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let mesh = Arc::new(RealtimeMesh::new(MeshConfig {
        contention: ContentionPolicy::Fail,
        ..MeshConfig::default()
    }));
    let id = mesh.create_section(SectionConfig::default());
    mesh.submit(UpdateBatch::new(id).replace_all(scattered(THREADS, 0))).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let mesh = Arc::clone(&mesh);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut busy = 0;
                for _ in 0..PER_THREAD {
                    loop {
                        match mesh.submit(write_one(id, t)) {
                            Ok(_) => break,
                            Err(e) if e.is_transient() => {
                                busy += 1;
                                thread::yield_now();
                            }
                            Err(e) => panic!("{e:?}"),
                        }
                    }
                }
                busy
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(
        mesh.snapshot(id).unwrap().version(),
        Version((THREADS * PER_THREAD) as u64 + 1)
    );
}

/// Listener which submits to the section it was notified about.
#[derive(Debug)]
struct Resubmitter {
    mesh: Weak<RealtimeMesh>,
    results: Mutex<Vec<Result<Version, SubmitError>>>,
}

impl Listener<MeshEvent> for Resubmitter {
    fn receive(&self, messages: &[MeshEvent]) -> bool {
        let Some(mesh) = self.mesh.upgrade() else {
            return false;
        };
        for message in messages {
            if let MeshEvent::Published(snapshot) = message {
                let result = mesh.submit(write_one(snapshot.section(), 0));
                self.results.lock().unwrap().push(result.map(|s| s.version()));
            }
        }
        true
    }
}

#[test]
fn contention_fails_with_busy() {
    let mesh = Arc::new(RealtimeMesh::new(MeshConfig {
        contention: ContentionPolicy::Fail,
        ..MeshConfig::default()
    }));
    let id = mesh.create_section(SectionConfig::default());
    let resubmitter = Arc::new(Resubmitter {
        mesh: Arc::downgrade(&mesh),
        results: Mutex::new(Vec::new()),
    });
    mesh.listen_events(Arc::<Resubmitter>::clone(&resubmitter));

    mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(1))).unwrap();

    assert_eq!(
        *resubmitter.results.lock().unwrap(),
        vec![Err(SubmitError::Busy(id))]
    );
    assert_eq!(mesh.snapshot(id).unwrap().version(), Version(1));
}

#[test]
fn submit_many_returns_results_in_order() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let ids: Vec<SectionId> = (0..8)
        .map(|_| mesh.create_section(SectionConfig::default()))
        .collect();
    let mut batches: Vec<UpdateBatch> = ids
        .iter()
        .map(|&id| UpdateBatch::new(id).replace_all(grid_mesh(2)))
        .collect();
    batches.push(UpdateBatch::new(ids[0]));

    let results = mesh.submit_many(batches);
    assert_eq!(results.len(), 9);
    for (result, &id) in results.iter().zip(&ids) {
        assert_eq!(result.as_ref().map(|s| s.section()), Ok(id));
    }
    assert_eq!(results[8], Err(SubmitError::InvalidBatch(BatchError::Empty)));
}

// --- Collision ------------------------------------------------------------------------------

fn pipeline() -> CollisionCookPipeline<RecordingPhysicsWorld> {
    CollisionCookPipeline::new(RecordingPhysicsWorld::new(), CollisionConfig::default())
}

/// A cook finishing after a newer version was committed is discarded, and the newer
/// version is what ends up installed.
#[test]
fn stale_cook_is_discarded() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = collision_section(&mesh);
    let mut pipeline = pipeline();
    mesh.listen(pipeline.requester());

    mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(2))).unwrap();
    assert_eq!(pipeline.phase(id), CookPhase::Cooking);
    // The version 1 cook starts, then version 2 is committed before it finishes.
    assert!(pipeline.run_one_cook());
    let v2 = mesh.submit(write_one(id, 0)).unwrap();

    let report = pipeline.poll();
    assert_eq!(report.discarded, vec![(id, Version(1))]);
    assert!(report.installed.is_empty());
    assert!(pipeline.world().is_empty());
    assert_eq!(pipeline.phase(id), CookPhase::Cooking);

    assert_eq!(pipeline.run_pending_cooks(), 1);
    let report = pipeline.poll();
    assert_eq!(report.installed, vec![(id, v2.version())]);
    assert_eq!(
        pipeline.world().installed(id).map(|r| r.version),
        Some(Version(2))
    );
    assert_eq!(pipeline.world().events, vec![PhysicsEvent::Installed(id, Version(2))]);
    assert_eq!(pipeline.phase(id), CookPhase::Installed);
}

#[test]
fn duplicate_requests_are_ignored() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = collision_section(&mesh);
    let mut pipeline = pipeline();
    let v1 = mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(2))).unwrap();

    pipeline.request_cook(Arc::clone(&v1));
    pipeline.request_cook(Arc::clone(&v1));
    assert_eq!(pipeline.job_queue().len(), 1);
    pipeline.run_pending_cooks();
    pipeline.poll();

    pipeline.request_cook(v1);
    assert!(pipeline.job_queue().is_empty());
    assert_eq!(pipeline.installed_version(id), Some(Version(1)));
}

#[test]
fn cook_failure_keeps_previous_collision() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = collision_section(&mesh);
    let mut pipeline = pipeline();
    mesh.listen(pipeline.requester());

    mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(2))).unwrap();
    pipeline.run_pending_cooks();
    pipeline.poll();

    // Every triangle is degenerate.
    let flat = StreamSet::new()
        .with(StreamKind::Position, vec![[0.0f32; 3]; 3])
        .with(StreamKind::Index, vec![0u32, 1, 2]);
    mesh.submit(UpdateBatch::new(id).replace_all(flat)).unwrap();

    let mut failures = Vec::new();
    while pipeline.run_pending_cooks() > 0 {
        failures.extend(pipeline.poll().failures);
    }
    // The first attempt and every retry.
    assert_eq!(failures.len(), 1 + CollisionConfig::default().max_retries as usize);
    assert_eq!(
        failures[0],
        (id, Version(2), CollisionError::Cook(CookFailed::NoTriangles))
    );
    assert_eq!(pipeline.installed_version(id), Some(Version(1)));
    assert_eq!(pipeline.world().len(), 1);
    assert_eq!(pipeline.phase(id), CookPhase::Stale);
}

#[test]
fn install_failure_is_retried() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = collision_section(&mesh);
    let mut pipeline = pipeline();
    mesh.listen(pipeline.requester());
    pipeline.world_mut().fail_installs = 1;

    mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(2))).unwrap();
    pipeline.run_pending_cooks();
    let report = pipeline.poll();
    assert!(matches!(
        &report.failures[..],
        [(_, _, CollisionError::Install(_))]
    ));
    assert_eq!(pipeline.phase(id), CookPhase::Cooking);

    pipeline.run_pending_cooks();
    pipeline.poll();
    assert_eq!(
        pipeline.world().events,
        vec![
            PhysicsEvent::Rejected(id, Version(1)),
            PhysicsEvent::Installed(id, Version(1)),
        ]
    );
}

#[test]
fn disabling_or_removing_removes_collision() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let a = collision_section(&mesh);
    let b = collision_section(&mesh);
    let plain = mesh.create_section(SectionConfig::default());
    let mut pipeline = pipeline();
    mesh.listen(pipeline.requester());

    for id in [a, b, plain] {
        mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(1))).unwrap();
    }
    assert_eq!(pipeline.run_pending_cooks(), 2);
    pipeline.poll();
    assert_eq!(pipeline.world().len(), 2);
    assert_eq!(pipeline.phase(plain), CookPhase::Idle);

    mesh.submit(UpdateBatch::new(a).set_collision(false)).unwrap();
    mesh.remove_section(b);
    assert_eq!(pipeline.run_pending_cooks(), 0);
    let mut report = pipeline.poll();
    report.removed.sort();
    assert_eq!(report.removed, vec![a, b]);
    assert!(pipeline.world().is_empty());
    assert_eq!(pipeline.phase(a), CookPhase::Idle);
    assert_eq!(pipeline.phase(b), CookPhase::Idle);
}

#[test]
fn worker_pool_cooks_in_background() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = collision_section(&mesh);
    let mut pipeline = pipeline();
    pipeline.attach(&mesh);
    let pool = CookWorkerPool::new(pipeline.job_queue(), 2).unwrap();
    assert_eq!(pool.len(), 2);

    mesh.submit(UpdateBatch::new(id).replace_all(grid_mesh(4))).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while pipeline.installed_version(id).is_none() {
        assert!(Instant::now() < deadline, "cook did not finish");
        pipeline.poll();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(
        pipeline.world().installed(id).unwrap().shape.triangle_count(),
        32
    );

    drop(pipeline);
    pool.join();
}

// --- Everything together --------------------------------------------------------------------

#[test]
fn producer_to_render_and_physics() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = collision_section(&mesh);
    let mut sync = RenderProxySynchronizer::new(RecordingUploadBuffer::new());
    let mut pipeline = pipeline();
    let mut selector = LodSelector::new(MeshConfig::default().lod);
    sync.attach(&mesh);
    pipeline.attach(&mesh);

    mesh.submit(
        UpdateBatch::new(id)
            .replace_all(grid_mesh(8))
            .set_lod(1, grid_mesh(2), 0.2),
    )
    .unwrap();
    assert_eq!(sync.swap().swapped, vec![id]);
    pipeline.run_pending_cooks();
    assert_eq!(pipeline.poll().installed, vec![(id, Version(1))]);

    // Far away: the coarse LOD is drawn.
    let choices = selector.select_all(&vec![(id, 0.01)], sync.fronts());
    sync.apply_lod_selection(choices);
    let draw_list = sync.draw_list();
    assert_eq!(draw_list[0].lod, 1);
    assert_eq!(draw_list[0].index_count, 2 * 2 * 6);

    // Collision follows the detailed LOD.
    assert_eq!(
        pipeline.world().installed(id).unwrap().shape.triangle_count(),
        8 * 8 * 2
    );
}
