use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::*;
use crate::testing::{RecordingUploadBuffer, UploadCall};
use crate::{MeshConfig, RealtimeMesh, SectionConfig, StreamSet, UpdateBatch};

type Synchronizer = RenderProxySynchronizer<RecordingUploadBuffer>;

/// `count` vertices along the X axis and `count * 3 / 2` indices.
fn strip(count: usize) -> StreamSet {
    StreamSet::new()
        .with(
            StreamKind::Position,
            (0..count).map(|i| [i as f32, 0.0, 0.0]).collect::<Vec<_>>(),
        )
        .with(
            StreamKind::Index,
            (0..count * 3 / 2)
                .map(|i| (i % count) as u32)
                .collect::<Vec<u32>>(),
        )
}

fn setup() -> (RealtimeMesh, SectionId, Synchronizer) {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let id = mesh.create_section(SectionConfig::default());
    (mesh, id, RenderProxySynchronizer::new(RecordingUploadBuffer::new()))
}

/// Submits 100 vertices, prepares and swaps them in.
fn setup_swapped() -> (RealtimeMesh, SectionId, Synchronizer) {
    let (mesh, id, mut sync) = setup();
    let snapshot = mesh
        .submit(UpdateBatch::new(id).replace_all(strip(100)))
        .unwrap();
    sync.prepare(snapshot);
    sync.swap();
    (mesh, id, sync)
}

fn write_positions(mesh: &RealtimeMesh, id: SectionId, offset: usize, len: usize) -> Arc<Snapshot> {
    mesh.submit(UpdateBatch::new(id).write_range(
        0,
        StreamKind::Position,
        offset,
        vec![[9.0f32, 9.0, 9.0]; len],
    ))
    .unwrap()
}

fn assert_buffers_match(sync: &Synchronizer, id: SectionId) {
    let front = sync.front(id).unwrap();
    for (lod_index, lod) in front.lods().iter().enumerate() {
        for stream in lod.streams() {
            let contents = sync
                .uploader()
                .contents(id, lod_index, stream.kind())
                .unwrap();
            assert_eq!(&contents[..stream.as_bytes().len()], stream.as_bytes());
        }
    }
}

/// Checks the buffers handed out by [`RenderProxySynchronizer::draw_list()`] against the
/// front snapshots, regardless of what has been allocated since.
fn assert_drawn_buffers_match(sync: &Synchronizer) {
    for item in sync.draw_list() {
        let front = sync.front(item.section).unwrap();
        assert_eq!(front.version(), item.version);
        let lod = front.lod(item.lod).unwrap();
        for (kind, handle) in item.buffers {
            let expected = lod.stream(kind).unwrap().as_bytes();
            let contents = sync.uploader().buffer(handle).unwrap();
            assert_eq!(&contents[..expected.len()], expected, "{kind:?}");
        }
    }
}

/// Overwrites some positions and doubles the number of indices.
fn write_positions_and_grow_indices(mesh: &RealtimeMesh, id: SectionId) -> Arc<Snapshot> {
    mesh.submit(
        UpdateBatch::new(id)
            .write_range(0, StreamKind::Position, 50, vec![[9.0f32, 9.0, 9.0]; 10])
            .write_range(
                0,
                StreamKind::Index,
                150,
                (0..150).map(|i| (i % 100) as u32).collect::<Vec<u32>>(),
            ),
    )
    .unwrap()
}

#[test]
fn first_swap_uploads_everything() {
    let (mesh, id, mut sync) = setup();
    let snapshot = mesh
        .submit(UpdateBatch::new(id).replace_all(strip(100)))
        .unwrap();

    assert_eq!(
        sync.prepare(snapshot.clone()),
        PrepareOutcome::Staged { superseded: None }
    );
    assert_eq!(
        sync.pending_uploads(id),
        vec![
            PendingUpload {
                lod: 0,
                kind: StreamKind::Position,
                bytes: 0..1200,
            },
            PendingUpload {
                lod: 0,
                kind: StreamKind::Index,
                bytes: 0..600,
            },
        ]
    );
    assert!(sync.front(id).is_none());
    assert!(sync.uploader().calls.is_empty(), "prepare must not upload");

    let report = sync.swap();
    assert_eq!(report.swapped, vec![id]);
    assert_eq!(report.bytes_uploaded, 1800);
    assert_eq!(sync.front(id), Some(&snapshot));
    assert!(sync.back(id).is_none());
    assert!(sync.pending_uploads(id).is_empty());
    assert_buffers_match(&sync, id);
}

#[test]
fn write_range_uploads_only_changed_bytes() {
    let (mesh, id, mut sync) = setup_swapped();
    let snapshot = write_positions(&mesh, id, 50, 10);
    assert_eq!(snapshot.version(), Version(2));

    sync.prepare(snapshot);
    assert_eq!(
        sync.pending_uploads(id),
        vec![PendingUpload {
            lod: 0,
            kind: StreamKind::Position,
            bytes: 600..720,
        }]
    );

    let report = sync.swap();
    assert_eq!(report.bytes_uploaded, 120);
    assert_eq!(
        sync.uploader().uploads().last(),
        Some(&(id, 0, StreamKind::Position, 600..720))
    );
    assert_buffers_match(&sync, id);
}

#[test]
fn superseded_snapshots_coalesce() {
    let (mesh, id, mut sync) = setup_swapped();
    let v2 = write_positions(&mesh, id, 10, 10);
    let v3 = write_positions(&mesh, id, 30, 10);

    assert_eq!(
        sync.prepare(v2),
        PrepareOutcome::Staged { superseded: None }
    );
    assert_eq!(
        sync.prepare(v3.clone()),
        PrepareOutcome::Staged {
            superseded: Some(Version(2))
        }
    );
    // The range v2 changed is still uploaded, as part of v3.
    assert_eq!(
        sync.pending_uploads(id),
        vec![PendingUpload {
            lod: 0,
            kind: StreamKind::Position,
            bytes: 120..480,
        }]
    );

    let uploads_before = sync.uploader().uploads().len();
    let report = sync.swap();
    assert_eq!(report.swapped, vec![id]);
    assert_eq!(sync.uploader().uploads().len(), uploads_before + 1);
    assert_eq!(sync.front(id), Some(&v3));
    assert_buffers_match(&sync, id);
}

#[test]
fn superseded_count_is_reported_for_channel_delivery() {
    let (mesh, id, mut sync) = setup_swapped();
    mesh.listen(sync.listener());
    write_positions(&mesh, id, 0, 1);
    write_positions(&mesh, id, 1, 1);
    write_positions(&mesh, id, 2, 1);

    let report = sync.swap();
    assert_eq!(report.superseded, 2);
    assert_eq!(sync.front(id).unwrap().version(), Version(4));
    assert_buffers_match(&sync, id);
}

#[test]
fn swap_twice_is_idempotent() {
    let (_mesh, id, mut sync) = setup_swapped();
    let front = sync.front(id).cloned();
    let calls = sync.uploader().calls.len();

    let report = sync.swap();
    assert_eq!(report, SwapReport::default());
    assert_eq!(sync.front(id).cloned(), front);
    assert_eq!(sync.uploader().calls.len(), calls);
}

#[test]
fn version_gap_uploads_whole_stream() {
    let (mesh, id, mut sync) = setup_swapped();
    let _skipped = write_positions(&mesh, id, 0, 10);
    let v3 = write_positions(&mesh, id, 90, 10);

    sync.prepare(v3);
    assert_eq!(
        sync.pending_uploads(id),
        vec![
            PendingUpload {
                lod: 0,
                kind: StreamKind::Position,
                bytes: 0..1200,
            },
            PendingUpload {
                lod: 0,
                kind: StreamKind::Index,
                bytes: 0..600,
            },
        ]
    );
    sync.swap();
    assert_buffers_match(&sync, id);
}

#[test]
fn older_snapshot_is_stale() {
    let (mesh, id, mut sync) = setup_swapped();
    let v2 = write_positions(&mesh, id, 0, 1);
    let v1 = sync.front(id).cloned().unwrap();

    assert_eq!(sync.prepare(Arc::clone(&v2)), PrepareOutcome::Staged { superseded: None });
    assert_eq!(sync.prepare(Arc::clone(&v2)), PrepareOutcome::Stale);
    assert_eq!(sync.prepare(v1), PrepareOutcome::Stale);
    assert_eq!(sync.back(id), Some(&v2));
}

#[test]
fn upload_failure_keeps_front_and_retries() {
    let (mesh, id, mut sync) = setup_swapped();
    let v1 = sync.front(id).cloned().unwrap();
    let v2 = write_positions(&mesh, id, 50, 10);
    sync.prepare(Arc::clone(&v2));

    sync.uploader_mut().fail_uploads = 1;
    let report = sync.swap();
    assert!(report.swapped.is_empty());
    assert_eq!(
        report.failed,
        vec![(id, UploadError::Other("injected failure".into()))]
    );
    assert_eq!(sync.front(id), Some(&v1));
    assert_eq!(sync.back(id), Some(&v2));
    assert_eq!(sync.pending_uploads(id).len(), 1);

    let report = sync.swap();
    assert_eq!(report.swapped, vec![id]);
    assert_eq!(report.bytes_uploaded, 120);
    assert_eq!(sync.front(id), Some(&v2));
    assert_buffers_match(&sync, id);
}

#[test]
fn allocation_failure_is_reported() {
    let (mesh, id, mut sync) = setup();
    sync.prepare(
        mesh.submit(UpdateBatch::new(id).replace_all(strip(10)))
            .unwrap(),
    );
    sync.uploader_mut().fail_allocations = 1;

    let report = sync.swap();
    assert_eq!(report.failed, vec![(id, UploadError::OutOfMemory)]);
    assert!(sync.front(id).is_none());
    assert!(sync.draw_list().is_empty());

    assert_eq!(sync.swap().swapped, vec![id]);
    assert_buffers_match(&sync, id);
}

#[test]
fn allocation_failure_leaves_front_buffers_untouched() {
    let (mesh, id, mut sync) = setup_swapped();
    let v1 = sync.front(id).cloned().unwrap();
    let v2 = write_positions_and_grow_indices(&mesh, id);
    sync.prepare(Arc::clone(&v2));

    sync.uploader_mut().fail_allocations = 1;
    let report = sync.swap();
    assert_eq!(report.failed, vec![(id, UploadError::OutOfMemory)]);
    assert!(report.swapped.is_empty());
    assert_eq!(report.bytes_uploaded, 0);
    assert_eq!(sync.front(id), Some(&v1));
    let draw_list = sync.draw_list();
    let item = &draw_list[0];
    assert!(!item.partially_updated);
    assert_eq!(
        item.buffers,
        vec![
            (StreamKind::Position, BufferHandle(0)),
            (StreamKind::Index, BufferHandle(1)),
        ]
    );
    assert_drawn_buffers_match(&sync);

    let report = sync.swap();
    assert_eq!(report.swapped, vec![id]);
    assert_eq!(sync.front(id), Some(&v2));
    assert!(sync.uploader().calls.contains(&UploadCall::Release(BufferHandle(1))));
    assert_eq!(sync.uploader().live_buffers(), 2);
    assert_drawn_buffers_match(&sync);
}

#[test]
fn failed_write_to_new_buffer_leaves_front_buffers_untouched() {
    let (mesh, id, mut sync) = setup_swapped();
    let v2 = write_positions_and_grow_indices(&mesh, id);
    sync.prepare(Arc::clone(&v2));

    sync.uploader_mut().fail_uploads = 1;
    let report = sync.swap();
    assert_eq!(
        report.failed,
        vec![(id, UploadError::Other("injected failure".into()))]
    );
    assert_eq!(sync.front(id).map(|s| s.version()), Some(Version(1)));
    assert!(!sync.draw_list()[0].partially_updated);
    assert_drawn_buffers_match(&sync);
    // The new index buffer is kept for the retry, and so is the one being drawn.
    assert_eq!(sync.uploader().live_buffers(), 3);

    let report = sync.swap();
    assert_eq!(report.swapped, vec![id]);
    assert_eq!(sync.front(id), Some(&v2));
    assert_eq!(sync.uploader().live_buffers(), 2);
    assert_drawn_buffers_match(&sync);
}

#[test]
fn partial_in_place_upload_is_reported() {
    let (mesh, id, mut sync) = setup_swapped();
    let v2 = mesh
        .submit(
            UpdateBatch::new(id)
                .write_range(0, StreamKind::Position, 50, vec![[9.0f32, 9.0, 9.0]; 10])
                .write_range(0, StreamKind::Index, 0, vec![5u32, 6, 7]),
        )
        .unwrap();
    sync.prepare(Arc::clone(&v2));

    sync.uploader_mut().uploads_before_failure = 1;
    sync.uploader_mut().fail_uploads = 1;
    let report = sync.swap();
    assert_eq!(report.failed.len(), 1);
    let draw_list = sync.draw_list();
    let item = &draw_list[0];
    assert_eq!(item.version, Version(1));
    assert!(item.partially_updated);
    assert_eq!(
        sync.pending_uploads(id),
        vec![PendingUpload {
            lod: 0,
            kind: StreamKind::Index,
            bytes: 0..12,
        }]
    );

    let report = sync.swap();
    assert_eq!(report.swapped, vec![id]);
    assert_eq!(report.bytes_uploaded, 12);
    assert!(!sync.draw_list()[0].partially_updated);
    assert_drawn_buffers_match(&sync);
}

#[test]
fn growth_reallocates_and_releases() {
    let (mesh, id, mut sync) = setup_swapped();
    let snapshot = mesh
        .submit(UpdateBatch::new(id).append(
            0,
            StreamSet::new().with(
                StreamKind::Position,
                vec![[1.0f32, 2.0, 3.0]; 50],
            ),
        ))
        .unwrap();
    sync.prepare(snapshot);
    assert_eq!(
        sync.pending_uploads(id),
        vec![PendingUpload {
            lod: 0,
            kind: StreamKind::Position,
            bytes: 1200..1800,
        }]
    );

    let report = sync.swap();
    assert_eq!(report.bytes_uploaded, 1800);
    let calls = &sync.uploader().calls;
    assert!(calls.contains(&UploadCall::Allocate {
        section: id,
        lod: 0,
        kind: StreamKind::Position,
        capacity_bytes: 1800,
        handle: BufferHandle(2),
    }));
    assert!(calls.contains(&UploadCall::Release(BufferHandle(0))));
    assert_eq!(sync.uploader().live_buffers(), 2);
    assert_buffers_match(&sync, id);
}

#[test]
fn removed_lod_buffers_are_released() {
    let (mesh, id, mut sync) = setup();
    sync.prepare(
        mesh.submit(
            UpdateBatch::new(id)
                .replace_all(strip(100))
                .set_lod(1, strip(10), 0.5),
        )
        .unwrap(),
    );
    sync.swap();
    assert_eq!(sync.uploader().live_buffers(), 4);

    sync.prepare(mesh.submit(UpdateBatch::new(id).remove_lod(1)).unwrap());
    assert!(sync.pending_uploads(id).is_empty());
    let report = sync.swap();
    assert_eq!(report.bytes_uploaded, 0);
    assert_eq!(sync.uploader().live_buffers(), 2);
    assert!(sync.uploader().calls.ends_with(&[
        UploadCall::Release(BufferHandle(2)),
        UploadCall::Release(BufferHandle(3)),
    ]));
}

#[test]
fn removed_section_releases_everything() {
    let (mesh, id, mut sync) = setup();
    mesh.listen(sync.listener());
    let snapshot = mesh
        .submit(UpdateBatch::new(id).replace_all(strip(100)))
        .unwrap();
    sync.swap();
    assert_eq!(sync.uploader().live_buffers(), 2);

    assert!(mesh.remove_section(id));
    sync.swap();
    assert_eq!(sync.uploader().live_buffers(), 0);
    assert!(sync.front(id).is_none());
    assert_eq!(sync.prepare(snapshot), PrepareOutcome::Removed);
}

#[test]
fn hidden_sections() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let hidden = mesh.create_section(SectionConfig {
        visible: false,
        ..SectionConfig::default()
    });
    let shown = mesh.create_section(SectionConfig::default());
    let mut sync = RenderProxySynchronizer::new(RecordingUploadBuffer::new());

    assert_eq!(
        sync.prepare(
            mesh.submit(UpdateBatch::new(hidden).replace_all(strip(10)))
                .unwrap()
        ),
        PrepareOutcome::Hidden
    );
    sync.prepare(
        mesh.submit(UpdateBatch::new(shown).replace_all(strip(10)))
            .unwrap(),
    );
    sync.swap();
    assert_eq!(sync.draw_list().len(), 1);

    // A section that was visible keeps its proxy when hidden, but is not drawn.
    sync.prepare(
        mesh.submit(UpdateBatch::new(shown).set_config(SectionConfig {
            visible: false,
            ..SectionConfig::default()
        }))
        .unwrap(),
    );
    sync.swap();
    assert!(sync.front(shown).is_some());
    assert!(sync.draw_list().is_empty());
}

#[test]
fn draw_list_clamps_active_lod() {
    let (mesh, id, mut sync) = setup();
    sync.prepare(
        mesh.submit(
            UpdateBatch::new(id)
                .replace_all(strip(100))
                .set_lod(1, strip(10), 0.5),
        )
        .unwrap(),
    );
    sync.swap();
    assert_eq!(sync.active_lod(id), Some(0));

    sync.apply_lod_selection([(id, 5)]);
    assert_eq!(sync.active_lod(id), Some(1));
    assert_eq!(
        sync.draw_list(),
        vec![DrawItem {
            section: id,
            version: Version(1),
            lod: 1,
            material_slot: 0,
            casts_shadow: true,
            index_count: 15,
            buffers: vec![
                (StreamKind::Position, BufferHandle(2)),
                (StreamKind::Index, BufferHandle(3)),
            ],
            partially_updated: false,
        }]
    );
}

#[test]
fn attach_picks_up_existing_snapshots() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let committed = mesh.create_section(SectionConfig::default());
    let untouched = mesh.create_section(SectionConfig::default());
    mesh.submit(UpdateBatch::new(committed).replace_all(strip(10)))
        .unwrap();

    let mut sync = RenderProxySynchronizer::new(RecordingUploadBuffer::new());
    sync.attach(&mesh);
    assert!(sync.back(committed).is_some());
    assert!(sync.back(untouched).is_none());

    mesh.submit(UpdateBatch::new(untouched).replace_all(strip(10)))
        .unwrap();
    let report = sync.swap();
    assert_eq!(report.swapped, vec![committed, untouched]);
}

#[test]
fn removed_sections_merge_into_runs() {
    let mut removed = RemovedSections::default();
    for i in [0, 1, 2, 5, 7, 6, 4] {
        removed.insert(SectionId(i));
    }
    assert_eq!(removed.run_count(), 2);
    removed.insert(SectionId(3));
    removed.insert(SectionId(3));
    assert_eq!(removed.run_count(), 1);
    assert!((0..8).all(|i| removed.contains(SectionId(i))));
    assert!(!removed.contains(SectionId(8)));
    assert!(!removed.contains(SectionId(u32::MAX)));

    removed.insert(SectionId(u32::MAX));
    assert!(removed.contains(SectionId(u32::MAX)));
    assert_eq!(removed.run_count(), 2);
}

#[test]
fn many_removals_keep_one_marker() {
    let mesh = RealtimeMesh::new(MeshConfig::default());
    let mut sync = RenderProxySynchronizer::new(RecordingUploadBuffer::new());
    mesh.listen(sync.listener());
    let mut last = None;
    for _ in 0..100 {
        let id = mesh.create_section(SectionConfig::default());
        last = Some(
            mesh.submit(UpdateBatch::new(id).replace_all(strip(10)))
                .unwrap(),
        );
        sync.swap();
        mesh.remove_section(id);
        sync.swap();
    }
    assert_eq!(sync.removed.run_count(), 1);
    assert_eq!(sync.uploader().live_buffers(), 0);
    assert_eq!(sync.prepare(last.unwrap()), PrepareOutcome::Removed);
}
