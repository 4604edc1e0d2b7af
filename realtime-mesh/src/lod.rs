//! Choosing which level of detail of each section to draw.
//!
//! Each LOD of a section has a screen size threshold; an LOD is preferred while the
//! section's estimated screen size is at least its threshold. [`select_lod()`] is the pure
//! decision, and [`LodSelector`] applies it to many sections while remembering each one's
//! previous choice for hysteresis.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::config::LodConfig;
use crate::{BoundingSphere, Position, SectionId, Snapshot};

/// Chooses an LOD index given the section's screen size thresholds (one per LOD, most
/// detailed first) and an estimate of its current screen size.
///
/// Without a `previous` choice, this is the most detailed LOD whose threshold is at most
/// `estimate`, or the least detailed LOD if there is none. With one, the choice only changes
/// when `estimate` is more than `margin` away from the threshold being crossed, so an estimate
/// wavering around a threshold does not cause flickering.
///
/// Thresholds are treated as if clamped to be non-increasing. Returns [`None`] if there are
/// no LODs.
pub fn select_lod(
    thresholds: &[f32],
    estimate: f32,
    previous: Option<usize>,
    margin: f32,
) -> Option<usize> {
    let last = thresholds.len().checked_sub(1)?;
    let raw = |estimate: f32| -> usize {
        let mut ceiling = f32::INFINITY;
        thresholds
            .iter()
            .position(|&threshold| {
                ceiling = ceiling.min(threshold);
                ceiling <= estimate
            })
            .unwrap_or(last)
    };

    let Some(previous) = previous.map(|p| p.min(last)) else {
        return Some(raw(estimate));
    };
    let margin = margin.max(0.0);
    let more_detailed = raw(estimate - margin);
    let less_detailed = raw(estimate + margin);
    Some(if more_detailed < previous {
        more_detailed
    } else if less_detailed > previous {
        less_detailed
    } else {
        previous
    })
}

/// Perspective view parameters, for estimating screen sizes of sections.
#[derive(Clone, Copy, Debug, PartialEq)]
#[expect(clippy::exhaustive_structs)]
pub struct ViewParams {
    /// Position of the eye, in the same space as section positions.
    pub eye: Position,
    /// Vertical field of view, in radians.
    pub fov_y: f32,
    /// Multiplier applied to every estimate. Greater than 1 favors more detailed LODs.
    pub lod_distance_factor: f32,
}

impl ViewParams {
    /// Estimates the fraction of the view's height that `sphere` covers.
    ///
    /// Distances under 1 are treated as 1, so the estimate stays finite when the eye is
    /// inside the sphere.
    pub fn estimate_screen_size(&self, sphere: BoundingSphere) -> f32 {
        let distance = (sphere.center - self.eye).length().max(1.0);
        let half_height = distance * (self.fov_y / 2.0).tan();
        if half_height <= 0.0 || !half_height.is_finite() {
            return 0.0;
        }
        sphere.radius / half_height * self.lod_distance_factor
    }

    /// Estimates the screen size of each snapshot's bounds. Empty snapshots are skipped.
    pub fn estimate_all<'s>(
        &self,
        snapshots: impl IntoIterator<Item = &'s Arc<Snapshot>>,
    ) -> Vec<(SectionId, f32)> {
        snapshots
            .into_iter()
            .filter_map(|snapshot| {
                let sphere = snapshot.bounds().sphere()?;
                Some((snapshot.section(), self.estimate_screen_size(sphere)))
            })
            .collect()
    }
}

impl Default for ViewParams {
    fn default() -> Self {
        Self {
            eye: Position::origin(),
            fov_y: std::f32::consts::FRAC_PI_2,
            lod_distance_factor: 1.0,
        }
    }
}

/// Source of per-frame screen size estimates for sections, implemented by the host.
pub trait ViewParameterProvider {
    /// Returns `(section, estimated screen size)` pairs for this frame.
    /// Sections not mentioned keep their previous LOD.
    fn screen_size_estimates(&self) -> Vec<(SectionId, f32)>;
}

impl ViewParameterProvider for [(SectionId, f32)] {
    fn screen_size_estimates(&self) -> Vec<(SectionId, f32)> {
        self.to_vec()
    }
}

impl ViewParameterProvider for Vec<(SectionId, f32)> {
    fn screen_size_estimates(&self) -> Vec<(SectionId, f32)> {
        self.clone()
    }
}

/// Applies [`select_lod()`] to many sections, remembering each section's previous choice.
#[derive(Clone, Debug, Default)]
pub struct LodSelector {
    config: LodConfig,
    previous: HashMap<SectionId, usize>,
}

impl LodSelector {
    /// Creates a selector with no history.
    pub fn new(config: LodConfig) -> Self {
        Self {
            config,
            previous: HashMap::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LodConfig {
        &self.config
    }

    /// Chooses the LOD of one section and remembers the choice.
    ///
    /// LODs more detailed than [`LodConfig::min_lod`] are never chosen unless the section
    /// has no others. Returns [`None`] if `thresholds` is empty.
    pub fn select(&mut self, section: SectionId, thresholds: &[f32], estimate: f32) -> Option<usize> {
        let previous = self.previous.get(&section).copied();
        let chosen = select_lod(thresholds, estimate, previous, self.config.hysteresis)?
            .max(self.config.min_lod)
            .min(thresholds.len() - 1);
        if previous.is_some_and(|p| p != chosen) {
            log::trace!("{section}: LOD {previous:?} -> {chosen} at screen size {estimate}");
        }
        self.previous.insert(section, chosen);
        Some(chosen)
    }

    /// Chooses LODs for every section in `snapshots` for which `view` provides an estimate.
    ///
    /// The result may be passed to
    /// [`RenderProxySynchronizer::apply_lod_selection()`](crate::render::RenderProxySynchronizer::apply_lod_selection).
    /// History of sections absent from `snapshots` is forgotten.
    pub fn select_all<'s>(
        &mut self,
        view: &(impl ViewParameterProvider + ?Sized),
        snapshots: impl IntoIterator<Item = &'s Arc<Snapshot>>,
    ) -> Vec<(SectionId, usize)> {
        let estimates: HashMap<SectionId, f32> =
            view.screen_size_estimates().into_iter().collect();
        let mut seen = HashSet::new();
        let mut choices = Vec::new();
        for snapshot in snapshots {
            let section = snapshot.section();
            seen.insert(section);
            let Some(&estimate) = estimates.get(&section) else {
                continue;
            };
            if let Some(lod) = self.select(section, &snapshot.screen_sizes(), estimate) {
                choices.push((section, lod));
            }
        }
        self.previous.retain(|id, _| seen.contains(id));
        choices.sort_unstable_by_key(|&(id, _)| id);
        choices
    }

    /// Returns the last LOD chosen for the section.
    pub fn previous(&self, section: SectionId) -> Option<usize> {
        self.previous.get(&section).copied()
    }

    /// Forgets the section's history.
    pub fn forget(&mut self, section: SectionId) {
        self.previous.remove(&section);
    }
}
