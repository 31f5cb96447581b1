//! Timing and work statistics for hierarchy maintenance and transform propagation.

use core::{iter::Sum, ops::Div, time::Duration};
use std::collections::VecDeque;

use crate::plugin::HierarchySystems;
use bevy_app::prelude::*;
use bevy_ecs::prelude::*;
use bevy_reflect::prelude::*;

/// Number of ticks averaged by [`SmoothedStat`] unless configured otherwise.
pub const DEFAULT_SMOOTHING_WINDOW: usize = 64;

/// Summarizes per-tick hierarchy statistics.
pub struct HierarchyStatsPlugin {
    /// Number of ticks averaged into [`SmoothedStat<HierarchyStats>`].
    pub smoothing_window: usize,
}

impl Default for HierarchyStatsPlugin {
    fn default() -> Self {
        Self {
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
        }
    }
}

impl Plugin for HierarchyStatsPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<HierarchyStats>()
            .register_type::<HierarchyStats>()
            .insert_resource(SmoothedStat::<HierarchyStats>::new(self.smoothing_window))
            .add_systems(
                PostUpdate,
                HierarchyStats::reset.in_set(HierarchySystems::Init),
            )
            .add_systems(
                PostUpdate,
                (update_total, update_average)
                    .chain()
                    .after(HierarchySystems::Propagate),
            );
    }
}

fn update_total(mut stats: ResMut<HierarchyStats>) {
    stats.total = stats.maintenance + stats.propagation;
}

fn update_average(stats: Res<HierarchyStats>, mut average: ResMut<SmoothedStat<HierarchyStats>>) {
    average.push(stats.clone());
}

/// What the hierarchy systems did during the last tick.
#[derive(Resource, Debug, Clone, Default, Reflect)]
pub struct HierarchyStats {
    pub(crate) maintenance: Duration,
    pub(crate) propagation: Duration,
    pub(crate) reparented: usize,
    pub(crate) orphaned: usize,
    pub(crate) world_matrix_writes: usize,
    pub(crate) total: Duration,
}

impl HierarchyStats {
    pub(crate) fn reset(mut stats: ResMut<Self>) {
        *stats = Self::default();
    }

    /// Time spent keeping [`Parent`](crate::components::Parent) and
    /// [`Child`](crate::components::Child) consistent.
    pub fn maintenance(&self) -> Duration {
        self.maintenance
    }

    /// Time spent computing [`LocalToWorld`](crate::components::LocalToWorld) matrices.
    pub fn propagation(&self) -> Duration {
        self.propagation
    }

    /// Number of entities attached to a new parent.
    pub fn reparented(&self) -> usize {
        self.reparented
    }

    /// Number of entities whose parent disappeared, and which were turned into roots.
    pub fn orphaned(&self) -> usize {
        self.orphaned
    }

    /// Number of [`LocalToWorld`](crate::components::LocalToWorld) components written. Zero when
    /// nothing in any hierarchy changed.
    pub fn world_matrix_writes(&self) -> usize {
        self.world_matrix_writes
    }

    /// Total time spent in hierarchy systems.
    pub fn total(&self) -> Duration {
        self.total
    }
}

impl<'a> Sum<&'a HierarchyStats> for HierarchyStats {
    fn sum<I: Iterator<Item = &'a HierarchyStats>>(iter: I) -> Self {
        iter.fold(HierarchyStats::default(), |mut acc, e| {
            acc.maintenance += e.maintenance;
            acc.propagation += e.propagation;
            acc.reparented += e.reparented;
            acc.orphaned += e.orphaned;
            acc.world_matrix_writes += e.world_matrix_writes;
            acc.total += e.total;
            acc
        })
    }
}

impl Div<u32> for HierarchyStats {
    type Output = Self;

    fn div(self, rhs: u32) -> Self::Output {
        Self {
            maintenance: self.maintenance.div(rhs),
            propagation: self.propagation.div(rhs),
            reparented: self.reparented.div(rhs as usize),
            orphaned: self.orphaned.div(rhs as usize),
            world_matrix_writes: self.world_matrix_writes.div(rhs as usize),
            total: self.total.div(rhs),
        }
    }
}

/// Rolling average over the most recent ticks of a statistic.
///
/// Samples are kept newest first. Once the window is full, each new sample evicts the oldest one.
#[derive(Resource, Debug)]
pub struct SmoothedStat<T> {
    samples: VecDeque<T>,
    window: usize,
    average: T,
}

impl<T: Default> SmoothedStat<T> {
    /// Average over the last `window` samples. A window of zero is treated as one.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            average: T::default(),
        }
    }
}

impl<T: Default> Default for SmoothedStat<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_WINDOW)
    }
}

impl<T> SmoothedStat<T>
where
    for<'a> T: Sum<&'a T> + Div<u32, Output = T>,
{
    /// Record a sample, dropping the oldest one if the window is full, and refresh the average.
    pub fn push(&mut self, sample: T) {
        if self.samples.len() == self.window {
            self.samples.pop_back();
        }
        self.samples.push_front(sample);
        self.recompute();
    }

    /// Resize the window. Shrinking it drops the oldest samples right away.
    pub fn set_window(&mut self, window: usize) {
        self.window = window.max(1);
        if self.samples.len() > self.window {
            self.samples.truncate(self.window);
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        self.average = self.samples.iter().sum::<T>() / self.samples.len() as u32;
    }
}

impl<T> SmoothedStat<T> {
    /// The average of the samples currently in the window.
    pub fn average(&self) -> &T {
        &self.average
    }

    /// The most recent sample.
    pub fn latest(&self) -> Option<&T> {
        self.samples.front()
    }

    /// The samples in the window, newest first.
    pub fn samples(&self) -> impl ExactSizeIterator<Item = &T> + '_ {
        self.samples.iter()
    }

    /// How many samples are averaged.
    pub fn window(&self) -> usize {
        self.window
    }
}
