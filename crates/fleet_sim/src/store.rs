//! Shared fleet-state projection for external consumers.
//!
//! Workers and the coordinator push their latest observations here; readers
//! (dashboards, the fleet summary) take snapshots without any external
//! locking. The store is a display aid, not the authoritative model: writes
//! are last-writer-wins by arrival order, so a view can transiently lag the
//! state its owner holds.

use api::{TaskId, VehicleStatus, WorkerId};
use chrono::{DateTime, Utc};
use citygrid::Intersection;
use dashmap::DashMap;

use crate::task::TaskStatus;

/// Latest reported state of one vehicle.
#[derive(Debug, Clone)]
pub struct VehicleView {
    pub reported_position: Intersection,
    /// Where the vehicle is currently heading, if it told us.
    pub target_position: Option<Intersection>,
    pub status: VehicleStatus,
    pub deliveries_completed: u64,
    pub last_update: DateTime<Utc>,
}

/// Latest reported state of one task.
#[derive(Debug, Clone)]
pub struct TaskView {
    /// Where to draw the parcel: the pickup corner while it waits, the
    /// carrying vehicle's position once it is on board.
    pub display_position: Intersection,
    pub status: TaskStatus,
    pub pickup: Intersection,
    pub delivery: Intersection,
}

/// Concurrent projection of worker and task state, one entry per identity.
///
/// Upserts are atomic per key; snapshot iteration holds no global lock, so
/// writers never stall behind a reader traversal.
#[derive(Default)]
pub struct FleetStateStore {
    vehicles: DashMap<WorkerId, VehicleView>,
    tasks: DashMap<TaskId, TaskView>,
}

impl FleetStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the vehicle's view with the newest report.
    pub fn upsert_vehicle(
        &self,
        id: WorkerId,
        reported_position: Intersection,
        target_position: Option<Intersection>,
        status: VehicleStatus,
        deliveries_completed: u64,
    ) {
        self.vehicles.insert(
            id,
            VehicleView {
                reported_position,
                target_position,
                status,
                deliveries_completed,
                last_update: Utc::now(),
            },
        );
    }

    pub fn upsert_task(&self, id: TaskId, view: TaskView) {
        self.tasks.insert(id, view);
    }

    pub fn remove_vehicle(&self, id: WorkerId) -> Option<VehicleView> {
        self.vehicles.remove(&id).map(|(_, view)| view)
    }

    pub fn remove_task(&self, id: TaskId) -> Option<TaskView> {
        self.tasks.remove(&id).map(|(_, view)| view)
    }

    pub fn vehicle(&self, id: WorkerId) -> Option<VehicleView> {
        self.vehicles.get(&id).map(|entry| entry.clone())
    }

    pub fn task(&self, id: TaskId) -> Option<TaskView> {
        self.tasks.get(&id).map(|entry| entry.clone())
    }

    /// Snapshot of every vehicle view at some point during the call.
    pub fn vehicles(&self) -> Vec<(WorkerId, VehicleView)> {
        self.vehicles
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Snapshot of every task view at some point during the call.
    pub fn tasks(&self) -> Vec<(TaskId, TaskView)> {
        self.tasks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
