//! The lifecycle record of one delivery task.

use api::{TaskId, WorkerId};
use citygrid::Intersection;
use thiserror::Error;

/// Lifecycle states of a task.
///
/// `Delivered` and `Failed` are terminal; a terminal record is immutable and
/// eligible for removal from any live index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Bidding,
    Assigned,
    EnRoutePickup,
    EnRouteDelivery,
    Delivered,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Delivered | TaskStatus::Failed)
    }

    /// The legal transition table. Up to `Assigned`/`Failed` the coordinator
    /// drives the record; from `Assigned` onward only the assignee does.
    fn can_transition(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Bidding)
                | (Created, Failed)
                | (Bidding, Assigned)
                | (Bidding, Failed)
                | (Assigned, EnRoutePickup)
                | (EnRoutePickup, EnRouteDelivery)
                | (EnRouteDelivery, Delivered)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Bidding => "BIDDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::EnRoutePickup => "EN_ROUTE_PICKUP",
            TaskStatus::EnRouteDelivery => "EN_ROUTE_DELIVERY",
            TaskStatus::Delivered => "DELIVERED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid transition {from} -> {to} for task {task}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// One delivery task from creation to delivery or failure.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub pickup: Intersection,
    pub delivery: Intersection,
    status: TaskStatus,
    assignee: Option<WorkerId>,
}

impl Task {
    pub fn new(pickup: Intersection, delivery: Intersection) -> Self {
        Self {
            id: TaskId::new(),
            pickup,
            delivery,
            status: TaskStatus::Created,
            assignee: None,
        }
    }

    /// Rebuilds the record on the assignee's side from an accepted award.
    /// Post-assignment transitions belong exclusively to this copy.
    pub fn from_award(
        id: TaskId,
        pickup: Intersection,
        delivery: Intersection,
        assignee: WorkerId,
    ) -> Self {
        Self {
            id,
            pickup,
            delivery,
            status: TaskStatus::Assigned,
            assignee: Some(assignee),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn assignee(&self) -> Option<WorkerId> {
        self.assignee
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition(next) {
            return Err(TaskError::InvalidTransition {
                task: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Records the auction winner and moves the record to `Assigned`.
    pub fn assign(&mut self, winner: WorkerId) -> Result<(), TaskError> {
        self.transition(TaskStatus::Assigned)?;
        self.assignee = Some(winner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(Intersection::new(1, 1), Intersection::new(5, 5))
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        let mut t = task();
        t.transition(TaskStatus::Bidding).unwrap();
        t.assign(WorkerId(3)).unwrap();
        t.transition(TaskStatus::EnRoutePickup).unwrap();
        t.transition(TaskStatus::EnRouteDelivery).unwrap();
        t.transition(TaskStatus::Delivered).unwrap();
        assert!(t.status().is_terminal());
        assert_eq!(t.assignee(), Some(WorkerId(3)));
    }

    #[test]
    fn bidding_can_fail_but_not_skip_to_delivery() {
        let mut t = task();
        t.transition(TaskStatus::Bidding).unwrap();
        assert!(t.transition(TaskStatus::Delivered).is_err());
        t.transition(TaskStatus::Failed).unwrap();
        assert!(t.status().is_terminal());
    }

    #[test]
    fn created_fails_directly_when_no_capacity_exists() {
        let mut t = task();
        t.transition(TaskStatus::Failed).unwrap();
        assert_eq!(t.status(), TaskStatus::Failed);
    }

    #[test]
    fn terminal_records_reject_every_transition() {
        let mut t = task();
        t.transition(TaskStatus::Failed).unwrap();
        for next in [
            TaskStatus::Created,
            TaskStatus::Bidding,
            TaskStatus::Assigned,
            TaskStatus::EnRoutePickup,
            TaskStatus::EnRouteDelivery,
            TaskStatus::Delivered,
            TaskStatus::Failed,
        ] {
            assert!(t.transition(next).is_err());
        }
    }

    #[test]
    fn assignment_requires_an_open_auction() {
        let mut t = task();
        assert!(t.assign(WorkerId(1)).is_err());
        assert_eq!(t.assignee(), None);
    }
}
