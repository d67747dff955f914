//! The worker unit: one actor per vehicle.
//!
//! A worker alternates between patrol (random wandering) and commitment
//! (servicing exactly one task), and is always in motion. All of its state
//! lives inside one task with one select loop, so message handling and
//! movement interleave without ever racing: the loop is the single owner of
//! the position, and the active `MovementPlan` is the single owner of where
//! the position goes next. Accepting an award replaces the plan, which is
//! what cancels patrol — there is no second timer left to fire a stale step.

use std::sync::Arc;
use std::time::Duration;

use api::{BidPayload, MessageKind, RoutePayload, VehicleStatus, WorkerId};
use citygrid::Intersection;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::metrics::Metrics;
use crate::net::{AuctionReply, Envelope, WorkerRef};
use crate::store::{FleetStateStore, TaskView};
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: WorkerId,
    pub start: Intersection,
    /// Time to traverse one block.
    pub step_interval: Duration,
}

/// What the current movement is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Patrol,
    ToPickup,
    ToDelivery,
}

/// An in-progress leg along a precomputed street path. `next` indexes the
/// waypoint the following tick will step onto.
struct MovementPlan {
    phase: Phase,
    path: Vec<Intersection>,
    next: usize,
}

pub struct WorkerUnit {
    id: WorkerId,
    position: Intersection,
    active: Option<Task>,
    deliveries_completed: u64,
    plan: MovementPlan,
    owner: mpsc::UnboundedSender<Envelope>,
    store: Arc<FleetStateStore>,
    metrics: Arc<Metrics>,
    rng: StdRng,
}

impl WorkerUnit {
    /// Spawns the worker actor and returns its mailbox handle plus the join
    /// handle of the underlying task.
    pub fn spawn(
        config: WorkerConfig,
        owner: mpsc::UnboundedSender<Envelope>,
        store: Arc<FleetStateStore>,
        metrics: Arc<Metrics>,
        rng: StdRng,
        shutdown: watch::Receiver<()>,
    ) -> (WorkerRef, JoinHandle<()>) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let handle = WorkerRef::new(config.id, tx);
        let step_interval = config.step_interval;
        let unit = WorkerUnit::new(config, owner, store, metrics, rng);
        let join = tokio::spawn(unit.run(step_interval, inbox, shutdown));
        (handle, join)
    }

    fn new(
        config: WorkerConfig,
        owner: mpsc::UnboundedSender<Envelope>,
        store: Arc<FleetStateStore>,
        metrics: Arc<Metrics>,
        rng: StdRng,
    ) -> Self {
        let mut unit = Self {
            id: config.id,
            position: config.start,
            active: None,
            deliveries_completed: 0,
            plan: MovementPlan {
                phase: Phase::Patrol,
                path: vec![config.start],
                next: 1,
            },
            owner,
            store,
            metrics,
            rng,
        };
        unit.plan = unit.patrol_plan();
        unit
    }

    async fn run(
        mut self,
        step_interval: Duration,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: watch::Receiver<()>,
    ) {
        tracing::info!(worker = %self.id, start = %self.position, "Worker on patrol");
        self.report_position();

        let mut ticker = interval(step_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately; consume it so
        // steps run at the configured tempo from the start.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(envelope) = inbox.recv() => self.handle_message(envelope),
                _ = ticker.tick() => self.step(),
            }
        }

        tracing::info!(
            worker = %self.id,
            deliveries = self.deliveries_completed,
            "Worker shutting down"
        );
    }

    fn available(&self) -> bool {
        self.active.is_none()
    }

    fn handle_message(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::CallForProposals => self.handle_cfp(envelope),
            MessageKind::Award => self.handle_award(envelope),
            // Lost the auction; nothing changes.
            MessageKind::Rejection => {}
            other => {
                tracing::debug!(worker = %self.id, kind = %other, "Ignoring unexpected message");
            }
        }
    }

    /// Answering a CFP is a pure read of availability plus the street
    /// distance to the pickup; worker state is untouched and nothing blocks.
    fn handle_cfp(&mut self, envelope: Envelope) {
        let Some(reply) = envelope.reply else {
            tracing::warn!(
                worker = %self.id,
                task = %envelope.conversation,
                "CFP carried no reply queue; discarding"
            );
            return;
        };

        let (kind, content) = if self.available() {
            match RoutePayload::decode(&envelope.content) {
                Ok(route) => {
                    let distance = citygrid::manhattan(self.position, route.pickup);
                    (MessageKind::Bid, BidPayload { distance }.encode())
                }
                Err(err) => {
                    self.metrics.malformed_messages_total.inc();
                    tracing::warn!(
                        worker = %self.id,
                        task = %envelope.conversation,
                        error = %err,
                        "Discarding malformed CFP"
                    );
                    return;
                }
            }
        } else {
            (MessageKind::Refusal, String::new())
        };

        // A dead reply queue means the auction round is already over; late
        // answers are dropped there by design of the round, not retried.
        let _ = reply.send(AuctionReply {
            worker: self.id,
            kind,
            content,
        });
    }

    fn handle_award(&mut self, envelope: Envelope) {
        let route = match RoutePayload::decode(&envelope.content) {
            Ok(route) => route,
            Err(err) => {
                self.metrics.malformed_messages_total.inc();
                tracing::warn!(
                    worker = %self.id,
                    task = %envelope.conversation,
                    error = %err,
                    "Discarding malformed award"
                );
                return;
            }
        };

        if let Some(current) = &self.active {
            // One task at a time; an award that races an existing commitment
            // is dropped rather than queued.
            tracing::warn!(
                worker = %self.id,
                task = %envelope.conversation,
                current = %current.id,
                "Award received while committed; dropping"
            );
            return;
        }

        let mut task = Task::from_award(envelope.conversation, route.pickup, route.delivery, self.id);
        if let Err(err) = task.transition(TaskStatus::EnRoutePickup) {
            tracing::error!(worker = %self.id, error = %err, "Task record out of step");
        }

        tracing::info!(
            worker = %self.id,
            task = %task.id,
            pickup = %route.pickup,
            delivery = %route.delivery,
            "Committed to task"
        );

        // Swapping the plan is the patrol cancellation: the old path is gone
        // before any further tick can read it, so the position stays put
        // until the first task-movement step.
        self.plan = MovementPlan {
            phase: Phase::ToPickup,
            path: citygrid::path(self.position, route.pickup),
            next: 1,
        };
        self.active = Some(task);
        self.update_parcel_view();
        self.report_position();

        if self.plan.next >= self.plan.path.len() {
            // Already standing on the pickup corner.
            self.begin_delivery_leg();
        }
    }

    /// Advances one block along the active plan; on finishing a leg, chains
    /// pickup into delivery (no idle gap) or picks the next patrol target.
    fn step(&mut self) {
        if self.plan.next < self.plan.path.len() {
            self.position = self.plan.path[self.plan.next];
            self.plan.next += 1;
            self.report_position();
            if self.plan.phase == Phase::ToDelivery {
                self.update_parcel_view();
            }
            if self.plan.next < self.plan.path.len() {
                return;
            }
        }

        match self.plan.phase {
            Phase::Patrol => self.plan = self.patrol_plan(),
            Phase::ToPickup => self.begin_delivery_leg(),
            Phase::ToDelivery => self.finish_delivery(),
        }
    }

    fn begin_delivery_leg(&mut self) {
        let (task_id, delivery) = match self.active.as_mut() {
            Some(task) => {
                if let Err(err) = task.transition(TaskStatus::EnRouteDelivery) {
                    tracing::error!(worker = %self.id, error = %err, "Task record out of step");
                }
                (task.id, task.delivery)
            }
            None => {
                tracing::error!(worker = %self.id, "Pickup leg finished with no active task");
                self.plan = self.patrol_plan();
                return;
            }
        };

        tracing::info!(
            worker = %self.id,
            task = %task_id,
            at = %self.position,
            "Parcel picked up; heading to delivery"
        );
        self.plan = MovementPlan {
            phase: Phase::ToDelivery,
            path: citygrid::path(self.position, delivery),
            next: 1,
        };
        self.update_parcel_view();
    }

    fn finish_delivery(&mut self) {
        let Some(mut task) = self.active.take() else {
            self.plan = self.patrol_plan();
            return;
        };
        if let Err(err) = task.transition(TaskStatus::Delivered) {
            tracing::error!(worker = %self.id, task = %task.id, error = %err, "Task record out of step");
        }

        self.deliveries_completed += 1;
        self.metrics.deliveries_completed_total.inc();
        tracing::info!(
            worker = %self.id,
            task = %task.id,
            deliveries = self.deliveries_completed,
            "Parcel delivered"
        );

        let confirmation = Envelope {
            kind: MessageKind::DeliveryConfirmed,
            conversation: task.id,
            content: String::new(),
            reply: None,
        };
        if self.owner.send(confirmation).is_err() {
            tracing::warn!(
                worker = %self.id,
                task = %task.id,
                "Task owner unreachable; delivery confirmation dropped"
            );
        }

        self.report_position();
        self.plan = self.patrol_plan();
    }

    /// A fresh patrol leg toward a random destination other than here.
    fn patrol_plan(&mut self) -> MovementPlan {
        let mut destination = citygrid::random_intersection(&mut self.rng);
        while destination == self.position {
            destination = citygrid::random_intersection(&mut self.rng);
        }
        MovementPlan {
            phase: Phase::Patrol,
            path: citygrid::path(self.position, destination),
            next: 1,
        }
    }

    fn report_position(&self) {
        let status = if self.available() {
            VehicleStatus::Available
        } else {
            VehicleStatus::OnDuty
        };
        let target = self
            .plan
            .path
            .last()
            .copied()
            .filter(|&target| target != self.position);
        self.store.upsert_vehicle(
            self.id,
            self.position,
            target,
            status,
            self.deliveries_completed,
        );
    }

    fn update_parcel_view(&self) {
        if let Some(task) = &self.active {
            let display_position = if task.status() == TaskStatus::EnRouteDelivery {
                self.position
            } else {
                task.pickup
            };
            self.store.upsert_task(
                task.id,
                TaskView {
                    display_position,
                    status: task.status(),
                    pickup: task.pickup,
                    delivery: task.delivery,
                },
            );
        }
    }
}
