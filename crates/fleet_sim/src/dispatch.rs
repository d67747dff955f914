//! The dispatch coordinator: periodic task generation and one sealed-bid
//! auction per task.
//!
//! Each auction round broadcasts a call for proposals to every registered
//! worker, collects replies through a queue that lives exactly as long as
//! the round, and awards the task to the strictly lowest bid. The collection
//! deadline is hard: when the round ends its queue receiver is dropped, so a
//! reply still in flight from a slow worker dies at the queue boundary
//! instead of being filtered after the fact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use api::{BidPayload, MessageKind, RoutePayload, TaskId, WorkerId, DELIVERY_CAPABILITY};
use citygrid::Intersection;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};

use crate::metrics::Metrics;
use crate::net::{Directory, Envelope};
use crate::store::{FleetStateStore, TaskView};
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Period between generated tasks.
    pub task_period: Duration,
    /// Hard deadline for collecting auction replies.
    pub auction_window: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            task_period: Duration::from_millis(4000),
            auction_window: Duration::from_millis(3000),
        }
    }
}

/// How one auction round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionOutcome {
    Awarded { winner: WorkerId, bid: u32 },
    /// Directory lookup failed or returned nobody; no auction was run.
    NoWorkers,
    /// The window elapsed with an empty bid set.
    NoBids,
    /// A winner was chosen but the award could not be delivered.
    AwardUndeliverable,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    directory: Arc<dyn Directory>,
    store: Arc<FleetStateStore>,
    metrics: Arc<Metrics>,
    /// Tasks awarded but not yet confirmed delivered.
    live: HashMap<TaskId, Task>,
    rng: StdRng,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        directory: Arc<dyn Directory>,
        store: Arc<FleetStateStore>,
        metrics: Arc<Metrics>,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            directory,
            store,
            metrics,
            live: HashMap::new(),
            rng,
        }
    }

    /// Runs the generation loop until shutdown: a new task every period,
    /// delivery confirmations handled between rounds.
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: watch::Receiver<()>,
    ) {
        tracing::info!(config = ?self.config, "Coordinator started");

        let mut ticker = interval(self.config.task_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the immediate first tick; the first task comes one full
        // period after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(envelope) = inbox.recv() => self.handle_notification(envelope),
                _ = ticker.tick() => {
                    let task = self.new_task();
                    self.run_auction(task).await;
                }
            }
        }

        tracing::info!(live_tasks = self.live.len(), "Coordinator shutting down");
    }

    /// A task between two distinct random intersections.
    fn new_task(&mut self) -> Task {
        let (pickup, delivery) = random_route(&mut self.rng);
        Task::new(pickup, delivery)
    }

    /// Runs one sealed-bid round: broadcast, bounded collection, award.
    pub async fn run_auction(&mut self, mut task: Task) -> AuctionOutcome {
        self.metrics.tasks_created_total.inc();
        tracing::info!(
            task = %task.id,
            pickup = %task.pickup,
            delivery = %task.delivery,
            blocks = citygrid::manhattan(task.pickup, task.delivery),
            "New task"
        );

        let workers = match self.directory.find_workers_offering(DELIVERY_CAPABILITY) {
            Ok(workers) => workers,
            Err(err) => {
                tracing::error!(task = %task.id, error = %err, "Directory lookup failed; failing task");
                return self.fail_task(task, AuctionOutcome::NoWorkers);
            }
        };
        if workers.is_empty() {
            tracing::warn!(task = %task.id, "No workers registered; failing task");
            return self.fail_task(task, AuctionOutcome::NoWorkers);
        }

        self.store.upsert_task(
            task.id,
            TaskView {
                display_position: task.pickup,
                status: task.status(),
                pickup: task.pickup,
                delivery: task.delivery,
            },
        );

        // One reply queue per round. Dropping the receiver when the round
        // ends is what discards late replies.
        let (reply_tx, mut replies) = mpsc::unbounded_channel();
        let route_content = RoutePayload {
            pickup: task.pickup,
            delivery: task.delivery,
        }
        .encode();

        let mut polled = 0usize;
        for worker in &workers {
            let envelope = Envelope {
                kind: MessageKind::CallForProposals,
                conversation: task.id,
                content: route_content.clone(),
                reply: Some(reply_tx.clone()),
            };
            match worker.send(envelope) {
                Ok(()) => polled += 1,
                Err(err) => {
                    tracing::warn!(task = %task.id, error = %err, "CFP delivery failed for one worker");
                }
            }
        }
        drop(reply_tx);

        if polled == 0 {
            tracing::warn!(task = %task.id, "CFP reached no workers; failing task");
            return self.fail_task(task, AuctionOutcome::NoWorkers);
        }
        if let Err(err) = task.transition(TaskStatus::Bidding) {
            tracing::error!(task = %task.id, error = %err, "Task record out of step");
        }
        tracing::debug!(task = %task.id, polled, "CFP broadcast");

        // Collect until the hard deadline, or until every polled worker has
        // answered, whichever comes first.
        let deadline = Instant::now() + self.config.auction_window;
        let mut bids: Vec<(WorkerId, u32)> = Vec::new();
        let mut answered = 0usize;
        while answered < polled {
            let reply = match timeout_at(deadline, replies.recv()).await {
                Ok(Some(reply)) => reply,
                // Every sender is gone; nothing more can arrive.
                Ok(None) => break,
                // Window elapsed.
                Err(_) => break,
            };
            answered += 1;
            match reply.kind {
                MessageKind::Bid => match BidPayload::decode(&reply.content) {
                    Ok(bid) => {
                        self.metrics.bids_received_total.inc();
                        tracing::debug!(
                            task = %task.id,
                            worker = %reply.worker,
                            distance = bid.distance,
                            "Bid received"
                        );
                        bids.push((reply.worker, bid.distance));
                    }
                    Err(err) => {
                        self.metrics.malformed_messages_total.inc();
                        tracing::warn!(
                            task = %task.id,
                            worker = %reply.worker,
                            error = %err,
                            "Discarding malformed bid"
                        );
                    }
                },
                MessageKind::Refusal => {
                    tracing::debug!(task = %task.id, worker = %reply.worker, "Worker refused");
                }
                other => {
                    self.metrics.malformed_messages_total.inc();
                    tracing::warn!(
                        task = %task.id,
                        worker = %reply.worker,
                        kind = %other,
                        "Discarding unexpected auction reply"
                    );
                }
            }
        }
        drop(replies);

        let Some((winner, best)) = select_winner(&bids) else {
            tracing::warn!(task = %task.id, "No bids before the deadline; failing task");
            return self.fail_task(task, AuctionOutcome::NoBids);
        };

        let Some(winner_ref) = workers.iter().find(|w| w.id == winner) else {
            // Bids only come from polled workers; this cannot happen short of
            // a reply forged onto the round's queue.
            tracing::error!(task = %task.id, winner = %winner, "Winning bidder is not a polled worker");
            return self.fail_task(task, AuctionOutcome::NoBids);
        };
        let award = Envelope {
            kind: MessageKind::Award,
            conversation: task.id,
            content: route_content,
            reply: None,
        };
        if let Err(err) = winner_ref.send(award) {
            tracing::error!(task = %task.id, winner = %winner, error = %err, "Award undeliverable; failing task");
            return self.fail_task(task, AuctionOutcome::AwardUndeliverable);
        }
        for &(bidder, _) in &bids {
            if bidder == winner {
                continue;
            }
            if let Some(worker) = workers.iter().find(|w| w.id == bidder) {
                let rejection = Envelope {
                    kind: MessageKind::Rejection,
                    conversation: task.id,
                    content: String::new(),
                    reply: None,
                };
                if let Err(err) = worker.send(rejection) {
                    tracing::warn!(task = %task.id, worker = %bidder, error = %err, "Rejection delivery failed");
                }
            }
        }

        if let Err(err) = task.assign(winner) {
            tracing::error!(task = %task.id, error = %err, "Task record out of step");
        }
        self.store.upsert_task(
            task.id,
            TaskView {
                display_position: task.pickup,
                status: task.status(),
                pickup: task.pickup,
                delivery: task.delivery,
            },
        );
        self.metrics.tasks_assigned_total.inc();
        tracing::info!(
            task = %task.id,
            winner = %winner,
            bid = best,
            bidders = bids.len(),
            "Task awarded"
        );
        // TODO: reopen tasks whose assignee stops reporting; today a worker
        // lost after award strands its task in the live index forever.
        self.live.insert(task.id, task);
        self.metrics.tasks_live.set(self.live.len() as i64);

        AuctionOutcome::Awarded { winner, bid: best }
    }

    fn fail_task(&mut self, mut task: Task, outcome: AuctionOutcome) -> AuctionOutcome {
        if let Err(err) = task.transition(TaskStatus::Failed) {
            tracing::error!(task = %task.id, error = %err, "Task record out of step");
        }
        self.metrics.tasks_failed_total.inc();
        // The owner-facing failure notification: the view is withdrawn and
        // the terminal record never enters the live index. The next periodic
        // task is an independent attempt, not a retry of this one.
        self.store.remove_task(task.id);
        tracing::warn!(task = %task.id, outcome = ?outcome, "Task failed");
        outcome
    }

    /// The winning worker's own reports drive the record after award; the
    /// coordinator only observes the terminal confirmation.
    fn handle_notification(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::DeliveryConfirmed => {
                match self.live.remove(&envelope.conversation) {
                    Some(task) => {
                        self.metrics.tasks_delivered_total.inc();
                        tracing::info!(
                            task = %task.id,
                            worker = ?task.assignee(),
                            "Delivery confirmed"
                        );
                    }
                    None => {
                        tracing::warn!(
                            task = %envelope.conversation,
                            "Delivery confirmation for unknown task"
                        );
                    }
                }
                self.metrics.tasks_live.set(self.live.len() as i64);
                self.store.remove_task(envelope.conversation);
            }
            other => {
                tracing::warn!(kind = %other, "Unexpected message on coordinator inbox");
            }
        }
    }
}

/// Two distinct random intersections: resample the delivery until it differs
/// from the pickup.
fn random_route<R: Rng>(rng: &mut R) -> (Intersection, Intersection) {
    let pickup = citygrid::random_intersection(rng);
    let mut delivery = citygrid::random_intersection(rng);
    while delivery == pickup {
        delivery = citygrid::random_intersection(rng);
    }
    (pickup, delivery)
}

/// The strictly minimum bid wins; ties keep the first-seen bidder, so
/// collection order is the only tie-break.
fn select_winner(bids: &[(WorkerId, u32)]) -> Option<(WorkerId, u32)> {
    let mut best: Option<(WorkerId, u32)> = None;
    for &(worker, distance) in bids {
        match best {
            Some((_, lowest)) if distance >= lowest => {}
            _ => best = Some((worker, distance)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn winner_is_the_minimum_bid() {
        let bids = vec![(WorkerId(1), 9), (WorkerId(2), 4), (WorkerId(3), 7)];
        assert_eq!(select_winner(&bids), Some((WorkerId(2), 4)));
    }

    #[test]
    fn ties_go_to_the_first_seen_bidder() {
        let bids = vec![(WorkerId(5), 3), (WorkerId(1), 3), (WorkerId(9), 3)];
        assert_eq!(select_winner(&bids), Some((WorkerId(5), 3)));
    }

    #[test]
    fn empty_bid_set_has_no_winner() {
        assert_eq!(select_winner(&[]), None);
    }

    #[test]
    fn generated_routes_are_always_distinct() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let (pickup, delivery) = random_route(&mut rng);
            assert_ne!(pickup, delivery);
        }
    }
}
