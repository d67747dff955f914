//! Auction behavior driven end to end against real worker actors (and a few
//! hand-held mailboxes where a scripted reply is needed), on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use api::{MessageKind, RoutePayload, TaskId, VehicleStatus, WorkerId, DELIVERY_CAPABILITY};
use citygrid::Intersection;
use fleet_sim::dispatch::{AuctionOutcome, Coordinator, CoordinatorConfig};
use fleet_sim::metrics::Metrics;
use fleet_sim::net::{AuctionReply, Envelope, LocalDirectory, WorkerRef};
use fleet_sim::store::FleetStateStore;
use fleet_sim::task::Task;
use fleet_sim::worker::{WorkerConfig, WorkerUnit};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};

const STEP: Duration = Duration::from_millis(600);
const WINDOW: Duration = Duration::from_secs(3);

struct Fixture {
    store: Arc<FleetStateStore>,
    metrics: Arc<Metrics>,
    directory: Arc<LocalDirectory>,
}

fn fixture() -> Fixture {
    Fixture {
        store: Arc::new(FleetStateStore::new()),
        metrics: Arc::new(Metrics::new()),
        directory: Arc::new(LocalDirectory::new()),
    }
}

impl Fixture {
    fn coordinator(&self) -> Coordinator {
        Coordinator::new(
            CoordinatorConfig {
                // Far enough out that no periodic task interferes with a test.
                task_period: Duration::from_secs(3600),
                auction_window: WINDOW,
            },
            self.directory.clone(),
            self.store.clone(),
            self.metrics.clone(),
            StdRng::seed_from_u64(1),
        )
    }

    fn spawn_worker(
        &self,
        id: u64,
        start: Intersection,
        owner_tx: mpsc::UnboundedSender<Envelope>,
        shutdown_rx: watch::Receiver<()>,
    ) -> WorkerRef {
        let (handle, _join) = WorkerUnit::spawn(
            WorkerConfig {
                id: WorkerId(id),
                start,
                step_interval: STEP,
            },
            owner_tx,
            self.store.clone(),
            self.metrics.clone(),
            StdRng::seed_from_u64(id),
            shutdown_rx,
        );
        handle
    }
}

#[tokio::test(start_paused = true)]
async fn task_fails_immediately_when_no_workers_are_registered() {
    let fx = fixture();
    let mut coordinator = fx.coordinator();

    let task = Task::new(Intersection::new(2, 3), Intersection::new(5, 7));
    let task_id = task.id;
    let outcome = coordinator.run_auction(task).await;

    assert_eq!(outcome, AuctionOutcome::NoWorkers);
    assert!(fx.store.task(task_id).is_none());
    assert_eq!(fx.metrics.tasks_failed_total.get(), 1);
    assert_eq!(fx.metrics.bids_received_total.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn closest_worker_wins_and_delivers() {
    let fx = fixture();
    let (owner_tx, owner_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(());

    let worker_a = fx.spawn_worker(1, Intersection::new(0, 0), owner_tx.clone(), shutdown_rx.clone());
    let worker_b = fx.spawn_worker(2, Intersection::new(10, 10), owner_tx.clone(), shutdown_rx.clone());
    fx.directory.register(DELIVERY_CAPABILITY, worker_a);
    fx.directory.register(DELIVERY_CAPABILITY, worker_b);

    let mut coordinator = fx.coordinator();
    let task = Task::new(Intersection::new(1, 1), Intersection::new(8, 8));
    let task_id = task.id;
    let outcome = coordinator.run_auction(task).await;

    assert_eq!(
        outcome,
        AuctionOutcome::Awarded {
            winner: WorkerId(1),
            bid: 2
        }
    );
    assert_eq!(fx.metrics.bids_received_total.get(), 2);
    assert_eq!(fx.metrics.tasks_assigned_total.get(), 1);
    assert!(fx.store.task(task_id).is_some());

    // Hand the coordinator its loop so it can observe the confirmation, then
    // let the winner drive both legs: 2 blocks to the pickup, 14 onward.
    tokio::spawn(coordinator.run(owner_rx, shutdown_rx.clone()));
    tokio::time::sleep(STEP * 16 + Duration::from_millis(300)).await;

    let view = fx.store.vehicle(WorkerId(1)).unwrap();
    assert_eq!(view.reported_position, Intersection::new(8, 8));
    assert_eq!(view.deliveries_completed, 1);
    assert_eq!(view.status, VehicleStatus::Available);
    assert_eq!(fx.metrics.deliveries_completed_total.get(), 1);
    assert_eq!(fx.metrics.tasks_delivered_total.get(), 1);
    // The terminal task has left the projection.
    assert!(fx.store.task(task_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn committed_worker_refuses_further_proposals() {
    let fx = fixture();
    let (owner_tx, _owner_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(());

    let worker = fx.spawn_worker(1, Intersection::new(0, 0), owner_tx, shutdown_rx);
    fx.directory.register(DELIVERY_CAPABILITY, worker.clone());

    // Commit the worker directly.
    worker
        .send(Envelope {
            kind: MessageKind::Award,
            conversation: TaskId::new(),
            content: RoutePayload {
                pickup: Intersection::new(5, 0),
                delivery: Intersection::new(5, 5),
            }
            .encode(),
            reply: None,
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        fx.store.vehicle(WorkerId(1)).unwrap().status,
        VehicleStatus::OnDuty
    );

    // A concurrent call for proposals must be refused, never bid on.
    let mut coordinator = fx.coordinator();
    let outcome = coordinator
        .run_auction(Task::new(Intersection::new(0, 1), Intersection::new(3, 3)))
        .await;

    assert_eq!(outcome, AuctionOutcome::NoBids);
    assert_eq!(fx.metrics.bids_received_total.get(), 0);
    assert_eq!(fx.metrics.tasks_failed_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_bid_is_dropped_at_the_queue_boundary() {
    let fx = fixture();
    let (slow_tx, mut slow_rx) = mpsc::unbounded_channel();
    fx.directory
        .register(DELIVERY_CAPABILITY, WorkerRef::new(WorkerId(9), slow_tx));

    // A worker that answers two seconds after the window closed.
    let slow = tokio::spawn(async move {
        let envelope = slow_rx.recv().await.expect("expected a CFP");
        tokio::time::sleep(Duration::from_secs(5)).await;
        envelope
            .reply
            .expect("CFP carries a reply queue")
            .send(AuctionReply {
                worker: WorkerId(9),
                kind: MessageKind::Bid,
                content: "3".to_owned(),
            })
    });

    let mut coordinator = fx.coordinator();
    let outcome = coordinator
        .run_auction(Task::new(Intersection::new(0, 0), Intersection::new(4, 4)))
        .await;
    assert_eq!(outcome, AuctionOutcome::NoBids);

    // The round's queue was already gone when the bid finally went out.
    let late_send = slow.await.unwrap();
    assert!(late_send.is_err());
    assert_eq!(fx.metrics.bids_received_total.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_bids_are_discarded_without_aborting_the_round() {
    let fx = fixture();
    let (garbled_tx, mut garbled_rx) = mpsc::unbounded_channel();
    let (honest_tx, mut honest_rx) = mpsc::unbounded_channel();
    fx.directory
        .register(DELIVERY_CAPABILITY, WorkerRef::new(WorkerId(1), garbled_tx));
    fx.directory
        .register(DELIVERY_CAPABILITY, WorkerRef::new(WorkerId(2), honest_tx));

    tokio::spawn(async move {
        let envelope = garbled_rx.recv().await.expect("expected a CFP");
        let _ = envelope.reply.expect("reply queue").send(AuctionReply {
            worker: WorkerId(1),
            kind: MessageKind::Bid,
            content: "over there".to_owned(),
        });
    });
    let honest = tokio::spawn(async move {
        let envelope = honest_rx.recv().await.expect("expected a CFP");
        let _ = envelope.reply.expect("reply queue").send(AuctionReply {
            worker: WorkerId(2),
            kind: MessageKind::Bid,
            content: "7".to_owned(),
        });
        let award = honest_rx.recv().await.expect("expected the award");
        assert_eq!(award.kind, MessageKind::Award);
    });

    let mut coordinator = fx.coordinator();
    let outcome = coordinator
        .run_auction(Task::new(Intersection::new(0, 0), Intersection::new(6, 2)))
        .await;

    assert_eq!(
        outcome,
        AuctionOutcome::Awarded {
            winner: WorkerId(2),
            bid: 7
        }
    );
    assert_eq!(fx.metrics.malformed_messages_total.get(), 1);
    assert_eq!(fx.metrics.bids_received_total.get(), 1);
    honest.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn tied_bids_go_to_the_first_reply_collected() {
    let fx = fixture();
    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    fx.directory
        .register(DELIVERY_CAPABILITY, WorkerRef::new(WorkerId(1), a_tx));
    fx.directory
        .register(DELIVERY_CAPABILITY, WorkerRef::new(WorkerId(2), b_tx));

    // Both bid 4, but worker 2's reply reaches the queue first.
    let script = tokio::spawn(async move {
        let cfp_a = a_rx.recv().await.expect("expected a CFP");
        let cfp_b = b_rx.recv().await.expect("expected a CFP");
        cfp_b
            .reply
            .expect("reply queue")
            .send(AuctionReply {
                worker: WorkerId(2),
                kind: MessageKind::Bid,
                content: "4".to_owned(),
            })
            .unwrap();
        cfp_a
            .reply
            .expect("reply queue")
            .send(AuctionReply {
                worker: WorkerId(1),
                kind: MessageKind::Bid,
                content: "4".to_owned(),
            })
            .unwrap();
        // Worker 2 keeps its mailbox open for the award, worker 1 for the rejection.
        let award = b_rx.recv().await.expect("expected the award");
        assert_eq!(award.kind, MessageKind::Award);
        let rejection = a_rx.recv().await.expect("expected the rejection");
        assert_eq!(rejection.kind, MessageKind::Rejection);
    });

    let mut coordinator = fx.coordinator();
    let outcome = coordinator
        .run_auction(Task::new(Intersection::new(3, 3), Intersection::new(9, 9)))
        .await;

    assert_eq!(
        outcome,
        AuctionOutcome::Awarded {
            winner: WorkerId(2),
            bid: 4
        }
    );
    script.await.unwrap();
}
