//! Auction-and-movement engine for the delivery fleet simulator.
//!
//! The pieces compose as independent actors over message channels: a
//! [`dispatch::Coordinator`] generates tasks and runs sealed-bid auctions,
//! [`worker::WorkerUnit`]s bid on and then physically service tasks on the
//! street grid, and everyone projects their latest state into the
//! [`store::FleetStateStore`] for external readers.

pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod net;
pub mod store;
pub mod task;
pub mod worker;
