use clap::Parser;

/// `fleet_sim` - an auction-driven delivery fleet simulator.
///
/// One process hosts the dispatch coordinator, the worker fleet and the
/// shared fleet-state projection. Tasks are generated continuously and
/// auctioned to the closest available worker, which then drives the street
/// grid to the pickup and the delivery corner.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Number of delivery workers in the fleet.
    #[arg(long, env = "FLEET_NUM_WORKERS", default_value_t = 5)]
    pub num_workers: u32,

    /// Milliseconds between generated tasks.
    #[arg(long, env = "FLEET_TASK_PERIOD_MS", default_value_t = 4000)]
    pub task_period_ms: u64,

    /// Auction collection window in milliseconds.
    ///
    /// This is a hard deadline: bids landing after it are dropped, even if
    /// they were already in flight.
    #[arg(long, env = "FLEET_AUCTION_WINDOW_MS", default_value_t = 3000)]
    pub auction_window_ms: u64,

    /// Milliseconds a worker needs to traverse one block.
    #[arg(long, env = "FLEET_STEP_INTERVAL_MS", default_value_t = 600)]
    pub step_interval_ms: u64,

    /// Listen address for the Prometheus metrics endpoint.
    #[arg(long, env = "FLEET_METRICS_LISTEN_ADDR", default_value = "0.0.0.0:9100")]
    pub metrics_listen_addr: String,

    /// Seconds between fleet-summary log lines.
    #[arg(long, env = "FLEET_SUMMARY_INTERVAL_S", default_value_t = 10)]
    pub summary_interval_s: u64,

    /// Seed for the simulation RNGs; omit for a different run every time.
    #[arg(long, env = "FLEET_RNG_SEED")]
    pub rng_seed: Option<u64>,
}
