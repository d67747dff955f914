//! Shared protocol surface between the dispatch coordinator and the worker
//! fleet: identifiers, message kinds and the text wire codec.
//!
//! Content encoding is comma-separated primitives with a stable field order:
//!
//! - CFP / Award: `pickupX,pickupY,deliveryX,deliveryY` (grid coordinates)
//! - Bid: the distance in blocks, as decimal text
//! - Position report: `x,y,STATUS,deliveriesCompleted` (world coordinates)
//! - Refusal / Rejection / DeliveryConfirmed: empty content
//!
//! Decoding never panics; malformed content surfaces as a [`WireError`] that
//! receivers handle locally (discard and log) without aborting the
//! surrounding auction or movement.

use std::fmt;

use citygrid::Intersection;
use thiserror::Error;
use uuid::Uuid;

/// Capability string under which delivery workers register in the directory.
pub const DELIVERY_CAPABILITY: &str = "package-delivery";

/// Identity of one worker unit. Dense ids, issued at fleet bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Identity of one delivery task; also the auction conversation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The performative of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    CallForProposals,
    Bid,
    Refusal,
    Award,
    Rejection,
    DeliveryConfirmed,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::CallForProposals => "call-for-proposals",
            MessageKind::Bid => "bid",
            MessageKind::Refusal => "refusal",
            MessageKind::Award => "award",
            MessageKind::Rejection => "rejection",
            MessageKind::DeliveryConfirmed => "delivery-confirmed",
        };
        f.write_str(s)
    }
}

/// Decode failure for wire content.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("field {field} is not a valid integer: {value:?}")]
    Integer { field: &'static str, value: String },
    #[error("unknown vehicle status {0:?}")]
    Status(String),
}

fn parse_int(field: &'static str, raw: &str) -> Result<i64, WireError> {
    raw.trim().parse().map_err(|_| WireError::Integer {
        field,
        value: raw.to_owned(),
    })
}

fn split_fields(content: &str, expected: usize) -> Result<Vec<&str>, WireError> {
    let fields: Vec<&str> = content.split(',').collect();
    if fields.len() != expected {
        return Err(WireError::FieldCount {
            expected,
            got: fields.len(),
        });
    }
    Ok(fields)
}

/// Pickup and delivery of one task; the content of both CFP and Award.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePayload {
    pub pickup: Intersection,
    pub delivery: Intersection,
}

impl RoutePayload {
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{}",
            self.pickup.grid_x(),
            self.pickup.grid_y(),
            self.delivery.grid_x(),
            self.delivery.grid_y()
        )
    }

    pub fn decode(content: &str) -> Result<Self, WireError> {
        let f = split_fields(content, 4)?;
        Ok(Self {
            pickup: Intersection::new(
                parse_int("pickupX", f[0])? as i32,
                parse_int("pickupY", f[1])? as i32,
            ),
            delivery: Intersection::new(
                parse_int("deliveryX", f[2])? as i32,
                parse_int("deliveryY", f[3])? as i32,
            ),
        })
    }
}

/// A worker's offer for one task: its street distance to the pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BidPayload {
    pub distance: u32,
}

impl BidPayload {
    pub fn encode(&self) -> String {
        self.distance.to_string()
    }

    pub fn decode(content: &str) -> Result<Self, WireError> {
        let value = parse_int("distance", content)?;
        if !(0..=i64::from(u32::MAX)).contains(&value) {
            return Err(WireError::Integer {
                field: "distance",
                value: content.to_owned(),
            });
        }
        Ok(Self {
            distance: value as u32,
        })
    }
}

/// Externally visible availability of a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleStatus {
    Available,
    OnDuty,
}

impl VehicleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VehicleStatus::Available => "AVAILABLE",
            VehicleStatus::OnDuty => "ON_DUTY",
        }
    }

    fn parse(raw: &str) -> Result<Self, WireError> {
        match raw.trim() {
            "AVAILABLE" => Ok(VehicleStatus::Available),
            "ON_DUTY" => Ok(VehicleStatus::OnDuty),
            other => Err(WireError::Status(other.to_owned())),
        }
    }
}

impl fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One vehicle position update as it crosses the transport to external
/// consumers: `x,y,STATUS,deliveriesCompleted`, world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionReport {
    pub world_x: i32,
    pub world_y: i32,
    pub status: VehicleStatus,
    pub deliveries_completed: u64,
}

impl PositionReport {
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{}",
            self.world_x, self.world_y, self.status, self.deliveries_completed
        )
    }

    pub fn decode(content: &str) -> Result<Self, WireError> {
        let f = split_fields(content, 4)?;
        let deliveries = parse_int("deliveriesCompleted", f[3])?;
        if deliveries < 0 {
            return Err(WireError::Integer {
                field: "deliveriesCompleted",
                value: f[3].to_owned(),
            });
        }
        Ok(Self {
            world_x: parse_int("x", f[0])? as i32,
            world_y: parse_int("y", f[1])? as i32,
            status: VehicleStatus::parse(f[2])?,
            deliveries_completed: deliveries as u64,
        })
    }

    /// The grid corner this report refers to.
    pub fn position(&self) -> Intersection {
        citygrid::snap_to_grid(self.world_x, self.world_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_round_trips() {
        let route = RoutePayload {
            pickup: Intersection::new(1, 2),
            delivery: Intersection::new(8, 9),
        };
        let encoded = route.encode();
        assert_eq!(encoded, "1,2,8,9");
        assert_eq!(RoutePayload::decode(&encoded).unwrap(), route);
    }

    #[test]
    fn route_accepts_whitespace_around_fields() {
        let route = RoutePayload::decode(" 3 ,4, 5 ,6").unwrap();
        assert_eq!(route.pickup, Intersection::new(3, 4));
        assert_eq!(route.delivery, Intersection::new(5, 6));
    }

    #[test]
    fn route_rejects_wrong_arity_and_garbage() {
        assert!(matches!(
            RoutePayload::decode("1,2,3"),
            Err(WireError::FieldCount { expected: 4, got: 3 })
        ));
        assert!(matches!(
            RoutePayload::decode("1,2,three,4"),
            Err(WireError::Integer { field: "deliveryX", .. })
        ));
    }

    #[test]
    fn bid_round_trips_and_rejects_negatives() {
        let bid = BidPayload { distance: 17 };
        assert_eq!(bid.encode(), "17");
        assert_eq!(BidPayload::decode("17").unwrap(), bid);
        assert_eq!(BidPayload::decode(" 0 ").unwrap().distance, 0);
        assert!(BidPayload::decode("-4").is_err());
        assert!(BidPayload::decode("fast").is_err());
    }

    #[test]
    fn position_report_round_trips() {
        let report = PositionReport {
            world_x: 60,
            world_y: 140,
            status: VehicleStatus::OnDuty,
            deliveries_completed: 3,
        };
        let encoded = report.encode();
        assert_eq!(encoded, "60,140,ON_DUTY,3");
        let decoded = PositionReport::decode(&encoded).unwrap();
        assert_eq!(decoded, report);
        assert_eq!(decoded.position(), Intersection::new(3, 7));
    }

    #[test]
    fn position_report_rejects_unknown_status() {
        assert!(matches!(
            PositionReport::decode("0,0,PARKED,0"),
            Err(WireError::Status(_))
        ));
    }
}
