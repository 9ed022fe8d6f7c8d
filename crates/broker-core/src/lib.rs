mod clock;
mod eligibility;
mod engine;
mod error;
mod geo;
mod store;
mod types;

pub use clock::{datetime_from_epoch, parse_datetime, Clock};
pub use eligibility::softban_cleared;
pub use engine::{AccountGrant, Availability, Broker, PickupRequest, SoftbanInfo};
pub use error::{BrokerError, Result};
pub use geo::{cooldown_seconds, distance_meters, Location, DEFAULT_SPEED_M_S, MAX_COOLDOWN_SECS};
pub use store::{DbPool, HistoryUpdate, Store};
pub use types::*;
