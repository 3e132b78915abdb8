//! Stock domain: per-warehouse availability, reservations and the greedy
//! allocator that turns a requested quantity into a reservation plan.

pub mod allocator;
pub mod model;

pub use allocator::{AllocationPlan, Shortfall, allocate};
pub use model::{Reservation, Stock};
