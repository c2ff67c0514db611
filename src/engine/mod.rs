pub mod governor;
pub mod in_flight;
pub mod jitter;
pub mod tracker;

pub use governor::{Denial, DenialReason, Permit, QuotaWindow, RateGovernor, SharedGovernor};
pub use in_flight::InFlightRegistry;
pub use jitter::TapJitter;
pub use tracker::{Evaluation, FollowBackCheck, FollowBackProbe, ReciprocationTracker};
