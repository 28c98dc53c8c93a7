//! Core primitives shared by the simulation and the services around it.
//!
//! - [`rng`]: deterministic, serializable random source
//! - [`hash`]: SHA-256 digests and HMAC signing
//! - [`clock`]: injectable time for expiry logic

pub mod clock;
pub mod hash;
pub mod rng;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use rng::{DeterministicRng, RngState};
