//! The `pulsefm-stream` service — StreamHub, the largest single component
//! by implementation weight, deployed as its own process.
//!
//! Scales independently of `pulsefm-control`/`pulsefm-vote` because listener
//! count is the component most exposed to a large audience; every connection
//! here is a long-lived SSE stream rather than a request/response round trip.

mod hub;
mod routes;

pub use hub::{compute_deltas, Emission, StreamHubState, StreamTimings, Subscriber};
pub use routes::{build_router, AppState};
