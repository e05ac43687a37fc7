//! The `pulsefm-vote` service — the `vote()` half of PollEngine, deployed
//! behind its own horizontally-scaling group because votes vastly outnumber
//! rotations.
//!
//! `vote()` itself (validation + the atomic KV-VOTE script) lives in
//! `pulsefm-poll`; this crate is the thin HTTP shell around it —
//! header/body parsing and status-code mapping only.

mod routes;

pub use routes::{build_router, AppState};
