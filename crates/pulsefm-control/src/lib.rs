//! The `pulsefm-control` service — RotationEngine plus the open/close half
//! of PollEngine. The engines themselves live in `pulsefm-rotation`/
//! `pulsefm-poll`; this crate is the HTTP shell around them: request
//! parsing, status-code mapping, and the bootstrap CLI.

mod routes;

pub use routes::{build_router, AppState};
