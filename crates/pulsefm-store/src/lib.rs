//! DS/KV/TQ/EventBus adapters behind the `traits` boundary. `postgres`/
//! `redis_kv`/`taskqueue`/`http_event_bus` are the production implementations;
//! `mem` is the in-memory fake suite the engine crates test against.

pub mod http_event_bus;
pub mod mem;
pub mod postgres;
pub mod redis_kv;
pub mod taskqueue;
pub mod traits;

pub use http_event_bus::HttpForwardingEventBus;
pub use postgres::PgDatastore;
pub use redis_kv::RedisKvStore;
pub use taskqueue::HttpTaskQueue;
pub use traits::{Datastore, EventBus, KvStore, RotationCommitResult, TaskQueue};
