//! Appointment scheduling and slot reservation.
//!
//! The engine owns services, working hours and published availability units,
//! and hands out atomic claims over runs of units. `sync` keeps a client view
//! of one day's slots current; `session` walks one user from date selection to
//! a confirmed booking. `wire` serves everything over the Postgres protocol.

pub mod auth;
pub mod backend;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod reference;
pub mod session;
pub mod sql;
pub mod sync;
pub mod tls;
pub mod wal;
pub mod wire;
