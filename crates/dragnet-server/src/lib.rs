//! REST control plane: queue inspection, enqueue, revive, reclaim, and the
//! shared rate limit.

pub mod auth;
pub mod dto;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;
