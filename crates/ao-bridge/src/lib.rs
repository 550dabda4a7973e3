//! Bridge layer: the Axum HTTP surface and its supporting pieces.
//!
//! - [`http_api`] — the REST API, lifecycle actions, and the
//!   `/tasks/:id/logs` SSE event stream, framed directly from
//!   `ao_core::event_hub::EventRecord`
//! - [`auth`] — bearer/API-key authentication middleware
//! - [`api_error`] — the error taxonomy every handler maps into

pub mod api_error;
pub mod auth;
pub mod http_api;
