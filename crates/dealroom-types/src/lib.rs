//! Shared model, event, and wire types for the Dealroom messaging core.

pub mod api;
pub mod events;
pub mod models;
