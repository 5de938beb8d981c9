//! REST surface of the messaging core: session validation, the initiation
//! guard, and the conversation/message handlers that write to the store and
//! fan out afterwards.

pub mod auth;
pub mod conversations;
pub mod error;
pub mod initiation;
pub mod messages;
pub mod middleware;

pub use error::{ApiError, ApiResult};
