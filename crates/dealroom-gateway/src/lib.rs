//! Real-time side of the messaging core: the in-process channel transport,
//! the fan-out dispatcher that publishes onto it, and the WebSocket gateway
//! that lets clients subscribe to channels.

pub mod connection;
pub mod dispatcher;
pub mod fanout;

pub use dispatcher::Dispatcher;
pub use fanout::{Fanout, Publisher};
