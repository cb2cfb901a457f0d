pub mod buffer;
pub mod config;
pub mod dom;
pub mod events;
pub mod mutations;
pub mod observer;
pub mod recording;
pub mod refs;
pub mod registry;
pub mod relay;
mod session;

pub use relay::{ObserverLink, Relay, Subscription};
pub use tether_common::error;
pub use tether_common::protocol;
