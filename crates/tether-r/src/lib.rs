pub mod http;
pub mod server;

pub use http::{AppState, CALLER_HEADER, SESSION_HEADER, build_app, serve};
pub use server::{ObserverServer, ServerHandle};
