pub mod loader;
pub mod schema;

pub use loader::{ConfigError, ConfigLoader};
pub use schema::{EventsConfig, MutationsConfig, RelayConfig, RelaySettings, ServerConfig};
