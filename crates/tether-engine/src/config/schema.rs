use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub mutations: MutationsConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_observer_port")]
    pub observer_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            observer_port: default_observer_port(),
            http_port: default_http_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_observer_port() -> u16 {
    9001
}

fn default_http_port() -> u16 {
    9002
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_max_poll_items")]
    pub max_poll_items: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            buffer_capacity: default_buffer_capacity(),
            max_poll_items: default_max_poll_items(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl RelaySettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_command_timeout_ms() -> u64 {
    10000
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_max_poll_items() -> usize {
    500
}

fn default_outbound_queue() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationsConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_notable_limit")]
    pub notable_limit: usize,
    #[serde(default = "default_max_pending_batches")]
    pub max_pending_batches: usize,
}

impl Default for MutationsConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            notable_limit: default_notable_limit(),
            max_pending_batches: default_max_pending_batches(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    80
}

fn default_notable_limit() -> usize {
    10
}

fn default_max_pending_batches() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_text_idle_ms")]
    pub text_idle_ms: u64,
    #[serde(default = "default_scroll_idle_ms")]
    pub scroll_idle_ms: u64,
    #[serde(default = "default_pointer_idle_ms")]
    pub pointer_idle_ms: u64,
    #[serde(default = "default_visibility_idle_ms")]
    pub visibility_idle_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            text_idle_ms: default_text_idle_ms(),
            scroll_idle_ms: default_scroll_idle_ms(),
            pointer_idle_ms: default_pointer_idle_ms(),
            visibility_idle_ms: default_visibility_idle_ms(),
        }
    }
}

fn default_text_idle_ms() -> u64 {
    800
}

fn default_scroll_idle_ms() -> u64 {
    150
}

fn default_pointer_idle_ms() -> u64 {
    300
}

fn default_visibility_idle_ms() -> u64 {
    200
}
