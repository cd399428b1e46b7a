use std::net::SocketAddr;
use std::time::Duration;

use crate::backend::memory::DEFAULT_CHANNEL_CAPACITY;
use crate::reconcile::Dedup;

const DEFAULT_BIND: ([u8; 4], u16) = ([0, 0, 0, 0], 6580);

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub bind_addr: SocketAddr,
    /// Buffer of every change feed and broadcast channel
    pub channel_capacity: usize,
    /// Duplicate handling for results views
    pub dedup: Dedup,
    /// Artificial lag of durable change notifications
    pub change_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(DEFAULT_BIND),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            dedup: Dedup::None,
            change_delay: Duration::ZERO,
        }
    }
}

impl PollConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = env_trimmed("CLASSPOLL_BIND")
            .and_then(|addr| match addr.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!("Ignoring invalid CLASSPOLL_BIND {:?}: {}", addr, e);
                    None
                }
            })
            .unwrap_or(defaults.bind_addr);

        let channel_capacity = env_trimmed("CLASSPOLL_CHANNEL_CAPACITY")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&c| c > 0)
            .unwrap_or(defaults.channel_capacity);

        let dedup = match env_trimmed("CLASSPOLL_DEDUP").as_deref() {
            Some("id") => Dedup::ByAnswerId,
            _ => Dedup::None,
        };

        let change_delay = env_trimmed("CLASSPOLL_CHANGE_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.change_delay);

        Self {
            bind_addr,
            channel_capacity,
            dedup,
            change_delay,
        }
    }
}

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
