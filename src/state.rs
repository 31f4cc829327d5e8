use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ServerConfig;
use crate::core::bridge::BridgeOptions;

/// Why a connection slot was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

/// Shared relay state.
pub struct AppState {
    pub config: ServerConfig,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, u32>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        })
    }

    /// Options for a new client's protocol bridge.
    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            default_voice: self.config.default_voice.clone(),
            transcription_model: self.config.transcription_model.clone(),
            history_limit: self.config.history_limit,
        }
    }

    /// Reserve a connection slot for `ip`.
    ///
    /// Must be paired with [`release_connection`](Self::release_connection).
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        // The per-IP entry lock serializes acquisitions from the same address.
        let mut per_ip = self.ip_connections.entry(ip).or_insert(0);
        if *per_ip >= self.config.max_connections_per_ip {
            drop(per_ip);
            self.forget_idle_ip(ip);
            return Err(ConnectionLimitError::PerIpLimitReached);
        }

        let acquired = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match self.config.max_connections {
                    Some(max) if current >= max => None,
                    _ => Some(current + 1),
                }
            });
        if acquired.is_err() {
            drop(per_ip);
            self.forget_idle_ip(ip);
            return Err(ConnectionLimitError::GlobalLimitReached);
        }

        *per_ip += 1;
        Ok(())
    }

    pub fn release_connection(&self, ip: IpAddr) {
        let _ = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        self.ip_connections
            .remove_if_mut(&ip, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
    }

    fn forget_idle_ip(&self, ip: IpAddr) {
        self.ip_connections.remove_if(&ip, |_, count| *count == 0);
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Acquire)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> u32 {
        self.ip_connections.get(ip).map(|count| *count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_per_ip_limit() {
        let mut config = ServerConfig::default();
        config.max_connections = Some(10);
        config.max_connections_per_ip = 2;
        let state = AppState::new(config);
        let ip: IpAddr = Ipv4Addr::new(192, 168, 1, 100).into();

        assert!(state.try_acquire_connection(ip).is_ok());
        assert!(state.try_acquire_connection(ip).is_ok());
        assert_eq!(
            state.try_acquire_connection(ip),
            Err(ConnectionLimitError::PerIpLimitReached)
        );
        assert_eq!(state.ip_connection_count(&ip), 2);

        state.release_connection(ip);
        assert_eq!(state.ws_connection_count(), 1);
        assert!(state.try_acquire_connection(ip).is_ok());
    }

    #[test]
    fn test_global_limit() {
        let mut config = ServerConfig::default();
        config.max_connections = Some(2);
        config.max_connections_per_ip = 10;
        let state = AppState::new(config);
        let ips: Vec<IpAddr> = (1..=3).map(|i| Ipv4Addr::new(10, 0, 0, i).into()).collect();

        assert!(state.try_acquire_connection(ips[0]).is_ok());
        assert!(state.try_acquire_connection(ips[1]).is_ok());
        assert_eq!(
            state.try_acquire_connection(ips[2]),
            Err(ConnectionLimitError::GlobalLimitReached)
        );
        // A refused global slot does not count against the IP.
        assert_eq!(state.ip_connection_count(&ips[2]), 0);

        state.release_connection(ips[0]);
        assert!(state.try_acquire_connection(ips[2]).is_ok());
    }

    #[test]
    fn test_release_drops_empty_entries() {
        let state = AppState::new(ServerConfig::default());
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        state.try_acquire_connection(ip).unwrap();
        state.release_connection(ip);
        state.release_connection(ip);
        assert_eq!(state.ip_connection_count(&ip), 0);
        assert_eq!(state.ws_connection_count(), 0);
    }
}
