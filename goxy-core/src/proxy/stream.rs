//! Short-lived `client_addr -> (last_seen, base_packet_template)` map,
//! correlating many HTTP requests from one client into a single "stream"
//! for the Export Adapter.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::export::{BasePacket, EndpointData};

const STREAM_TERMINATION_THRESHOLD: Duration = Duration::from_secs(15);

struct Entry {
    last_seen: Instant,
    base_packet: BasePacket,
}

/// Binds client addresses to a synthetic "tcp" stream for HTTP traffic,
/// so the collector can group request-response pairs from one client
/// together the way it already does for real TCP connections.
#[derive(Default)]
pub struct StreamBinder {
    entries: DashMap<String, Entry>,
}

impl StreamBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing binding for `client_addr` if it hasn't expired,
    /// otherwise creates a fresh one (new stream UUID).
    pub fn get_or_create(
        &self,
        client_addr: &str,
        service_name: &str,
        target_host: &str,
        target_port: u16,
    ) -> BasePacket {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(client_addr) {
            if now.duration_since(entry.last_seen) < STREAM_TERMINATION_THRESHOLD {
                entry.last_seen = now;
                return entry.base_packet.clone();
            }
        }

        let (src_host, src_port) = crate::proxy::split_addr_safe(client_addr);
        let base_packet = BasePacket {
            source: format!("goxy-{service_name}"),
            endpoints: EndpointData {
                src_host,
                src_port,
                dst_host: target_host.to_string(),
                dst_port: target_port,
            },
            proto: "tcp".to_string(),
            stream_id: Uuid::new_v4(),
        };
        self.entries.insert(
            client_addr.to_string(),
            Entry {
                last_seen: now,
                base_packet: base_packet.clone(),
            },
        );
        base_packet
    }
}
