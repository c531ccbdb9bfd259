//! Fire-and-forget forwarding of captured traffic to an external packet
//! collector. The transport itself (a gRPC client) is out of scope; this
//! module defines the data shapes and the trait the proxy data path calls
//! into, plus a no-op adapter used when export isn't configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One endpoint of a captured flow.
#[derive(Debug, Clone)]
pub struct EndpointData {
    pub src_host: String,
    pub src_port: u16,
    pub dst_host: String,
    pub dst_port: u16,
}

impl EndpointData {
    /// Swaps src and dst, used when re-describing a captured chunk from
    /// the other side's point of view.
    pub fn reversed(&self) -> EndpointData {
        EndpointData {
            src_host: self.dst_host.clone(),
            src_port: self.dst_port,
            dst_host: self.src_host.clone(),
            dst_port: self.src_port,
        }
    }

    pub fn reversed_string(&self) -> String {
        let r = self.reversed();
        format!("{}:{} -> {}:{}", r.src_host, r.src_port, r.dst_host, r.dst_port)
    }
}

/// Metadata common to every packet captured for one service.
#[derive(Debug, Clone)]
pub struct BasePacket {
    pub source: String,
    pub endpoints: EndpointData,
    pub proto: String,
    pub stream_id: Uuid,
}

/// A single captured chunk/Entity, ready to hand to the collector.
#[derive(Debug, Clone)]
pub struct Packet {
    pub base: BasePacket,
    pub content: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    pub inbound: bool,
    pub reversed: bool,
}

impl Packet {
    /// Dumps the endpoint pair, flipped if this packet represents the
    /// reversed (egress) half of a bidirectional flow.
    pub fn dump_endpoints(&self) -> EndpointData {
        if self.reversed {
            self.base.endpoints.reversed()
        } else {
            self.base.endpoints.clone()
        }
    }
}

/// External collaborator interface. `send` is best-effort: implementors
/// must not let a transport failure affect the data path — callers only
/// log a warning on `Err`.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn send(&self, packet: Packet) -> Result<(), String>;
}

/// Used when no export sink is configured; elides all export work.
pub struct NoopExporter;

#[async_trait]
impl Exporter for NoopExporter {
    async fn send(&self, _packet: Packet) -> Result<(), String> {
        Ok(())
    }
}

/// Sends to the configured exporter, swallowing and logging any error so
/// the caller's data path is never affected by export failures.
pub async fn send_best_effort(exporter: &dyn Exporter, packet: Packet) {
    if let Err(err) = exporter.send(packet).await {
        log::warn!("export send failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_swaps_src_and_dst() {
        let e = EndpointData {
            src_host: "1.1.1.1".into(),
            src_port: 1000,
            dst_host: "2.2.2.2".into(),
            dst_port: 2000,
        };
        let r = e.reversed();
        assert_eq!(r.src_host, "2.2.2.2");
        assert_eq!(r.dst_host, "1.1.1.1");
    }

    #[tokio::test]
    async fn noop_exporter_always_succeeds() {
        let exporter = NoopExporter;
        let packet = Packet {
            base: BasePacket {
                source: "goxy-svc".into(),
                endpoints: EndpointData {
                    src_host: "a".into(),
                    src_port: 1,
                    dst_host: "b".into(),
                    dst_port: 2,
                },
                proto: "tcp".into(),
                stream_id: Uuid::new_v4(),
            },
            content: vec![1, 2, 3],
            captured_at: Utc::now(),
            inbound: true,
            reversed: false,
        };
        send_best_effort(&exporter, packet).await;
    }
}
