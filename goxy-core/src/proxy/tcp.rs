//! Accepts clients, dials the target, splices bytes bidirectionally,
//! invokes the filter chain per chunk per direction.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::context::ProxyContext;
use crate::entity::{Entity, TcpChunk};
use crate::error::CoreError;
use crate::export::{BasePacket, EndpointData, Exporter, Packet};
use crate::filter::{run_chain, ChainOutcome, Filter};
use crate::registry::{ConnHandle, ConnectionRegistry};

use super::{apply_filter_state, filter_descriptions, split_addr_safe, FilterDescription, ListeningFlag, Proxy, ProxyState};

const CHUNK_SIZE: usize = 64 * 1024;

struct TcpProxyInner {
    config: ServiceConfig,
    filters: Arc<Vec<Filter>>,
    listening: ListeningFlag,
    state: StdMutex<ProxyState>,
    registry: ConnectionRegistry,
    exporter: Arc<dyn Exporter>,
    accept_task: TokioMutex<Option<JoinHandle<()>>>,
}

/// Cheap-to-clone handle over the shared proxy state; the `Manager` holds
/// one of these per configured TCP service.
#[derive(Clone)]
pub struct TcpProxy(Arc<TcpProxyInner>);

impl TcpProxy {
    pub fn new(config: ServiceConfig, filters: Vec<Filter>, exporter: Arc<dyn Exporter>) -> Self {
        TcpProxy(Arc::new(TcpProxyInner {
            config,
            filters: Arc::new(filters),
            listening: ListeningFlag::new(),
            state: StdMutex::new(ProxyState::New),
            registry: ConnectionRegistry::new(),
            exporter,
            accept_task: TokioMutex::new(None),
        }))
    }
}

impl TcpProxyInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    if !self.listening.get() {
                        drop(stream);
                        continue;
                    }
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, remote_addr.to_string()).await;
                    });
                }
                Err(e) => {
                    log::error!("[TCP|{}] accept error: {}", self.config.name, e);
                    break;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, client: TcpStream, remote_addr: String) {
        let target = match TcpStream::connect(&self.config.target).await {
            Ok(s) => s,
            Err(e) => {
                log::error!(
                    "[TCP|{}] dial target {} failed: {}",
                    self.config.name, self.config.target, e
                );
                return;
            }
        };

        let id = self.registry.next_id(&remote_addr);
        let ctx = Arc::new(ProxyContext::new());
        let (client_rd, client_wr) = client.into_split();
        let (target_rd, target_wr) = target.into_split();

        let (src_host, src_port) = split_addr_safe(&remote_addr);
        let (dst_host, dst_port) = split_addr_safe(&self.config.target);
        let base = BasePacket {
            source: self.config.name.clone(),
            endpoints: EndpointData {
                src_host,
                src_port,
                dst_host,
                dst_port,
            },
            proto: "tcp".to_string(),
            stream_id: uuid::Uuid::new_v4(),
        };

        let ingress_id = id.clone();
        let ingress_ctx = ctx.clone();
        let ingress_filters = self.filters.clone();
        let ingress_exporter = self.exporter.clone();
        let ingress_base = base.clone();
        let ingress_task: JoinHandle<()> = tokio::spawn(splice(
            ingress_id,
            true,
            ingress_ctx,
            ingress_filters,
            ingress_exporter,
            ingress_base,
            client_rd,
            target_wr,
        ));

        let egress_id = id.clone();
        let egress_ctx = ctx.clone();
        let egress_filters = self.filters.clone();
        let egress_exporter = self.exporter.clone();
        let egress_base = base;
        let egress_task: JoinHandle<()> = tokio::spawn(splice(
            egress_id,
            false,
            egress_ctx,
            egress_filters,
            egress_exporter,
            egress_base,
            target_rd,
            client_wr,
        ));

        self.registry.insert(
            id.clone(),
            ConnHandle {
                ingress: ingress_task.abort_handle(),
                egress: egress_task.abort_handle(),
            },
        );

        let ingress_abort = ingress_task.abort_handle();
        let egress_abort = egress_task.abort_handle();
        tokio::select! {
            _ = ingress_task => { egress_abort.abort(); }
            _ = egress_task => { ingress_abort.abort(); }
        }
        self.registry.remove(&id);
    }
}

/// One direction's read-filter-write loop. Reads into a 64 KiB buffer,
/// hands the chunk to the exporter, passes the slice through the filter
/// chain, and — if not dropped — writes it to the opposite peer. EOF and
/// short writes both terminate the loop normally.
async fn splice(
    id: String,
    ingress: bool,
    ctx: Arc<ProxyContext>,
    filters: Arc<Vec<Filter>>,
    exporter: Arc<dyn Exporter>,
    base: BasePacket,
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => {
                log::debug!("[TCP|{id}] EOF ingress={ingress}");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("[TCP|{id}] read error ingress={ingress}: {e}");
                break;
            }
        };

        let mut entity = Entity::TcpChunk(TcpChunk {
            data: buf[..n].to_vec(),
            ingress,
        });

        export_chunk(exporter.as_ref(), &base, &entity, ingress).await;

        match run_chain(&filters, &ctx, &mut entity) {
            Ok(ChainOutcome::Dropped) => {
                log::info!("[TCP|{id}] dropped by filter chain ingress={ingress}");
                break;
            }
            Ok(ChainOutcome::Forwarded) => {
                let out = entity.body().unwrap_or_else(|_| buf[..n].to_vec());
                if let Err(e) = wr.write_all(&out).await {
                    log::error!("[TCP|{id}] write error ingress={ingress}: {e}");
                    break;
                }
            }
            Err(e) => {
                log::error!("[TCP|{id}] filter chain error ingress={ingress}: {e}");
                break;
            }
        }
    }
    let _ = wr.shutdown().await;
}

/// `inbound`/`reversed` mirror the HTTP proxy's `export_entity`: a chunk
/// travelling client->target is the inbound, non-reversed half; target->
/// client is the outbound half described from the reversed endpoint pair.
async fn export_chunk(exporter: &dyn Exporter, base: &BasePacket, entity: &Entity, ingress: bool) {
    let packet = Packet {
        base: base.clone(),
        content: entity.raw(),
        captured_at: chrono::Utc::now(),
        inbound: ingress,
        reversed: !ingress,
    };
    crate::export::send_best_effort(exporter, packet).await;
}

#[async_trait]
impl Proxy for TcpProxy {
    async fn start(&self) -> Result<(), CoreError> {
        let listener = TcpListener::bind(&self.0.config.listen).await?;
        self.0.listening.set(true);
        *self.0.state.lock().unwrap() = ProxyState::Listening;
        let inner = self.0.clone();
        let handle = tokio::spawn(async move {
            inner.accept_loop(listener).await;
        });
        *self.0.accept_task.lock().await = Some(handle);
        Ok(())
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), CoreError> {
        *self.0.state.lock().unwrap() = ProxyState::Closing;
        self.0.listening.set(false);

        if let Some(handle) = self.0.accept_task.lock().await.take() {
            handle.abort();
        }

        self.0.registry.close_all();

        let start = Instant::now();
        while !self.0.registry.is_empty() {
            if start.elapsed() >= deadline {
                *self.0.state.lock().unwrap() = ProxyState::Closed;
                return Err(CoreError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        *self.0.state.lock().unwrap() = ProxyState::Closed;
        Ok(())
    }

    fn set_listening(&self, listening: bool) {
        self.0.listening.set(listening);
    }

    fn get_listening(&self) -> bool {
        self.0.listening.get()
    }

    fn set_filter_state(&self, filter_id: usize, enabled: bool, alert: bool) -> Result<(), CoreError> {
        apply_filter_state(&self.0.filters, filter_id, enabled, alert)
    }

    fn get_filters(&self) -> Vec<FilterDescription> {
        filter_descriptions(&self.0.filters)
    }

    fn get_config(&self) -> &ServiceConfig {
        &self.0.config
    }
}
