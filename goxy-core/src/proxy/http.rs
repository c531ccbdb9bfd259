//! Accepts HTTP, reads and caches the request body, runs filters on the
//! request entity, forwards to target, runs filters on the response
//! entity, streams back.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::{ServiceConfig, TlsConfig};
use crate::context::ProxyContext;
use crate::entity::{Entity, HttpRequestEntity, HttpResponseEntity};
use crate::error::CoreError;
use crate::export::{Exporter, Packet};
use crate::filter::{run_chain, ChainOutcome, Filter};

use super::stream::StreamBinder;
use super::{apply_filter_state, filter_descriptions, split_addr_safe, FilterDescription, ListeningFlag, Proxy, ProxyState};

struct HttpProxyInner {
    config: ServiceConfig,
    filters: Arc<Vec<Filter>>,
    listening: ListeningFlag,
    state: StdMutex<ProxyState>,
    exporter: Arc<dyn Exporter>,
    stream_binder: StreamBinder,
    client: reqwest::Client,
    accept_task: TokioMutex<Option<JoinHandle<()>>>,
    inflight: AtomicUsize,
    tls_acceptor: Option<TlsAcceptor>,
}

#[derive(Clone)]
pub struct HttpProxy(Arc<HttpProxyInner>);

impl HttpProxy {
    pub fn new(config: ServiceConfig, filters: Vec<Filter>, exporter: Arc<dyn Exporter>) -> Result<Self, CoreError> {
        let client = build_upstream_client(config.request_timeout)?;
        let tls_acceptor = match &config.tls {
            Some(tls) => Some(build_tls_acceptor(tls)?),
            None => None,
        };
        Ok(HttpProxy(Arc::new(HttpProxyInner {
            config,
            filters: Arc::new(filters),
            listening: ListeningFlag::new(),
            state: StdMutex::new(ProxyState::New),
            exporter,
            stream_binder: StreamBinder::new(),
            client,
            accept_task: TokioMutex::new(None),
            inflight: AtomicUsize::new(0),
            tls_acceptor,
        })))
    }
}

fn build_upstream_client(timeout_secs: u64) -> Result<reqwest::Client, CoreError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| CoreError::InvalidConfig(format!("failed to build upstream client: {e}")))
}

fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, CoreError> {
    let cert_bytes = std::fs::read(&tls.cert)?;
    let key_bytes = std::fs::read(&tls.key)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::InvalidConfig(format!("bad TLS cert: {e}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| CoreError::InvalidConfig(format!("bad TLS key: {e}")))?
        .ok_or_else(|| CoreError::InvalidConfig("no private key found".to_string()))?;

    let server_config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CoreError::InvalidConfig(format!("bad TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

impl HttpProxyInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.serve_connection(stream, remote_addr).await;
                    });
                }
                Err(e) => {
                    log::error!("[HTTP|{}] accept error: {}", self.config.name, e);
                    break;
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let service = hyper::service::service_fn(move |req: Request<Incoming>| {
            let this = self.clone();
            async move { this.handle_request(req, remote_addr).await }
        });

        let builder = auto::Builder::new(hyper_util::rt::TokioExecutor::new());

        if let Some(acceptor) = self.tls_acceptor.clone() {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    if let Err(e) = builder.serve_connection(TokioIo::new(tls_stream), service).await {
                        log::debug!("[HTTP|{}] connection error: {}", self.config.name, e);
                    }
                }
                Err(e) => log::error!("[HTTP|{}] TLS handshake failed: {}", self.config.name, e),
            }
        } else if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
            log::debug!("[HTTP|{}] connection error: {}", self.config.name, e);
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if !self.listening.get() {
            return Ok(no_content());
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self.handle_request_inner(req, remote_addr).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        Ok(result.unwrap_or_else(|e| {
            log::error!("[HTTP|{}] internal error: {}", self.config.name, e);
            internal_error()
        }))
    }

    async fn handle_request_inner(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, CoreError> {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let query = req
            .uri()
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();

        let mut headers: Vec<(String, String)> = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();

        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
            let host = req
                .uri()
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.config.target.clone());
            headers.push(("Host".to_string(), host));
        }

        let body_bytes = req
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();

        let ctx = ProxyContext::new();
        let mut request_entity = Entity::HttpRequest(HttpRequestEntity {
            method: method.clone(),
            path: path.clone(),
            query: query.clone(),
            headers: headers.clone(),
            body: body_bytes.to_vec(),
        });

        let (target_host, target_port) = target_host_port(&self.config.target);
        let base_packet = self.stream_binder.get_or_create(
            &remote_addr.to_string(),
            &self.config.name,
            &target_host,
            target_port,
        );
        self.export_entity(&request_entity, &base_packet, true, false).await;

        match run_chain(&self.filters, &ctx, &mut request_entity)? {
            ChainOutcome::Dropped => return Ok(no_content()),
            ChainOutcome::Forwarded => {}
        }

        let rewritten_body = request_entity.body().unwrap_or_default();

        let mut outbound_headers = reqwest::header::HeaderMap::new();
        for (k, v) in &headers {
            if k.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                outbound_headers.insert(name, value);
            }
        }

        let target_url = format!("{}{}{}", self.config.target, path, query);
        let method_obj = reqwest::Method::from_bytes(method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let upstream_resp = self
            .client
            .request(method_obj, target_url.as_str())
            .headers(outbound_headers)
            .body(rewritten_body)
            .send()
            .await
            .map_err(|e| CoreError::InvalidConfig(format!("upstream request failed: {e}")))?;

        let status = upstream_resp.status().as_u16();
        let resp_headers: Vec<(String, String)> = upstream_resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let resp_body = upstream_resp
            .bytes()
            .await
            .map_err(|e| CoreError::InvalidConfig(format!("upstream body read failed: {e}")))?;

        let mut response_entity = Entity::HttpResponse(HttpResponseEntity {
            status,
            headers: resp_headers.clone(),
            body: resp_body.to_vec(),
        });
        self.export_entity(&response_entity, &base_packet, false, true).await;

        match run_chain(&self.filters, &ctx, &mut response_entity)? {
            ChainOutcome::Dropped => return Ok(no_content()),
            ChainOutcome::Forwarded => {}
        }

        let out_body = response_entity.body().unwrap_or_default();
        let mut builder = Response::builder().status(
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        );
        for (k, v) in &resp_headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        Ok(builder.body(Full::new(Bytes::from(out_body))).unwrap_or_else(|_| internal_error()))
    }

    async fn export_entity(&self, entity: &Entity, base: &crate::export::BasePacket, inbound: bool, reversed: bool) {
        let packet = Packet {
            base: base.clone(),
            content: entity.raw(),
            captured_at: chrono::Utc::now(),
            inbound,
            reversed,
        };
        crate::export::send_best_effort(self.exporter.as_ref(), packet).await;
    }
}

fn target_host_port(target: &str) -> (String, u16) {
    let without_scheme = target.splitn(2, "://").nth(1).unwrap_or(target);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    split_addr_safe(host_port)
}

fn no_content() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn internal_error() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Full::new(Bytes::from_static(b"internal error")))
        .unwrap()
}

#[async_trait]
impl Proxy for HttpProxy {
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

        let start = Instant::now();
        while self.0.inflight.load(Ordering::SeqCst) > 0 {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_host_port_strips_scheme() {
        assert_eq!(
            target_host_port("http://10.0.0.1:8080"),
            ("10.0.0.1".to_string(), 8080)
        );
    }
}
