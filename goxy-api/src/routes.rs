//! The control plane: toggle a proxy's `listening` flag, enable/disable
//! or re-arm a single filter, and read back the current fleet state.

use std::sync::Arc;

use actix_web::{get, put, web, HttpResponse, Responder};
use goxy_core::manager::Manager;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

#[derive(Serialize)]
struct FilterDescriptionBody {
    id: usize,
    proxy_id: usize,
    rule: String,
    verdict: String,
    enabled: bool,
    alert: bool,
}

#[derive(Serialize)]
struct ProxyDescriptionBody {
    id: usize,
    service: String,
    listening: bool,
    filter_descriptions: Vec<FilterDescriptionBody>,
}

#[derive(Serialize)]
struct ProxiesBody {
    proxies: Vec<ProxyDescriptionBody>,
}

#[get("/status/")]
pub async fn status() -> impl Responder {
    HttpResponse::Ok().json(StatusBody { status: "ok" })
}

#[get("/proxies/")]
pub async fn list_proxies(manager: web::Data<Arc<Manager>>) -> impl Responder {
    let proxies = manager
        .dump_proxies()
        .into_iter()
        .map(|p| {
            let proxy_id = p.id;
            ProxyDescriptionBody {
                id: proxy_id,
                service: p.name,
                listening: p.listening,
                filter_descriptions: p
                    .filters
                    .into_iter()
                    .map(|f| FilterDescriptionBody {
                        id: f.id,
                        proxy_id,
                        rule: f.rule,
                        verdict: f.verdict,
                        enabled: f.enabled,
                        alert: f.alert,
                    })
                    .collect(),
            }
        })
        .collect();

    HttpResponse::Ok().json(ProxiesBody { proxies })
}

#[derive(Deserialize)]
pub struct SetListeningBody {
    listening: bool,
}

#[put("/proxies/{id}/listening/")]
pub async fn set_listening(
    manager: web::Data<Arc<Manager>>,
    path: web::Path<usize>,
    body: web::Json<SetListeningBody>,
) -> Result<impl Responder, ApiError> {
    manager.set_proxy_listening(path.into_inner(), body.listening)?;
    Ok(HttpResponse::Ok().json(StatusBody { status: "ok" }))
}

#[derive(Deserialize)]
pub struct SetFilterBody {
    enabled: bool,
    alert: bool,
}

#[put("/proxies/{proxy_id}/filter/{filter_id}/")]
pub async fn set_filter_state(
    manager: web::Data<Arc<Manager>>,
    path: web::Path<(usize, usize)>,
    body: web::Json<SetFilterBody>,
) -> Result<impl Responder, ApiError> {
    let (proxy_id, filter_id) = path.into_inner();
    manager.set_filter_state(proxy_id, filter_id, body.enabled, body.alert)?;
    Ok(HttpResponse::Ok().json(StatusBody { status: "ok" }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .service(status)
            .service(list_proxies)
            .service(set_listening)
            .service(set_filter_state),
    );
}
