// HTTP routes for /ota and /reboot on top of EspHttpServer

use anyhow::Result;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::Write;
use std::sync::Arc;
use std::thread;

use crate::network::ota_routes::OtaService;
use crate::system::reboot::RebootOrchestrator;

pub fn start_server(
    service: Arc<OtaService>,
    reboot: Arc<RebootOrchestrator>,
) -> Result<EspHttpServer<'static>> {
    let config = Configuration {
        stack_size: 16384,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&config)?;
    register_ota_routes(&mut server, service, reboot)?;
    log::info!("OTA routes registered");
    Ok(server)
}

pub fn register_ota_routes(
    server: &mut EspHttpServer<'static>,
    service: Arc<OtaService>,
    reboot: Arc<RebootOrchestrator>,
) -> Result<()> {
    // GET /ota?task=...
    server.fn_handler("/ota", Method::Get, move |req| {
        let query = req
            .uri()
            .split_once('?')
            .map(|(_, q)| q.to_string())
            .unwrap_or_default();
        let reply = service.handle(&query);

        let mut response = req.into_response(
            reply.status,
            None,
            &[
                ("Content-Type", "text/plain"),
                ("Access-Control-Allow-Origin", "*"),
            ],
        )?;
        response.write_all(reply.body.as_bytes())?;
        Ok(()) as Result<(), Box<dyn std::error::Error>>
    })?;

    // GET /reboot
    server.fn_handler("/reboot", Method::Get, move |req| {
        let mut response = req.into_ok_response()?;
        response.write_all(b"Reboot in progress\n")?;
        drop(response);

        let reboot = reboot.clone();
        let spawned = thread::Builder::new()
            .name("reboot".to_string())
            .stack_size(4096)
            .spawn(move || {
                if let Err(e) = reboot.reboot("web request") {
                    log::error!("Reboot failed: {}", e);
                }
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn reboot task: {}", e);
        }
        Ok(()) as Result<(), Box<dyn std::error::Error>>
    })?;

    Ok(())
}
