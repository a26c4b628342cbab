use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::executor::{Executor, ExecutorSettings};
use crate::routes::{execute_handler, health_handler, json_error_handler, languages_handler};

// Room for field names and escapes around the payloads
const JSON_ENVELOPE_OVERHEAD: usize = 64 * 1024;
const SHUTDOWN_GRACE_SECS: u64 = 5;

pub fn build_server(
    server_config: &ServerConfig,
    executor: web::Data<Executor>,
) -> std::io::Result<Server> {
    let json_limit = json_body_limit(executor.settings());
    let shutdown_timeout =
        executor.settings().max_limits.time_limit.as_duration().as_secs() + SHUTDOWN_GRACE_SECS;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(executor.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(json_limit)
                    .error_handler(json_error_handler),
            )
            .wrap(middleware::Logger::default())
            .service(execute_handler)
            .service(languages_handler)
            .service(health_handler)
    })
    .shutdown_timeout(shutdown_timeout)
    .bind((
        server_config
            .bind_address
            .clone()
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}

/// Largest request body accepted before the executor's own size checks run
pub fn json_body_limit(settings: &ExecutorSettings) -> usize {
    let payload = settings
        .max_source_size
        .as_usize()
        .saturating_add(settings.max_input_size.as_usize());
    payload.saturating_mul(2).saturating_add(JSON_ENVELOPE_OVERHEAD)
}
