use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;

use super::ErrorResponseWithMessage;
use crate::executor::Executor;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    runner: &'static str,
}

#[get("/health")]
pub async fn health_handler(executor: web::Data<Executor>) -> impl Responder {
    let runner = executor.runner();
    match runner.health_check().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "ok",
            runner: runner.name(),
        }),
        Err(e) => {
            log::warn!("Health check of {} runner failed: {e}", runner.name());
            HttpResponse::ServiceUnavailable().json(ErrorResponseWithMessage {
                reason: "ERR_EXTERNAL",
                code: 5,
                message: e.to_string(),
            })
        }
    }
}
