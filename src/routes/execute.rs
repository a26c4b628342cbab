use actix_web::{HttpResponse, Responder, post, web};
use serde::Serialize;

use super::ErrorResponseWithMessage;
use crate::error::ValidationError;
use crate::executor::{ExecutionRequest, ExecutionResult, Executor, Outcome};

#[derive(Serialize, Debug)]
pub struct ExecuteResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub time: u64, // wall-clock time in microseconds
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        let outcome = result.outcome.kind();
        let (output, diagnostics, exit_code) = match result.outcome {
            Outcome::Success { output } => (Some(output), None, None),
            Outcome::CompileOrRuntimeError {
                diagnostics,
                exit_code,
            } => (None, Some(diagnostics), exit_code),
            Outcome::Timeout => (None, Some("time limit exceeded".to_string()), None),
            Outcome::InternalError { diagnostics } => (None, Some(diagnostics), None),
        };

        Self {
            outcome,
            output,
            diagnostics,
            exit_code,
            execution_id: result.execution_id,
            time: u64::try_from(result.elapsed.as_micros()).unwrap_or(u64::MAX),
        }
    }
}

#[post("/execute")]
pub async fn execute_handler(
    executor: web::Data<Executor>,
    body: web::Json<ExecutionRequest>,
) -> impl Responder {
    match executor.execute(&body).await {
        Ok(result) => HttpResponse::Ok().json(ExecuteResponse::from(result)),
        Err(e @ ValidationError::UnknownLanguage(_)) => {
            HttpResponse::NotFound().json(ErrorResponseWithMessage {
                reason: "ERR_NOT_FOUND",
                code: 3,
                message: e.to_string(),
            })
        }
        Err(e) => {
            log::debug!("Rejected execution request: {e}");
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: e.to_string(),
            })
        }
    }
}
