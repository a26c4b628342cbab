use actix_web::{HttpResponse, Responder, get, web};

use crate::executor::Executor;
use crate::language::LanguageProfile;

#[get("/languages")]
pub async fn languages_handler(executor: web::Data<Executor>) -> impl Responder {
    let profiles = executor.registry().list();
    let profiles: Vec<&LanguageProfile> = profiles.iter().map(|p| p.as_ref()).collect();
    HttpResponse::Ok().json(profiles)
}
