use std::io;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, error::BlockingError, guard, http::Method, web};

use crate::error::GatewayError;
use crate::gateway::Gateway;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
        }
    }

    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/pins")
                    .route(web::get().to(list_pins))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/pins/{endpoint}")
                    .route(web::get().to(get_value))
                    .route(web::put().to(set_value))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET, Method::PUT]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn list_pins(state: web::Data<AppState>) -> Result<impl Responder, GatewayError> {
    let gateway = Arc::clone(&state.gateway);
    let pins = web::block(move || gateway.snapshot())
        .await
        .map_err(blocking)?;

    Ok(web::Json(pins))
}

async fn get_value(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, GatewayError> {
    let endpoint = parse_endpoint(&req)?;
    let gateway = Arc::clone(&state.gateway);

    let value = web::block(move || gateway.read(&endpoint))
        .await
        .map_err(blocking)??;

    Ok(HttpResponse::Ok().content_type("text/plain").body(value))
}

async fn set_value(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, GatewayError> {
    let endpoint = parse_endpoint(&req)?;
    let value = parse_value_payload(&body)?;
    let gateway = Arc::clone(&state.gateway);

    web::block(move || gateway.write(&endpoint, &value))
        .await
        .map_err(blocking)??;

    Ok(HttpResponse::Ok())
}

/// Any UTF-8 body is a level; an empty one reads as high.
fn parse_value_payload(body: &[u8]) -> Result<String, GatewayError> {
    std::str::from_utf8(body)
        .map(|text| text.trim().to_string())
        .map_err(|_| GatewayError::InvalidValue("Value payload must be valid UTF-8".into()))
}

fn parse_endpoint(req: &HttpRequest) -> Result<String, GatewayError> {
    req.match_info()
        .get("endpoint")
        .map(str::to_string)
        .ok_or_else(|| GatewayError::InvalidValue("Missing endpoint".into()))
}

fn blocking(e: BlockingError) -> GatewayError {
    GatewayError::protocol("blocking pool", io::Error::other(e.to_string()))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
