use std::time::Duration;

use actix_web::{App, test, web};
use hwgate::{AppState, Gateway, GatewayConfig, Registry};
use serde_json::Value;

fn sample_config() -> GatewayConfig {
    GatewayConfig::from_json(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1",
                "timeout": 30
            },
            "hardware": {
                "fake_tick_ms": null
            },
            "inputs": {
                "door": {
                    "pin": "fakeio-door",
                    "invert": true
                },
                "tamper": {
                    "pin": "fakeio-tamper",
                    "hidden": true
                }
            },
            "outputs": {
                "lamp": {
                    "pin": "fakeio-lamp"
                },
                "strike": {
                    "pin": "fakeio-strike",
                    "pulse": "50ms"
                }
            }
        }
        "#,
    )
    .expect("valid sample config")
}

fn app_state(cfg: &GatewayConfig) -> AppState {
    let registry = Registry::new(cfg.hardware.clone());
    let (gateway, _dispatcher) = Gateway::build(cfg, &registry).expect("gateway builds");
    AppState::new(gateway)
}

#[actix_rt::test]
async fn list_pins_returns_all() {
    let cfg = sample_config();
    let state = app_state(&cfg);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&cfg.http.path)),
    )
    .await;
    let req = test::TestRequest::get().uri("/api/v1/pins").to_request();
    let response: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response.len(), 4);

    let door = response.iter().find(|p| p["endpoint"] == "door").unwrap();
    assert_eq!(door["pin"], "fakeio-door");
    assert_eq!(door["backend"], "fake");
    assert_eq!(door["direction"], "input");
    assert_eq!(door["inverted"], true);
    assert_eq!(door["exported"], true);
    assert_eq!(door["value"], "0");

    let strike = response.iter().find(|p| p["endpoint"] == "strike").unwrap();
    assert_eq!(strike["direction"], "output");
    assert_eq!(strike["pulse"], "50ms");

    let tamper = response.iter().find(|p| p["endpoint"] == "tamper").unwrap();
    assert_eq!(tamper["exported"], false);
}

#[actix_rt::test]
async fn set_and_get_value_happy_path() {
    let cfg = sample_config();
    let state = app_state(&cfg);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&cfg.http.path)),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/api/v1/pins/lamp")
        .set_payload("high")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/api/v1/pins/lamp").to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");

    let req = test::TestRequest::put()
        .uri("/api/v1/pins/lamp")
        .set_payload("false")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/api/v1/pins/lamp").to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "0");
}

#[actix_rt::test]
async fn writing_an_input_returns_405() {
    let cfg = sample_config();
    let state = app_state(&cfg);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&cfg.http.path)),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/api/v1/pins/door")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn hidden_and_unknown_endpoints_return_404() {
    let cfg = sample_config();
    let state = app_state(&cfg);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&cfg.http.path)),
    )
    .await;

    for uri in ["/api/v1/pins/tamper", "/api/v1/pins/garage"] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404, "{uri}");
    }
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let cfg = sample_config();
    let state = app_state(&cfg);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&cfg.http.path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/pins/lamp")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::delete().uri("/api/v1/pins").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn empty_value_writes_high() {
    let cfg = sample_config();
    let state = app_state(&cfg);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&cfg.http.path)),
    )
    .await;

    let req = test::TestRequest::put().uri("/api/v1/pins/lamp").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/api/v1/pins/lamp").to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");
}

#[actix_rt::test]
async fn non_utf8_value_returns_400() {
    let cfg = sample_config();
    let state = app_state(&cfg);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&cfg.http.path)),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/api/v1/pins/lamp")
        .set_payload(vec![0xffu8, 0xfe])
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn pulse_output_returns_low() {
    let cfg = sample_config();
    let state = app_state(&cfg);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&cfg.http.path)),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/api/v1/pins/strike")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/api/v1/pins/strike").to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");

    actix_rt::time::sleep(Duration::from_millis(200)).await;

    let req = test::TestRequest::get().uri("/api/v1/pins/strike").to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "0");
}

#[actix_rt::test]
async fn unusable_pin_fails_startup() {
    let cfg = GatewayConfig::from_json(
        r#"
        {
            "http": { "unix_socket": "/tmp/hwgate.sock", "path": "/", "timeout": 5 },
            "inputs": { "bell": { "pin": "fakeio-bell", "on_rising": "http://hub/", "payload": "{{" } }
        }
        "#,
    )
    .expect("valid config");
    let registry = Registry::new(cfg.hardware.clone());
    let err = Gateway::build(&cfg, &registry).err().expect("template error");
    assert!(err.to_string().contains("input bell"));
}
