use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use opentelemetry_exporter_newrelic as telemetry;
use serde::Deserialize;
use std::env;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;

#[derive(Deserialize)]
struct HelloQuery {
    user: Option<String>,
}

struct AppMetrics {
    greetings: Counter<u64>,
}

#[get("/")]
#[tracing::instrument(skip(query, metrics), fields(user))]
async fn hello(query: web::Query<HelloQuery>, metrics: web::Data<AppMetrics>) -> impl Responder {
    let user = query.user.as_deref().unwrap_or("anonymous");
    tracing::Span::current().record("user", user);
    metrics
        .greetings
        .add(1, &[KeyValue::new("anonymous", query.user.is_none())]);
    info!(user = user, "Hello endpoint called");
    HttpResponse::Ok().body(format!("Hello, {}!", user))
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // New Relic when NEW_RELIC_API_KEY is set, local otherwise
    let guard = telemetry::init()
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let port: u16 = env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .map_err(|_| std::io::Error::other("PORT must be a number"))?;

    let meter = opentelemetry::global::meter("demo-service");
    let metrics = web::Data::new(AppMetrics {
        greetings: meter
            .u64_counter("demo.greetings")
            .with_description("Greetings served")
            .build(),
    });

    info!("Starting server on port {}", port);

    let served = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(metrics.clone())
            .service(hello)
            .service(health)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    if let Err(e) = guard.shutdown().await {
        error!(error = %e, "telemetry shutdown failed");
    }
    served
}
