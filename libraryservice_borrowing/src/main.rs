use std::sync::Arc;

use actix_web::{App, HttpServer};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use paperclip::actix::{web, OpenApiExt};
use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use libraryservice_borrowing::app_config::{config_app, LibraryServices};
use libraryservice_borrowing::clock::SystemClock;
use libraryservice_borrowing::settings::AppSettings;
use libraryservice_store::data_store::{DataStore, InMemoryDataStore, PostgresDataStore};

// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry() {
    let app_name = "libraryservice_borrowing";

    // Spans are exported to Jaeger in batches
    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(app_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Tunable via `RUST_LOG` env variable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(telemetry)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to install `tracing` subscriber.")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();
    let settings = AppSettings::load().expect("Failed to load settings");
    tracing::info!("starting HTTP server at http://localhost:{}", settings.http_port);

    let store: Arc<dyn DataStore> = if settings.use_in_memory_db {
        Arc::new(InMemoryDataStore::default())
    } else {
        Arc::new(
            PostgresDataStore::init(settings.store_config())
                .await
                .expect("Failed to init postgres"),
        )
    };
    let services = LibraryServices::new(store, Arc::new(SystemClock));

    HttpServer::new(move || {
        App::new()
            .wrap_api()
            .app_data(web::Data::new(services.catalog.clone()))
            .app_data(web::Data::new(services.borrowings.clone()))
            .app_data(web::Data::new(services.profiles.clone()))
            .wrap(TracingLogger::default())
            .configure(config_app)
            .with_json_spec_at("/apispec/v2")
            .build()
    })
    .bind(("0.0.0.0", settings.http_port))?
    .run()
    .await
}
