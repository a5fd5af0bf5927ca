//! docsync-server: serves a small demo application.
//!
//! Configuration comes from `DOCSYNC_*` environment variables, logging from
//! `RUST_LOG`.

use std::sync::Arc;

use docsync_core::{Document, Model, Value};
use docsync_server::{DocumentServer, FunctionHandler, HookResult, ServerConfig};
use log::{error, info};

fn build_document(doc: &mut Document) -> HookResult {
    doc.set_title("Slider demo", None);
    let slider = doc.add_root(
        Model::new("Slider")
            .with("title", "Value")
            .with("start", 0i64)
            .with("end", 100i64)
            .with("value", 50i64),
        None,
    )?;
    let label = doc.add_root(Model::new("Div").with("text", "Value: 50"), None)?;

    doc.on_property_change(&slider, "value", move |doc, change| {
        let text = match &change.new {
            Value::Int(v) => format!("Value: {v}"),
            Value::Float(v) => format!("Value: {v:.2}"),
            other => format!("Value: {other:?}"),
        };
        if let Err(e) = doc.set_property(&label, "text", text, None) {
            error!("Could not update label: {e}");
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let mut server = match DocumentServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Could not start server: {e}");
            std::process::exit(1);
        }
    };
    server.add_application("/", Arc::new(FunctionHandler::new(build_document)));
    info!("Starting docsync-server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
