//! Serves a greeting, a small form and an upload endpoint on port 8080.
//!
//! ```text
//! curl -v http://127.0.0.1:8080/hello?name=you
//! curl -v -d 'name=form' http://127.0.0.1:8080/form
//! curl -v -T Cargo.toml http://127.0.0.1:8080/upload
//! ```

use evented_http::handler::{HandlerError, make_handler};
use evented_http::protocol::Transaction;
use evented_http::server::{Dispatch, HttpServer};
use http::{Method, StatusCode};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

async fn route(tx: Transaction) -> Result<(), HandlerError> {
    let request = tx.request();
    let response = tx.response();
    info!(method = %request.method(), path = request.path(), peer = %request.remote_addr(), "request");

    match (request.method(), request.path()) {
        (&Method::GET, "/hello") => {
            let name = request.query_data().get("name").unwrap_or("world");
            response.set_header("Content-Type", "text/plain; charset=utf-8")?;
            response.respond(StatusCode::OK, format!("Hello {name}!\r\n")).await?;
        }
        (&Method::POST, "/form") => {
            let name = request.post_data().get("name").unwrap_or("nobody");
            response.respond(StatusCode::OK, format!("posted by {name}\r\n")).await?;
        }
        (&Method::PUT, "/upload") => {
            let mut body = request.begin_streaming_body().await?;
            let mut total = 0;
            while let Some(buffer) = body.next_buffer().await {
                total += buffer.len();
                buffer.complete();
            }
            response.respond(StatusCode::CREATED, format!("received {total} bytes\r\n")).await?;
        }
        _ => response.respond_empty(StatusCode::NOT_FOUND).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let server = HttpServer::builder().port(8080).dispatch(Dispatch::ThreadPool).build();
    server.handle_request(make_handler(route));

    match server.start().await {
        Ok(addr) => info!(%addr, "start listening"),
        Err(e) => {
            error!(cause = %e, "bind server error");
            return;
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(cause = %e, "can't listen for ctrl-c");
    }
    server.dispose();
}
