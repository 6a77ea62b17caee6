//! An embeddable, event-driven HTTP/1.x server
//!
//! Every accepted connection is a small state machine running on its own tokio
//! task. Applications register handlers on an [`HttpServer`]; each request is
//! delivered as a [`Transaction`] whose request and response sides are driven
//! explicitly: bodies are streamed buffer by buffer, and the connection only
//! reads or writes more once the application has asked for it.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 with keep-alive and pipelining
//! - `application/x-www-form-urlencoded` and `multipart/form-data` bodies parsed before dispatch
//! - Streamed request bodies with per-buffer backpressure
//! - Chunked or length-delimited responses, chosen from the response headers
//! - `Expect: 100-continue`, answered automatically or by an application handler
//! - Callbacks delivered on a thread pool or on a single ordered worker
//!
//! # Example
//!
//! ```no_run
//! use evented_http::handler::make_handler;
//! use evented_http::protocol::{HttpError, Transaction};
//! use evented_http::server::HttpServer;
//! use http::StatusCode;
//! use tracing::{Level, info};
//! use tracing_subscriber::FmtSubscriber;
//!
//! #[tokio::main]
//! async fn main() {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//!     let server = HttpServer::builder().port(8080).build();
//!     server.handle_request(make_handler(|tx: Transaction| async move {
//!         info!(path = tx.request().path(), "request");
//!         tx.response().respond(StatusCode::OK, "Hello World!\r\n").await?;
//!         Ok::<_, HttpError>(())
//!     }));
//!
//!     let addr = server.start().await.expect("can't start the server");
//!     info!(%addr, "listening");
//!     tokio::signal::ctrl_c().await.expect("can't wait for ctrl-c");
//! }
//! ```
//!
//! # Architecture
//!
//! - [`server`]: listener, accept loop, connection registry and callback dispatch
//! - [`connection`]: the per-connection state machine
//! - [`protocol`]: requests, responses, headers, form data and errors
//! - [`codec`]: wire-level encoders and decoders
//! - [`handler`]: the [`Handler`](handler::Handler) trait and [`make_handler`](handler::make_handler)
//!
//! # Errors
//!
//! - [`protocol::ParseError`]: malformed requests, answered with a minimal error response
//! - [`protocol::SendError`]: response bodies that don't match their framing
//! - [`protocol::HttpError`]: what the request/response APIs return
//! - [`server::ServerError`]: binding and lifecycle errors
//!
//! # Limitations
//!
//! - No chunked request bodies (`501 Not Implemented`)
//! - Only `GET`, `HEAD`, `POST`, `PUT` and `DELETE`
//! - No TLS, timeouts or HTTP/2

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;

mod utils;
pub(crate) use utils::ensure;

pub use handler::{Handler, make_handler};
pub use protocol::{HttpError, Request, Response, Transaction};
pub use server::{Dispatch, HttpServer, ServerBuilder, ServerConfig, ServerError};
