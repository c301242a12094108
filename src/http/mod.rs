//! HTTP transport for the admission service.

mod routes;
mod server;

pub use routes::handle_request;
pub use server::{serve_listener, HttpServer};
