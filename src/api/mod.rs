//! HTTP surface driving the studio

pub mod handlers;
pub mod routes;

pub use routes::create_router;
