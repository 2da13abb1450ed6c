//! HTTP surface: routing, upstream forwarding and the listening server.

mod gateway;
mod server;
mod upstream;

pub use gateway::{Gateway, Resource};
pub use server::GatewayServer;
pub use upstream::{HttpUpstream, Upstream, FORWARDED_HOST_HEADER};
