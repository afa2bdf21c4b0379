mod auth;
mod middleware;
mod routes;
mod server;
mod sessions;
mod state;

pub use server::ProxyServer;
pub use sessions::SessionKeepers;
