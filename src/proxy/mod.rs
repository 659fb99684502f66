pub mod accounts;
pub mod admin;
pub mod handlers;
pub mod pipeline;
pub mod proxy_pool;
pub mod server;
pub mod sessions;
pub mod state;
pub mod upstream;
