pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod connection;
pub mod hub;
pub mod pty;
pub mod rpc;
pub mod server;
pub mod tls;
