pub mod auth;
pub mod compactor;
pub mod config;
pub mod credential;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod permissions;
pub mod sql;
pub mod tls;
pub mod validator;
pub mod wal;
pub mod wire;
