pub mod assistant;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod fallback;
pub mod model;
pub mod page;
pub mod page_channel;
pub mod response;
pub mod session_host;
pub mod transport;
