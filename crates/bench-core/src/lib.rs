pub mod config;
pub mod connection;
pub mod fcgi;
pub mod pacer;
pub mod runner;
pub mod single;
pub mod stats;

pub use config::*;
pub use connection::*;
pub use fcgi::{FcgiConnection, FcgiDialer};
pub use pacer::*;
pub use runner::*;
pub use single::*;
pub use stats::*;
