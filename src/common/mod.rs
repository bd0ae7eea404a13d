pub mod client {
    pub mod client;
    pub mod transport;
}

pub mod config;
pub mod logger;
pub mod utils;
