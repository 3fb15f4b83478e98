// src/lib.rs
pub mod config;
pub mod pairs;
pub mod pairtrade;
pub mod persistence;
pub mod ports;
pub mod rate_limit_notifier;
pub mod signal;
pub mod sizing;
pub mod stats;
pub mod trade {
    pub mod execution {
        pub mod broker_box;
    }
    pub mod pnl_log;
    pub mod retry;
}
pub mod training;
