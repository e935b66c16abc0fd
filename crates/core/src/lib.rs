pub mod analysis;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod ingest;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod time;
