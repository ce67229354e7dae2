pub mod calibration;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod countdown;
pub mod history;
pub mod http;
pub mod lookup;
pub mod ntp;
pub mod phase;
pub mod scheduler;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod tracker;
pub mod traits;
