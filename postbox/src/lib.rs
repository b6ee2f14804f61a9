pub mod controller;

pub use controller::{Postbox, SHUTDOWN_BROADCAST, find_config_file};
