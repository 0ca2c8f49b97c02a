// lib.rs
#![warn(clippy::large_futures)]

pub use std::{
    net,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

pub use anyhow::bail;
pub use log::*;
pub use serde::{Deserialize, Serialize};
pub use tokio::{
    sync::RwLock,
    time::{Duration, sleep},
};

mod config;
pub use config::*;

mod state;
pub use state::*;

mod schedule;
pub use schedule::*;

mod measure;
pub use measure::*;

mod clock;
pub use clock::*;

mod http;
pub use http::*;

mod assets;
pub use assets::*;

mod apiserver;
pub use apiserver::*;

mod control;
pub use control::*;

mod heartbeat;
pub use heartbeat::*;

#[cfg(target_os = "espidf")]
mod wifi;
#[cfg(target_os = "espidf")]
pub use wifi::*;

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

// EOF
