//! Shared application state — the single owner of every mutable
//! component (Queue Store, IDS Engine, device credentials, metrics).
//! Built once at startup and cloned cheaply (all fields are `Arc`s),
//! no ambient globals — every mutable component is owned here.

use crate::auth::DeviceCredentialStore;
use crate::config::Config;
use crate::ids::IdsEngine;
use crate::metrics::Metrics;
use crate::queue::QueueStore;
use crate::ratelimit::SlidingWindowLimiter;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<QueueStore>,
    pub ids: Arc<IdsEngine>,
    pub devices: Arc<DeviceCredentialStore>,
    pub metrics: Arc<Metrics>,
    pub auth_limiter: Arc<SlidingWindowLimiter>,
}
