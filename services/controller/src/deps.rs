//! Handler dependencies.

use std::sync::Arc;

use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::metrics::FleetMetrics;
use crate::providers::{BotProvider, ComputeProvider};
use crate::store::EntityStore;

/// Everything a handler may touch, passed explicitly.
#[derive(Clone)]
pub struct Deps {
    pub store: Arc<dyn EntityStore>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub compute: Arc<dyn ComputeProvider>,
    pub fleet: Arc<dyn BotProvider>,
    pub clock: Arc<dyn Clock>,
    pub metrics: FleetMetrics,
}
