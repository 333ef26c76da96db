#![allow(missing_docs)]

mod core;
mod udp_rx;
mod udp_tx;
mod ws;

pub use self::{core::*, udp_rx::*, udp_tx::*, ws::*};

use crate::{
    audio::{AudioSink, AudioSupplier},
    driver::status::StatusTracker,
};
use flume::Sender;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

pub type SupplierSlot = Arc<Mutex<Option<Box<dyn AudioSupplier>>>>;
pub type SinkSlot = Arc<RwLock<Option<Arc<dyn AudioSink>>>>;

/// Handles shared by a driver's core task and every session it starts.
#[derive(Clone)]
pub struct Interconnect {
    pub core: Sender<CoreMessage>,
    pub status: StatusTracker,
    pub supplier: SupplierSlot,
    pub sink: SinkSlot,
}

impl Interconnect {
    pub fn new(core: Sender<CoreMessage>, status: StatusTracker) -> Self {
        Self {
            core,
            status,
            supplier: Arc::default(),
            sink: Arc::default(),
        }
    }

    /// Returns the current audio sink, if any.
    pub fn sink(&self) -> Option<Arc<dyn AudioSink>> {
        self.sink.read().clone()
    }
}

impl std::fmt::Debug for Interconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interconnect")
            .field("status", &self.status)
            .field("has_supplier", &self.supplier.lock().is_some())
            .field("has_sink", &self.sink.read().is_some())
            .finish_non_exhaustive()
    }
}
