//! Process data objects: mapping, transmit and receive engines.

pub mod mapping;
pub mod rpdo;
pub mod tpdo;

pub use mapping::PdoMapEntry;

use crate::hal::{CanDriver, NodeEvents};
use crate::node::Node;

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    /// Activates the PDO engines from the current dictionary state
    /// (entering operational mode).
    pub(crate) fn pdo_init(&mut self) {
        self.tpdo_init_all();
        self.rpdo_init_all();
    }

    /// Suspends the PDO engines (leaving operational mode or resetting
    /// communication).
    pub(crate) fn pdo_clear(&mut self) {
        self.tpdo_clear_all();
        self.rpdo_clear_all();
    }
}
