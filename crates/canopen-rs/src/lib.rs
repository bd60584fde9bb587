#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for the bounded pools (Vec with fixed capacity).
extern crate alloc;

// --- Foundation Modules ---
pub mod types;
pub mod hal;
pub(crate) mod log;

// --- Core Services ---
pub mod timer;
pub mod od;

// --- Higher Layers ---
pub mod emcy;
pub mod lss;
pub mod nmt;
pub mod pdo;
pub mod sdo;
pub mod sync;

// --- Node Abstraction ---
pub mod node;

// --- Top-level Exports ---
pub use emcy::{EmcyEntry, EmcyUsr};
pub use hal::{CanDriver, CanFrame, CoError, NodeEvents, NullEvents};
pub use nmt::{NmtMode, ResetKind};
pub use node::{Node, NodeSpec};
pub use od::{ObjData, ObjFlags, ObjKey, ObjectDictionary, ObjectEntry};
pub use timer::TmrUnit;
pub use types::NodeId;
