//! Service data objects: acknowledged point-to-point access to the
//! dictionary of a node. The server answers on `0x600 + node-id`, the
//! optional client initiates transfers toward remote servers.

pub mod abort;
pub mod client;
pub mod server;

pub use abort::{abort_code, crc16_ccitt};
pub use client::SdoClient;
pub use server::SdoServer;
