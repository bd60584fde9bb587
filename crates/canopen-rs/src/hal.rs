use crate::nmt::NmtMode;
use crate::od::ObjKey;
use crate::types::NodeIdError;
use core::fmt;

/// Defines a portable, descriptive error type for the CANopen stack.
///
/// The variants mirror the node-level error codes a running node can
/// latch, plus the dictionary access errors the services translate into
/// SDO abort codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoError {
    /// Creation of a timer action failed.
    TmrCreate,
    /// Deletion of a timer action failed (handle not live).
    TmrDelete,
    /// The bounded timer action pool is exhausted.
    TmrNoAct,
    /// A dictionary entry could not be read.
    ObjRead,
    /// A dictionary entry could not be written.
    ObjWrite,
    /// A dictionary entry is miss-configured for its service.
    ObjInit,
    /// A written value is outside the allowed range of the entry.
    ObjRange,
    /// A PDO mapping exceeds the number or length limits.
    ObjMapLen,
    /// A PDO mapping references an unusable object entry.
    ObjMapType,
    /// The entry is not accessible in the current state.
    ObjAcc,
    /// The written value is incompatible with the running service.
    ObjIncompatible,
    /// The requested object entry does not exist.
    ObjNotFound,
    /// The object index exists, but not the requested sub-index.
    SubIdxNotFound,
    /// Attempt to write a read-only entry.
    ObjReadOnly,
    /// Attempt to read a write-only entry.
    ObjWriteOnly,
    /// The heartbeat consumer configuration in 0x1016 is invalid.
    Cfg1016,
    /// A PDO communication parameter is invalid.
    PdoCom,
    /// The CAN driver refused to accept a frame.
    IfSend,
    /// The requested NMT mode transition is not allowed.
    NmtMode,
    /// An SDO client slot is already busy with a transfer.
    SdoBusy,
    /// An LSS request carried invalid parameters.
    LssParam,
    /// A value in the frame is not a valid node-id.
    InvalidNodeId(u8),
    /// An application write hook refused the value with an abort code.
    UserAbort(u32),
}

impl fmt::Display for CoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TmrCreate => write!(f, "Timer action creation failed"),
            Self::TmrDelete => write!(f, "Timer action deletion failed"),
            Self::TmrNoAct => write!(f, "Timer action pool exhausted"),
            Self::ObjRead => write!(f, "Object entry read failed"),
            Self::ObjWrite => write!(f, "Object entry write failed"),
            Self::ObjInit => write!(f, "Object entry is miss-configured"),
            Self::ObjRange => write!(f, "Value range of object entry exceeded"),
            Self::ObjMapLen => write!(f, "PDO mapping length limit exceeded"),
            Self::ObjMapType => write!(f, "Object entry is not mappable"),
            Self::ObjAcc => write!(f, "Object entry access not allowed"),
            Self::ObjIncompatible => write!(f, "Value incompatible with running service"),
            Self::ObjNotFound => write!(f, "Object entry not found"),
            Self::SubIdxNotFound => write!(f, "Sub-index not found"),
            Self::ObjReadOnly => write!(f, "Object entry is read-only"),
            Self::ObjWriteOnly => write!(f, "Object entry is write-only"),
            Self::Cfg1016 => write!(f, "Heartbeat consumer configuration invalid"),
            Self::PdoCom => write!(f, "PDO communication parameter invalid"),
            Self::IfSend => write!(f, "CAN driver refused to send"),
            Self::NmtMode => write!(f, "NMT mode transition not allowed"),
            Self::SdoBusy => write!(f, "SDO client transfer already in progress"),
            Self::LssParam => write!(f, "Invalid LSS request parameter"),
            Self::InvalidNodeId(v) => write!(f, "Invalid node-id: {}", v),
            Self::UserAbort(code) => write!(f, "Application abort with code {:#010X}", code),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CoError {}

impl From<NodeIdError> for CoError {
    fn from(err: NodeIdError) -> Self {
        match err {
            NodeIdError::InvalidRange(val) => CoError::InvalidNodeId(val),
        }
    }
}

/// A classic CAN frame at the driver boundary: an 11-bit identifier and
/// up to 8 data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    /// Builds a frame from an identifier and a payload of at most 8 bytes.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        let mut data = [0u8; 8];
        let dlc = payload.len().min(8);
        data[..dlc].copy_from_slice(&payload[..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data,
        }
    }

    /// Reads a little-endian u16 starting at `pos`.
    pub fn word(&self, pos: usize) -> u16 {
        u16::from_le_bytes([self.data[pos], self.data[pos + 1]])
    }

    /// Reads a little-endian u32 starting at `pos`.
    pub fn long(&self, pos: usize) -> u32 {
        u32::from_le_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ])
    }
}

/// Hardware abstraction of the CAN controller.
///
/// This trait abstracts the physical sending and receiving of CAN
/// frames, enabling the core protocol logic to remain platform-agnostic
/// (no_std). Both operations are non-blocking: `receive` drains one
/// pending frame if available, `send` either queues the frame or fails
/// with [`CoError::IfSend`].
pub trait CanDriver {
    /// Sends a single CAN frame.
    fn send(&mut self, frame: &CanFrame) -> Result<(), CoError>;

    /// Attempts to receive a single pending CAN frame.
    fn receive(&mut self) -> Option<CanFrame>;
}

/// Application hooks of a CANopen node.
///
/// All methods have no-op defaults; an application implements the ones
/// it cares about. The node stores exactly one events value and calls
/// into it from `process_frame`/`tick` only, so implementations need no
/// internal synchronization.
pub trait NodeEvents {
    /// Called when an NMT reset command (node or communication) was
    /// executed.
    fn nmt_reset_request(&mut self, _kind: crate::nmt::ResetKind) {}

    /// Called when a heartbeat consumer misses a heartbeat window.
    fn hb_consumer_event(&mut self, _node_id: u8) {}

    /// Called when a monitored node reports a new NMT state.
    fn hb_consumer_change(&mut self, _node_id: u8, _state: NmtMode) {}

    /// Called when the LSS master commands to store the pending
    /// configuration (node-id and bit timing).
    fn lss_store(&mut self, _node_id: u8, _baudrate: u32) {}

    /// Called when an SDO client transfer finishes. An `abort_code` of
    /// zero indicates success; `data` holds the transferred bytes (the
    /// received value on uploads).
    fn csdo_finished(&mut self, _slot: u8, _key: ObjKey, _abort_code: u32, _data: &[u8]) {}

    /// Called when the store-parameters entry 0x1010 receives the
    /// "save" signature for a parameter group.
    fn store_parameters(&mut self, _group: u8) -> Result<(), CoError> {
        Ok(())
    }

    /// Called when the restore-parameters entry 0x1011 receives the
    /// "load" signature for a parameter group.
    fn restore_parameters(&mut self, _group: u8) -> Result<(), CoError> {
        Ok(())
    }

    /// Called when an application timer created through the node's
    /// timer service elapses.
    fn app_timer(&mut self, _id: u16) {}

    /// Application hook for manufacturer-specific object writes. Return
    /// `None` to let the stack store the value, `Some(Ok(()))` when the
    /// application consumed the write, or `Some(Err(code))` to abort an
    /// SDO download with a user-defined 32-bit abort code.
    fn app_write(&mut self, _key: ObjKey, _data: &[u8]) -> Option<Result<(), u32>> {
        None
    }
}

/// A no-op events implementation for nodes without application hooks.
pub struct NullEvents;
impl NodeEvents for NullEvents {}
