//! Reserved control message ids.
//!
//! Data ids `0..=6` belong to the session protocol itself; application
//! message names are assigned ids starting at [`USER_DATA_START`] in
//! registration order on the server.

use crate::DataId;

/// First data id available to application messages.
pub const USER_DATA_START: DataId = 7;

/// Control message kinds carried in the packet header's data id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlId {
    /// Server to client on accept, echoed client to server once the symbol
    /// table exchange finishes: triggers identity request / marks ready.
    Handshake = 0,

    /// Client to server: request a fresh identity (empty payload).
    /// Server to client: grant carrying the issued id.
    InitClientId = 1,

    /// Client to server: request resumption of a prior identity.
    /// Server to client: grant carrying the reclaimed id.
    Reconnect = 2,

    /// Graceful termination signal, either direction.
    Disconnect = 3,

    /// Client to server: trigger the symbol table stream (empty payload).
    /// Server to client: one table entry per packet.
    DataListEntry = 4,

    /// Sentinel for names that have no assigned id yet.
    Unknown = 5,

    /// Heartbeat carrying the sender's advertised timeout budget.
    Aliveness = 6,
}

impl ControlId {
    /// The raw data id for this control message.
    #[must_use]
    pub const fn to_data_id(self) -> DataId {
        self as DataId
    }

    /// Parse a data id into a control kind.
    ///
    /// Returns `None` for application ids (`>= 7`), which callers route to
    /// their registered handlers instead.
    #[must_use]
    pub const fn from_data_id(id: DataId) -> Option<Self> {
        match id {
            0 => Some(Self::Handshake),
            1 => Some(Self::InitClientId),
            2 => Some(Self::Reconnect),
            3 => Some(Self::Disconnect),
            4 => Some(Self::DataListEntry),
            5 => Some(Self::Unknown),
            6 => Some(Self::Aliveness),
            _ => None,
        }
    }
}

/// True if the id belongs to the reserved control range.
#[must_use]
pub const fn is_control(id: DataId) -> bool {
    id < USER_DATA_START
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for id in 0..USER_DATA_START {
            let control = ControlId::from_data_id(id).expect("reserved id");
            assert_eq!(control.to_data_id(), id);
        }
    }

    #[test]
    fn application_ids_are_not_control() {
        assert_eq!(ControlId::from_data_id(USER_DATA_START), None);
        assert_eq!(ControlId::from_data_id(u16::MAX), None);
        assert!(!is_control(USER_DATA_START));
        assert!(is_control(6));
    }
}
