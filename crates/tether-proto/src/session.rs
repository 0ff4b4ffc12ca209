//! Shared session-protocol definitions.
//!
//! Both state machines agree on these numbers and shapes: the aliveness
//! budget arithmetic, the ceiling a session waits before its first
//! heartbeat arrives, and the record streamed during the symbol table
//! exchange.

use std::time::Duration;

use crate::{control::ControlId, errors::Result, ClientId, DataId, Packet};

/// Multiplier applied to the heartbeat cadence when advertising a timeout
/// budget. Roughly three missed beats are absorbed before a session is
/// declared dead.
pub const TIMEOUT_FACTOR: f64 = 3.1;

/// Budget in effect before the first aliveness packet of a session arrives.
pub const MAX_TIMEOUT_MS: f64 = 999_999.0;

/// Compute the timeout budget one side advertises with each heartbeat:
/// `(aliveness delay + last observed ping) x 3.1`, in milliseconds.
#[must_use]
pub fn advertised_budget(delay: Duration, ping_ms: f64) -> f32 {
    ((delay.as_secs_f64() * 1000.0 + ping_ms) * TIMEOUT_FACTOR) as f32
}

/// Build an aliveness packet carrying the advertised budget.
#[must_use]
pub fn aliveness(budget_ms: f32) -> Packet {
    let mut pack = Packet::with_id(ControlId::Aliveness.to_data_id());
    pack.add(budget_ms).expect("a four byte budget always fits");
    pack
}

/// Build a control packet whose payload is a single client id.
///
/// Covers the identity grants and the resumption request, which all carry
/// exactly one id.
#[must_use]
pub fn identity(kind: ControlId, id: ClientId) -> Packet {
    let mut pack = Packet::with_id(kind.to_data_id());
    pack.add(id).expect("a four byte id always fits");
    pack
}

/// One record of the symbol table exchange.
///
/// The server streams one of these per registered name in response to the
/// client's trigger; the client applies them until `index` reaches
/// `total - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataListEntry {
    /// Number of records in the whole exchange.
    pub total: u16,
    /// Zero-based position of this record.
    pub index: u16,
    /// Application-chosen message name.
    pub name: String,
    /// Data id the server assigned to that name.
    pub data_id: DataId,
}

impl DataListEntry {
    /// Append this record to a packet payload.
    ///
    /// # Errors
    ///
    /// Propagates payload overflow from the codec; cannot happen for names
    /// within the length limit.
    pub fn write(&self, pack: &mut Packet) -> Result<()> {
        pack.add(self.total)?;
        pack.add(self.index)?;
        pack.add_string(&self.name)?;
        pack.add(self.data_id)
    }

    /// Pop a record from a packet payload.
    #[must_use]
    pub fn read(pack: &Packet) -> Self {
        Self {
            total: pack.remove(),
            index: pack.remove(),
            name: pack.remove_string(),
            data_id: pack.remove(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_formula() {
        let budget = advertised_budget(Duration::from_millis(1000), 0.0);
        assert!((f64::from(budget) - 3100.0).abs() < 0.001);

        let with_ping = advertised_budget(Duration::from_millis(1000), 50.0);
        assert!(f64::from(with_ping) > f64::from(budget));
    }

    #[test]
    fn aliveness_carries_the_budget() {
        let pack = aliveness(3100.0);
        assert_eq!(pack.data_id(), ControlId::Aliveness.to_data_id());
        assert_eq!(pack.remove::<f32>(), 3100.0);
    }

    #[test]
    fn data_list_entry_round_trip() {
        let entry = DataListEntry {
            total: 3,
            index: 1,
            name: "position-update".to_string(),
            data_id: 8,
        };
        let mut pack = Packet::with_id(ControlId::DataListEntry.to_data_id());
        entry.write(&mut pack).unwrap();
        assert_eq!(DataListEntry::read(&pack), entry);
    }
}
