//! Session-scoped symbol table.
//!
//! A bidirectional mapping between application message names and data ids,
//! with each entry owning the ordered handler list registered for that
//! name. The server is the authority: it assigns ids in registration order
//! starting at the first application id, and the client adopts whatever the
//! exchange delivers. Hash lookups are rebuilt whenever the numbering
//! changes; the entry vector itself preserves registration order.

use std::collections::HashMap;

use tether_proto::{ControlId, DataId, MAX_DATA_NAME_LEN};

/// Truncate a name to the protocol's limit, respecting UTF-8 boundaries.
#[must_use]
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_DATA_NAME_LEN {
        return name;
    }
    let mut cut = MAX_DATA_NAME_LEN;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    &name[..cut]
}

/// One registered message name with its id and handler chain.
pub struct DataEntry<H> {
    name: String,
    data_id: DataId,
    handlers: Vec<H>,
}

impl<H> DataEntry<H> {
    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current data id, the unassigned sentinel until numbering happens.
    #[must_use]
    pub fn data_id(&self) -> DataId {
        self.data_id
    }
}

/// Name/id mapping plus per-name handler lists.
pub struct SymbolTable<H> {
    entries: Vec<DataEntry<H>>,
    by_id: HashMap<DataId, usize>,
    by_name: HashMap<String, usize>,
}

impl<H> Default for SymbolTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SymbolTable<H> {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Number of registered names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no names are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Linear lookup by (already truncated) name; always correct, maps or
    /// no maps.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Hash lookup of the entry index by assigned id.
    #[must_use]
    pub fn index_by_id(&self, id: DataId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Resolve a name to its id, via the hash map once built, falling back
    /// to a scan so pre-session callers see the unassigned sentinel.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<DataId> {
        let name = truncate_name(name);
        if let Some(&idx) = self.by_name.get(name) {
            return Some(self.entries[idx].data_id);
        }
        self.find(name).map(|idx| self.entries[idx].data_id)
    }

    /// Resolve an id back to its name.
    #[must_use]
    pub fn name_of(&self, id: DataId) -> Option<&str> {
        if let Some(&idx) = self.by_id.get(&id) {
            return Some(&self.entries[idx].name);
        }
        self.entries
            .iter()
            .find(|e| e.data_id == id)
            .map(|e| e.name.as_str())
    }

    /// Append a new entry with the unassigned id; returns its index.
    pub fn add(&mut self, name: String) -> usize {
        self.entries.push(DataEntry {
            name,
            data_id: ControlId::Unknown.to_data_id(),
            handlers: Vec::new(),
        });
        self.entries.len() - 1
    }

    /// Append a handler to an entry's chain.
    pub fn push_handler(&mut self, idx: usize, handler: H) {
        self.entries[idx].handlers.push(handler);
    }

    /// Adopt a server-assigned id for `name`, adding the entry if the name
    /// is new to this side.
    pub fn upsert(&mut self, name: &str, id: DataId) {
        match self.find(name) {
            Some(idx) => self.entries[idx].data_id = id,
            None => {
                let idx = self.add(name.to_string());
                self.entries[idx].data_id = id;
            }
        }
    }

    /// Number entries sequentially from `start` in registration order and
    /// rebuild the lookup maps. Server-side finalization.
    pub fn assign_ids(&mut self, start: DataId) {
        let mut next = start;
        for entry in &mut self.entries {
            entry.data_id = next;
            next += 1;
        }
        self.rebuild_maps();
    }

    /// Rebuild both hash maps from the entry vector.
    pub fn rebuild_maps(&mut self) {
        self.by_id.clear();
        self.by_name.clear();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.by_id.insert(entry.data_id, idx);
            self.by_name.insert(entry.name.clone(), idx);
        }
    }

    /// Forget all numbering: ids return to the unassigned sentinel and the
    /// maps empty. Handlers survive for the next session.
    pub fn reset_ids(&mut self) {
        for entry in &mut self.entries {
            entry.data_id = ControlId::Unknown.to_data_id();
        }
        self.by_id.clear();
        self.by_name.clear();
    }

    /// Registration-ordered view of names and ids.
    pub fn iter(&self) -> impl Iterator<Item = (&str, DataId)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.data_id))
    }

    /// Detach an entry's handler chain for dispatch.
    ///
    /// Detaching lets dispatch hand the session `&mut` to each handler
    /// without aliasing the table.
    pub fn take_handlers(&mut self, idx: usize) -> Vec<H> {
        std::mem::take(&mut self.entries[idx].handlers)
    }

    /// Reattach a detached chain, keeping any handlers registered while it
    /// was out.
    pub fn restore_handlers(&mut self, idx: usize, handlers: Vec<H>) {
        let added = std::mem::replace(&mut self.entries[idx].handlers, handlers);
        self.entries[idx].handlers.extend(added);
    }
}
