//! Connection admission policy.
//!
//! One map serves both modes: an address marked `false` is denylisted, one
//! marked `true` is allowlisted. Which marks matter depends on the server's
//! mode flags at accept time. Keys are full socket addresses, so equality
//! covers family, address, and port.

use std::collections::HashMap;
use std::net::SocketAddr;

/// Address admission list.
#[derive(Debug, Default, Clone)]
pub struct PolicyList {
    entries: HashMap<SocketAddr, bool>,
}

impl PolicyList {
    /// Empty list: everything is admitted in deny mode, nothing in allow
    /// mode.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an address as denied.
    pub fn deny(&mut self, addr: SocketAddr) {
        self.entries.insert(addr, false);
    }

    /// Mark an address as allowed.
    pub fn allow(&mut self, addr: SocketAddr) {
        self.entries.insert(addr, true);
    }

    /// Drop a deny mark; an allow mark for the same address survives.
    pub fn remove_deny(&mut self, addr: SocketAddr) {
        if self.entries.get(&addr) == Some(&false) {
            self.entries.remove(&addr);
        }
    }

    /// Drop an allow mark; a deny mark for the same address survives.
    pub fn remove_allow(&mut self, addr: SocketAddr) {
        if self.entries.get(&addr) == Some(&true) {
            self.entries.remove(&addr);
        }
    }

    /// The recorded mark for an address, if any.
    #[must_use]
    pub fn lookup(&self, addr: SocketAddr) -> Option<bool> {
        self.entries.get(&addr).copied()
    }

    /// Decide admission under the given mode flags.
    ///
    /// Deny mode rejects addresses explicitly marked `false`; allow mode
    /// rejects addresses not marked `true`. Both modes may be active at
    /// once, in which case both must pass.
    #[must_use]
    pub fn admits(&self, addr: SocketAddr, use_denylist: bool, use_allowlist: bool) -> bool {
        let mark = self.lookup(addr);
        if use_denylist && mark == Some(false) {
            return false;
        }
        if use_allowlist && mark != Some(true) {
            return false;
        }
        true
    }
}
