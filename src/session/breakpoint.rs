//! Breakpoint and watchpoint bookkeeping. The registry is the durable,
//! user-facing set; the [`TemporaryBreakpointIndex`] is the flattened view the
//! step controller consults at every stop, rebuilt before each run and
//! patched in place while a continuation is live.

use crate::address::LongAddress;
use indexmap::IndexMap;
use std::collections::HashMap;
use strum_macros::Display;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BreakpointKind {
    /// User-visible stop.
    Manual,
    /// Logs its text and transparently resumes; never a visible stop.
    Logpoint,
    /// Breaks with "assertion failed" when its condition holds.
    Assertion,
}

/// A breakpoint as the session tracks it. An address may host several of
/// these at once (manual + logpoint + assertion); identity is the pair
/// (address, remote id).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GenericBreakpoint {
    pub address: LongAddress,
    pub kind: BreakpointKind,
    /// Expression text, evaluated by the injected evaluator at stop time.
    pub condition: Option<String>,
    pub log_text: Option<String>,
    pub enabled: bool,
    /// Assigned by the remote; 0 means the remote rejected it and the
    /// breakpoint is unverified.
    pub remote_id: u16,
}

impl GenericBreakpoint {
    pub fn manual(address: LongAddress) -> Self {
        GenericBreakpoint {
            address,
            kind: BreakpointKind::Manual,
            condition: None,
            log_text: None,
            enabled: true,
            remote_id: 0,
        }
    }

    pub fn logpoint(address: LongAddress, text: impl Into<String>) -> Self {
        GenericBreakpoint {
            address,
            kind: BreakpointKind::Logpoint,
            condition: None,
            log_text: Some(text.into()),
            enabled: true,
            remote_id: 0,
        }
    }

    pub fn assertion(address: LongAddress, condition: impl Into<String>) -> Self {
        GenericBreakpoint {
            address,
            kind: BreakpointKind::Assertion,
            condition: Some(condition.into()),
            log_text: None,
            enabled: true,
            remote_id: 0,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn is_verified(&self) -> bool {
        self.remote_id != 0
    }

    /// Does this breakpoint take part in stop evaluation? Manual breakpoints
    /// always do; logpoints and assertions only while enabled.
    fn participates(&self) -> bool {
        match self.kind {
            BreakpointKind::Manual => true,
            BreakpointKind::Logpoint | BreakpointKind::Assertion => self.enabled,
        }
    }
}

/// Watchpoint access mode, mirrored by the wire encoding (bit 0 = read,
/// bit 1 = write).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn code(self) -> u8 {
        match self {
            AccessMode::Read => 0b01,
            AccessMode::Write => 0b10,
            AccessMode::ReadWrite => 0b11,
        }
    }

    pub fn covers_write(self, write: bool) -> bool {
        match self {
            AccessMode::Read => !write,
            AccessMode::Write => write,
            AccessMode::ReadWrite => true,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Watchpoint {
    pub address: u16,
    /// Watched range in bytes, starting at `address`.
    pub size: u16,
    pub access: AccessMode,
    pub condition: Option<String>,
}

impl Watchpoint {
    pub fn covers(&self, addr: u16, write: bool) -> bool {
        self.access.covers_write(write)
            && addr.wrapping_sub(self.address) < self.size
    }
}

/// Durable breakpoint set, keyed by long address. Insertion order is kept
/// so listings are stable for the host UI.
#[derive(Clone, Default)]
pub struct BreakpointRegistry {
    by_addr: IndexMap<LongAddress, Vec<GenericBreakpoint>>,
}

impl BreakpointRegistry {
    pub fn add(&mut self, bp: GenericBreakpoint) {
        self.by_addr.entry(bp.address).or_default().push(bp);
    }

    pub fn remove(&mut self, address: LongAddress, remote_id: u16) -> Option<GenericBreakpoint> {
        let list = self.by_addr.get_mut(&address)?;
        let pos = list.iter().position(|b| b.remote_id == remote_id)?;
        let bp = list.remove(pos);
        if list.is_empty() {
            self.by_addr.shift_remove(&address);
        }
        Some(bp)
    }

    pub fn at(&self, address: LongAddress) -> &[GenericBreakpoint] {
        self.by_addr.get(&address).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenericBreakpoint> {
        self.by_addr.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_addr.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_addr.clear();
    }
}

/// Flattened stop-evaluation view: 16-bit stop address to the breakpoints
/// hosted there, plus the internal landing addresses of the current step
/// operation. Landing hits are never user-visible stops.
#[derive(Default)]
pub struct TemporaryBreakpointIndex {
    by_addr: HashMap<u16, Vec<GenericBreakpoint>>,
    landings: Vec<u16>,
}

impl TemporaryBreakpointIndex {
    /// Full rebuild from the registry. Called at the start of every
    /// continue/step; while execution is live the patch methods are used
    /// instead so an in-flight continuation never sees a half-built index.
    pub fn rebuild(&mut self, registry: &BreakpointRegistry) {
        self.by_addr.clear();
        for bp in registry.iter().filter(|b| b.participates()) {
            self.by_addr
                .entry(bp.address.addr.as_u16())
                .or_default()
                .push(bp.clone());
        }
    }

    pub fn patch_add(&mut self, bp: &GenericBreakpoint) {
        if bp.participates() {
            self.by_addr
                .entry(bp.address.addr.as_u16())
                .or_default()
                .push(bp.clone());
        }
    }

    pub fn patch_remove(&mut self, address: LongAddress, remote_id: u16) {
        let key = address.addr.as_u16();
        if let Some(list) = self.by_addr.get_mut(&key) {
            list.retain(|b| !(b.address == address && b.remote_id == remote_id));
            if list.is_empty() {
                self.by_addr.remove(&key);
            }
        }
    }

    pub fn matches(&self, addr: u16) -> &[GenericBreakpoint] {
        self.by_addr.get(&addr).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_landings(&mut self, landings: impl IntoIterator<Item = u16>) {
        self.landings.clear();
        self.landings.extend(landings);
    }

    pub fn clear_landings(&mut self) {
        self.landings.clear();
    }

    pub fn is_landing(&self, addr: u16) -> bool {
        self.landings.contains(&addr)
    }

    pub fn landings(&self) -> &[u16] {
        &self.landings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bp(addr: u16, id: u16) -> GenericBreakpoint {
        let mut bp = GenericBreakpoint::manual(LongAddress::plain(addr));
        bp.remote_id = id;
        bp
    }

    #[test]
    fn registry_holds_multiple_kinds_per_address() {
        let mut reg = BreakpointRegistry::default();
        let addr = LongAddress::plain(0x8000);
        reg.add(bp(0x8000, 1));
        reg.add(GenericBreakpoint::logpoint(addr, "hit A={a}"));
        reg.add(GenericBreakpoint::assertion(addr, "sp < 0xFF00"));

        assert_eq!(reg.at(addr).len(), 3);
        assert_eq!(reg.len(), 3);

        // banked alias at the same 16-bit address is a different entry
        reg.add(GenericBreakpoint::manual(LongAddress::banked(0x8000, 2)));
        assert_eq!(reg.at(addr).len(), 3);
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn add_then_remove_restores_the_index() {
        let mut reg = BreakpointRegistry::default();
        reg.add(bp(0x4000, 1));
        reg.add(bp(0x5000, 2));

        let mut index = TemporaryBreakpointIndex::default();
        index.rebuild(&reg);
        assert_eq!(index.matches(0x4000).len(), 1);

        let extra = bp(0x4000, 3);
        index.patch_add(&extra);
        assert_eq!(index.matches(0x4000).len(), 2);

        index.patch_remove(extra.address, extra.remote_id);
        assert_eq!(index.matches(0x4000).len(), 1);
        assert_eq!(index.matches(0x4000)[0].remote_id, 1);
        assert_eq!(index.matches(0x5000).len(), 1);
    }

    #[test]
    fn disabled_logpoints_do_not_participate() {
        let mut reg = BreakpointRegistry::default();
        let mut lp = GenericBreakpoint::logpoint(LongAddress::plain(0x6000), "x");
        lp.enabled = false;
        reg.add(lp);

        let mut index = TemporaryBreakpointIndex::default();
        index.rebuild(&reg);
        assert!(index.matches(0x6000).is_empty());
    }

    #[test]
    fn landing_addresses_are_tracked_separately() {
        let mut index = TemporaryBreakpointIndex::default();
        index.set_landings([0x8003, 0x9000]);
        assert!(index.is_landing(0x8003));
        assert!(!index.is_landing(0x8000));
        index.clear_landings();
        assert!(!index.is_landing(0x8003));
    }

    #[test]
    fn watchpoint_coverage() {
        let wp = Watchpoint {
            address: 0xC000,
            size: 4,
            access: AccessMode::Write,
            condition: None,
        };
        assert!(wp.covers(0xC000, true));
        assert!(wp.covers(0xC003, true));
        assert!(!wp.covers(0xC004, true));
        assert!(!wp.covers(0xC000, false));
        assert_eq!(AccessMode::ReadWrite.code(), 0b11);
    }
}
