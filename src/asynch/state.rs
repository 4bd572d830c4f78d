//! Engine state shared between the sequencer task and application threads.
//!
//! The sequencer is the only writer; application threads take short read
//! (validation) sections through the same mutex. This is the process-wide
//! protect/unprotect of the engine: everything behind one blocking mutex with
//! interior mutability, never held across an await point.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use no_std_net::Ipv4Addr;

use crate::connection::{ConnHandle, ConnTable};
use crate::error::Error;
use crate::event::SimState;
use crate::registration::{NetworkState, Status};

pub(crate) struct Shared {
    pub conns: ConnTable,
    pub network: NetworkState,
    pub sim: SimState,
    next_id: u32,
}

pub struct State {
    shared: Mutex<CriticalSectionRawMutex, RefCell<Shared>>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub const fn new() -> Self {
        Self {
            shared: Mutex::new(RefCell::new(Shared {
                conns: ConnTable::new(),
                network: NetworkState::new(),
                sim: SimState::Unknown,
                next_id: 1,
            })),
        }
    }

    pub(crate) fn lock<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        self.shared.lock(|s| f(&mut s.borrow_mut()))
    }

    pub(crate) fn alloc_id(&self) -> u32 {
        self.lock(|s| {
            let id = s.next_id;
            s.next_id = s.next_id.wrapping_add(1).max(1);
            id
        })
    }

    /// Clear runtime state after a module reset. Slot generations survive so
    /// pre-reset handles stay invalid.
    pub(crate) fn reset_runtime(&self) {
        self.lock(|s| {
            s.conns.reset();
            s.network.reset();
        })
    }

    pub fn is_attached(&self) -> bool {
        self.lock(|s| s.network.attached)
    }

    /// (CREG, CGREG) registration status.
    pub fn registration(&self) -> (Status, Status) {
        self.lock(|s| (s.network.creg, s.network.cgreg))
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.lock(|s| s.network.ip)
    }

    pub fn sim_state(&self) -> SimState {
        self.lock(|s| s.sim)
    }

    /// Validate a handle against the current slot generation.
    pub fn validate(&self, handle: ConnHandle) -> Result<(), Error> {
        self.lock(|s| s.conns.get(handle).map(|_| ()))
    }
}
