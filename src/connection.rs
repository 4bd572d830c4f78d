//! Fixed table of connection slots with per-slot generation counters.
//!
//! A [`ConnHandle`] carries the slot number plus the `val_id` generation the
//! slot had when the connection was activated. Any call presenting a handle
//! whose generation no longer matches is stale (the slot was closed and maybe
//! reused) and is rejected before anything is sent to the module.

use embassy_time::{Duration, Instant};
use no_std_net::IpAddr;

use crate::command::ConnType;
use crate::config::MAX_CONNS;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle {
    pub num: u8,
    pub val_id: u8,
}

#[derive(Debug)]
pub struct Connection {
    pub(crate) num: u8,
    pub(crate) val_id: u8,
    pub(crate) active: bool,
    pub(crate) client: bool,
    pub(crate) closing: bool,
    pub(crate) conn_type: ConnType,
    pub(crate) remote_ip: Option<IpAddr>,
    pub(crate) remote_port: u16,
    pub(crate) local_port: u16,
    pub(crate) last_activity: Option<Instant>,
    pub(crate) idle_timeout: Option<Duration>,
}

impl Connection {
    const fn empty(num: u8) -> Self {
        Self {
            num,
            val_id: 0,
            active: false,
            client: false,
            closing: false,
            conn_type: ConnType::Tcp,
            remote_ip: None,
            remote_port: 0,
            local_port: 0,
            last_activity: None,
            idle_timeout: None,
        }
    }

    pub fn handle(&self) -> ConnHandle {
        ConnHandle {
            num: self.num,
            val_id: self.val_id,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_ip
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

#[derive(Debug)]
pub struct ConnTable {
    conns: [Connection; MAX_CONNS],
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnTable {
    pub const fn new() -> Self {
        let mut conns = [const { Connection::empty(0) }; MAX_CONNS];
        let mut i = 0;
        while i < MAX_CONNS {
            conns[i].num = i as u8;
            i += 1;
        }
        Self { conns }
    }

    /// First inactive slot, lowest number first.
    pub fn free_slot(&self) -> Option<u8> {
        self.conns.iter().find(|c| !c.active).map(|c| c.num)
    }

    /// Activate a slot for a client connection, bumping its generation.
    /// Everything but `num`/`val_id` is reset first.
    pub fn activate(
        &mut self,
        num: u8,
        conn_type: ConnType,
        idle_timeout: Option<Duration>,
    ) -> ConnHandle {
        let c = &mut self.conns[num as usize];
        let val_id = c.val_id.wrapping_add(1);
        *c = Connection::empty(num);
        c.val_id = val_id;
        c.active = true;
        c.client = true;
        c.conn_type = conn_type;
        c.idle_timeout = idle_timeout;
        c.last_activity = Some(Instant::now());
        c.handle()
    }

    /// Look up an active connection by handle, rejecting stale generations.
    pub fn get(&self, handle: ConnHandle) -> Result<&Connection, Error> {
        let c = self
            .conns
            .get(handle.num as usize)
            .ok_or(Error::InvalidParam)?;
        if !c.active || c.val_id != handle.val_id {
            return Err(Error::Failed);
        }
        Ok(c)
    }

    pub(crate) fn get_mut(&mut self, handle: ConnHandle) -> Result<&mut Connection, Error> {
        let c = self
            .conns
            .get_mut(handle.num as usize)
            .ok_or(Error::InvalidParam)?;
        if !c.active || c.val_id != handle.val_id {
            return Err(Error::Failed);
        }
        Ok(c)
    }

    pub(crate) fn slot(&self, num: u8) -> Option<&Connection> {
        self.conns.get(num as usize)
    }

    pub(crate) fn slot_mut(&mut self, num: u8) -> Option<&mut Connection> {
        self.conns.get_mut(num as usize)
    }

    /// Deactivate a slot. Returns whether it was an active client connection,
    /// `None` if it was not active at all (nothing to report then).
    pub(crate) fn close(&mut self, num: u8) -> Option<bool> {
        let c = self.conns.get_mut(num as usize)?;
        if !c.active {
            return None;
        }
        c.active = false;
        c.closing = false;
        c.idle_timeout = None;
        Some(c.client)
    }

    /// Record traffic on a slot (defers its idle timeout).
    pub(crate) fn touch(&mut self, num: u8) {
        if let Some(c) = self.conns.get_mut(num as usize) {
            if c.active {
                c.last_activity = Some(Instant::now());
            }
        }
    }

    /// Active slots whose idle timeout has elapsed; marks them closing so the
    /// synthetic close request is only produced once.
    pub(crate) fn take_idle_expired(&mut self, now: Instant) -> impl Iterator<Item = ConnHandle> + '_ {
        self.conns.iter_mut().filter_map(move |c| {
            let timeout = c.idle_timeout?;
            let last = c.last_activity?;
            if c.active && !c.closing && now >= last + timeout {
                c.closing = true;
                Some(c.handle())
            } else {
                None
            }
        })
    }

    /// Deactivate everything (module reset). Generations are preserved so
    /// stale handles from before the reset keep failing validation.
    pub(crate) fn reset(&mut self) {
        for c in self.conns.iter_mut() {
            c.active = false;
            c.closing = false;
            c.idle_timeout = None;
            c.last_activity = None;
        }
    }
}
