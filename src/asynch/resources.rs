//! Statically-allocatable storage for the engine: every channel, signal and
//! the shared state live here so the whole driver can sit in a `static`.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;

use super::state::State;
use crate::command::{Request, RequestResult};
use crate::config::REQUEST_QUEUE_LEN;
use crate::event::{EventChannel, EventSubscriber};
use crate::ingress::LineChannel;

pub(crate) type RequestChannel =
    Channel<CriticalSectionRawMutex, Request, REQUEST_QUEUE_LEN>;
pub(crate) type DoneSignal = Signal<CriticalSectionRawMutex, (u32, RequestResult)>;

pub struct Resources<const EVENT_CAP: usize = 8, const EVENT_SUBS: usize = 2> {
    pub(crate) state: State,
    pub(crate) requests: RequestChannel,
    pub(crate) lines: LineChannel,
    pub(crate) done: DoneSignal,
    /// Serializes submitters so each waits for its own completion in FIFO
    /// order.
    pub(crate) submit_lock: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) events: EventChannel<EVENT_CAP, EVENT_SUBS>,
}

impl<const EVENT_CAP: usize, const EVENT_SUBS: usize> Default
    for Resources<EVENT_CAP, EVENT_SUBS>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const EVENT_CAP: usize, const EVENT_SUBS: usize> Resources<EVENT_CAP, EVENT_SUBS> {
    pub const fn new() -> Self {
        Self {
            state: State::new(),
            requests: Channel::new(),
            lines: Channel::new(),
            done: Signal::new(),
            submit_lock: Mutex::new(()),
            events: EventChannel::new(),
        }
    }

    /// Subscribe to engine events. Fails (None) once all `EVENT_SUBS` slots
    /// are taken.
    pub fn events(&self) -> Option<EventSubscriber<'_>> {
        self.events.dyn_subscriber().ok()
    }
}
