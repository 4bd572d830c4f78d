//! Application events.
//!
//! The sequencer publishes lifecycle events on a pub/sub channel; applications
//! subscribe through [`crate::asynch::Resources::events`]. Events belonging to
//! a request are published strictly before the request completes. Publishing is
//! immediate: a subscriber that lags more than the channel capacity loses the
//! oldest events and sees `WaitResult::Lagged`.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{DynPublisher, DynSubscriber, PubSubChannel};
use heapless::{String, Vec};

use crate::command::INFO_LEN;
#[cfg(any(feature = "call", feature = "sms"))]
use crate::command::NUMBER_LEN;
use crate::config::RECV_CAP;
use crate::error::Error;

pub type EventChannel<const CAP: usize, const SUBS: usize> =
    PubSubChannel<CriticalSectionRawMutex, Event, CAP, SUBS, 1>;
pub type EventPublisher<'a> = DynPublisher<'a, Event>;
pub type EventSubscriber<'a> = DynSubscriber<'a, Event>;

/// SIM card state from `+CPIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SimState {
    Ready,
    PinRequired,
    PukRequired,
    NotInserted,
    Unknown,
}

#[cfg(feature = "call")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CallState {
    Active,
    Held,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
    Disconnect,
}

#[cfg(feature = "call")]
impl From<u8> for CallState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Held,
            2 => Self::Dialing,
            3 => Self::Alerting,
            4 => Self::Incoming,
            5 => Self::Waiting,
            _ => Self::Disconnect,
        }
    }
}

#[cfg(feature = "call")]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CallInfo {
    pub id: u8,
    /// Mobile-originated when false.
    pub incoming: bool,
    pub state: CallState,
    pub number: String<NUMBER_LEN>,
}

#[cfg(feature = "sms")]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SmsEntry {
    pub pos: u16,
    pub status: String<16>,
    pub number: String<NUMBER_LEN>,
    pub text: String<{ crate::command::SMS_TEXT_LEN }>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Module bring-up finished.
    DeviceReset,
    NetworkAttached,
    NetworkDetached,
    /// Operator/RAT info (`+QNWINFO`).
    NetworkInfo(String<INFO_LEN>),
    SimState(SimState),
    ConnActive {
        num: u8,
        client: bool,
        forced: bool,
    },
    /// A connection open failed; delivered instead of `ConnActive`.
    ConnError {
        num: u8,
        err: Error,
    },
    ConnClose {
        num: u8,
        /// Close initiated on our side (request or idle timeout) rather than
        /// by the peer/module.
        forced: bool,
        res: Result<(), Error>,
    },
    ConnDataRecv {
        num: u8,
        data: Vec<u8, RECV_CAP>,
    },
    ConnSend {
        num: u8,
        len: usize,
        res: Result<(), Error>,
    },
    #[cfg(feature = "call")]
    CallRing,
    #[cfg(feature = "call")]
    CallChanged(CallInfo),
    /// `+CMTI`: an SMS arrived in module storage.
    #[cfg(feature = "sms")]
    SmsRecv { mem: String<8>, pos: u16 },
    /// One entry of an `SmsList` request.
    #[cfg(feature = "sms")]
    SmsListed(SmsEntry),
    #[cfg(feature = "ussd")]
    Ussd(String<{ crate::command::SMS_TEXT_LEN }>),
}
