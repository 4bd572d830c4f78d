//! Command identifiers and the request model driven by the sequencer.
//!
//! A [`Request`] is one application-visible operation ([`Operation`], the
//! `def_cmd`). While it executes, `cur` tracks the AT command in flight inside
//! the operation's sub-command graph and `i` counts graph advances.

use embassy_time::Duration;
use heapless::{String, Vec};

use crate::config::TX_CAP;
use crate::connection::ConnHandle;
use crate::error::Error;

pub const HOST_LEN: usize = 128;
pub const APN_LEN: usize = 64;
pub const CRED_LEN: usize = 32;
pub const NUMBER_LEN: usize = 24;
pub const SMS_TEXT_LEN: usize = 160;
pub const USSD_LEN: usize = 32;
pub const INFO_LEN: usize = 32;

/// Generic AT command identifiers. The module descriptor binds the generic
/// verbs (`SOCKET_OPEN`, …) to one of these per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AtCmd {
    Idle,

    // Bring-up
    Atz,
    CpinGet,
    Ipr,
    ClccSet,
    QcfgNwScanMode,
    QcfgNwScanSeq,
    QcfgBand,
    QicfgTcpRetransCfg,
    Ats10,

    // Attach / detach
    CgactSet0,
    CgactSet1,
    CgattSet0,
    CgattSet1,
    CipShut,
    CipMuxSet,
    CipRxGetSet,
    CsttSet,
    Ciicr,
    Cifsr,
    CgregGet,
    QnwInfo,
    Qicsgp,
    QiactSet,
    QiactGet,

    // Sockets
    CipStatus,
    CipSsl,
    CipStart,
    CipClose,
    CipSend,
    QiState,
    QiOpen,
    QiClose,
    QiSend,

    // SMS
    #[cfg(feature = "sms")]
    CmgfSet,
    #[cfg(feature = "sms")]
    Cmgs,
    #[cfg(feature = "sms")]
    Cmgl,
    #[cfg(feature = "sms")]
    Cmgda,
    #[cfg(feature = "sms")]
    Qmgda,

    // Calls
    #[cfg(feature = "call")]
    Atd,
    #[cfg(feature = "call")]
    Ata,
    #[cfg(feature = "call")]
    Ath,

    #[cfg(feature = "ussd")]
    Cusd,
}

impl AtCmd {
    /// Reply budget: how long the sequencer waits for this command's terminal
    /// token before stamping `Error::Timeout`.
    pub(crate) fn reply_budget(self) -> Duration {
        match self {
            Self::CipStart | Self::QiOpen => Duration::from_secs(75),
            Self::Ciicr => Duration::from_secs(85),
            Self::CipShut => Duration::from_secs(65),
            Self::CipClose | Self::QiClose => Duration::from_secs(15),
            Self::CipSend | Self::QiSend => Duration::from_secs(30),
            #[cfg(feature = "sms")]
            Self::Cmgs | Self::Cmgl | Self::Cmgda | Self::Qmgda => Duration::from_secs(60),
            #[cfg(feature = "call")]
            Self::Atd => Duration::from_secs(30),
            #[cfg(feature = "ussd")]
            Self::Cusd => Duration::from_secs(30),
            _ => Duration::from_secs(10),
        }
    }

    /// `+TAG` owned by this command's reply, if any. A line carrying the tag is
    /// routed to command parsing instead of the URC dispatcher while the
    /// command is in flight.
    pub(crate) fn response_tag(self) -> Option<&'static str> {
        match self {
            Self::CpinGet => Some("+CPIN"),
            Self::CgregGet => Some("+CGREG"),
            Self::QnwInfo => Some("+QNWINFO"),
            Self::QiactGet => Some("+QIACT"),
            Self::QiState => Some("+QISTATE"),
            #[cfg(feature = "sms")]
            Self::Cmgs => Some("+CMGS"),
            #[cfg(feature = "sms")]
            Self::Cmgl => Some("+CMGL"),
            #[cfg(feature = "ussd")]
            Self::Cusd => Some("+CUSD"),
            _ => None,
        }
    }

    /// Commands whose payload phase starts with the `> ` prompt.
    pub(crate) fn wants_prompt(self) -> bool {
        match self {
            Self::CipSend | Self::QiSend => true,
            #[cfg(feature = "sms")]
            Self::Cmgs => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnType {
    Tcp,
    Udp,
    /// TCP over TLS; selected with `CIPSSL=1` on SIM800.
    Ssl,
}

impl ConnType {
    /// Type string on the wire. SSL connects as TCP, the TLS toggle is a
    /// separate command.
    pub(crate) fn as_at_str(self) -> &'static str {
        match self {
            Self::Tcp | Self::Ssl => "TCP",
            Self::Udp => "UDP",
        }
    }
}

/// Decision recorded by URC parsing while a connection open is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnResult {
    #[default]
    Pending,
    ConnectOk,
    ConnectError,
    AlreadyConnect,
}

#[cfg(feature = "sms")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SmsStatus {
    Read,
    Unread,
    Sent,
    Unsent,
    Inbox,
    All,
}

/// One application-visible operation with its payload.
#[derive(Debug)]
pub enum Operation {
    Reset,
    NetworkAttach {
        apn: String<APN_LEN>,
        user: String<CRED_LEN>,
        pass: String<CRED_LEN>,
    },
    NetworkDetach,
    ConnStart {
        conn_type: ConnType,
        host: String<HOST_LEN>,
        port: u16,
        idle_timeout: Option<Duration>,
        /// Slot picked at CIPSTART/QIOPEN initiation.
        num: u8,
        res: ConnResult,
    },
    ConnSend {
        handle: ConnHandle,
        data: Vec<u8, TX_CAP>,
    },
    ConnClose {
        handle: ConnHandle,
        /// Local-initiated close. Synthetic idle-timeout closes keep this set.
        forced: bool,
    },
    #[cfg(feature = "sms")]
    SmsSend {
        number: String<NUMBER_LEN>,
        text: String<SMS_TEXT_LEN>,
    },
    #[cfg(feature = "sms")]
    SmsList {
        /// Entries seen so far; returned as the request result.
        count: u8,
        /// `+CMGL` header waiting for its text line.
        pending: Option<crate::event::SmsEntry>,
    },
    #[cfg(feature = "sms")]
    SmsDeleteAll(SmsStatus),
    #[cfg(feature = "call")]
    CallStart { number: String<NUMBER_LEN> },
    #[cfg(feature = "call")]
    CallAnswer,
    #[cfg(feature = "call")]
    CallHangup,
    #[cfg(feature = "ussd")]
    Ussd { code: String<USSD_LEN> },
}

#[derive(Debug)]
pub struct Request {
    pub id: u32,
    pub op: Operation,
    /// AT command currently in flight within the sub-command graph.
    pub cur: AtCmd,
    /// Number of graph advances so far.
    pub i: u8,
    /// Synthetic requests (idle-timeout close) do not signal completion.
    pub(crate) internal: bool,
}

impl Request {
    pub(crate) fn new(id: u32, op: Operation) -> Self {
        Self {
            id,
            op,
            cur: AtCmd::Idle,
            i: 0,
            internal: false,
        }
    }

    pub(crate) fn internal(op: Operation) -> Self {
        Self {
            id: 0,
            op,
            cur: AtCmd::Idle,
            i: 0,
            internal: true,
        }
    }
}

/// Success payload of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    None,
    Conn(ConnHandle),
    #[cfg(feature = "sms")]
    SmsCount(u8),
}

pub type RequestResult = Result<Response, Error>;

/// Accumulated outcome of the command currently in flight. `+TAG` parsing may
/// set `ok` before the modem's terminal `OK` arrives (the token then only
/// confirms), or suppress a premature `OK` until the interesting line shows up.
#[derive(Debug, Default)]
pub(crate) struct CmdFlags {
    pub ok: bool,
    pub error: Option<Error>,
}

impl CmdFlags {
    pub fn fail(&mut self, e: Error) {
        self.ok = false;
        self.error = Some(e);
    }

    pub fn done(&self) -> bool {
        self.ok || self.error.is_some()
    }
}

/// Verdict of `process_sub_cmd`: continue the graph with another command
/// (optionally after a cooperative delay), or finish the request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SubCmd {
    Next {
        cmd: AtCmd,
        delay: Option<Duration>,
    },
    Done(Response),
    Fail(Error),
}

impl SubCmd {
    pub fn next(cmd: AtCmd) -> Self {
        Self::Next { cmd, delay: None }
    }

    pub fn next_after(cmd: AtCmd, delay: Duration) -> Self {
        Self::Next {
            cmd,
            delay: Some(delay),
        }
    }

    /// End-of-graph result from the last command's flags.
    pub fn finish(flags: &CmdFlags) -> Self {
        match flags.error {
            Some(e) => Self::Fail(e),
            None if flags.ok => Self::Done(Response::None),
            None => Self::Fail(Error::Failed),
        }
    }
}
