//! Module dialects.
//!
//! Everything the sequencer does that differs between modem families goes
//! through [`ModuleOps`] on the active [`Module`]: binding generic verbs to AT
//! commands, formatting command lines, advancing the per-request sub-command
//! graph, and parsing dialect replies. Sub-graphs shared verbatim between the
//! two dialects (detach, SMS, calls, USSD, the reset prologue) live here.

pub mod bg95;
pub mod sim800;

use embassy_time::Duration;
use embedded_io_async::Write;

use crate::asynch::state::State;
use crate::command::{AtCmd, CmdFlags, Operation, Request, Response, SubCmd};
use crate::emitter::Emitter;
use crate::error::Error;
use crate::event::{Event, EventPublisher, SimState};
use crate::parser::Scanner;

/// Context handed to dialect hooks: the shared state and the event publisher.
pub(crate) struct Ctx<'a> {
    pub state: &'a State,
    pub events: &'a EventPublisher<'a>,
    pub use_high_baudrate: bool,
}

impl Ctx<'_> {
    pub fn emit(&self, event: Event) {
        self.events.publish_immediate(event);
    }

    /// Flip the attach flag; emits exactly one event per transition.
    pub fn set_attached(&self, attached: bool) {
        let changed = self.state.lock(|s| {
            if s.network.attached != attached {
                s.network.attached = attached;
                true
            } else {
                false
            }
        });
        if changed {
            info!("network {}", if attached { "attached" } else { "detached" });
            self.emit(if attached {
                Event::NetworkAttached
            } else {
                Event::NetworkDetached
            });
        }
    }

    /// Deactivate a slot and notify. Does nothing if the slot was not active
    /// (a second close must not produce a second event).
    pub fn conn_closed(&self, num: u8, forced: bool, res: Result<(), Error>) {
        if self.state.lock(|s| s.conns.close(num)).is_some() {
            self.emit(Event::ConnClose { num, forced, res });
        }
    }
}

pub(crate) trait ModuleOps {
    /// Baudrate switched to with `AT+IPR` when the config enables it.
    fn high_baudrate(&self) -> u32;

    /// First CREG/CGREG URC after reset is informational only.
    fn creg_cgreg_skip_first(&self) -> bool {
        false
    }

    fn reset_hold(&self) -> Duration {
        Duration::from_millis(150)
    }

    fn boot_wait(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Full `AT+CGACT` line for this dialect (argument form differs).
    fn cgact_line(&self, enable: bool) -> &'static str;

    fn socket_open_cmd(&self) -> AtCmd;
    fn socket_close_cmd(&self) -> AtCmd;
    fn socket_send_cmd(&self) -> AtCmd;
    fn socket_status_cmd(&self) -> AtCmd;

    /// Commands whose terminal `OK` arrives before the interesting reply and
    /// must not complete the exchange on its own.
    fn ok_suppressed(&self, cur: AtCmd) -> bool;

    /// First AT command of the operation's sub-command graph.
    fn first_cmd(&self, op: &Operation) -> AtCmd;

    /// Format and transmit the line for `req.cur`. Fails without emitting
    /// anything when the command is invalid here (stale handle, no free slot).
    async fn initiate_cmd<W: Write>(
        &self,
        at: &mut Emitter<W>,
        req: &mut Request,
        cx: &Ctx<'_>,
    ) -> Result<(), Error>;

    /// Advance the sub-command graph after `req.cur` finished with `flags`.
    fn process_sub_cmd(&self, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>) -> SubCmd;

    /// Dialect parsing of a reply/URC line while `req` is in flight.
    fn parse_plus(&self, line: &str, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>);

    /// Parsing of socket-status rows (`C:`/`STATE:` on SIM800, `+QISTATE:` on
    /// BG95) while the status command is current.
    fn parse_socket_status(&self, line: &str, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>);
}

#[derive(Debug, Clone, Copy)]
pub enum Module {
    Sim800(sim800::Sim800),
    Bg95(bg95::Bg95),
}

impl Module {
    pub fn sim800() -> Self {
        Self::Sim800(sim800::Sim800)
    }

    pub fn bg95() -> Self {
        Self::Bg95(bg95::Bg95)
    }
}

macro_rules! inner {
    ($self:ident, $fn:ident($($arg:expr),*)) => {
        match $self {
            Module::Sim800(m) => m.$fn($($arg),*),
            Module::Bg95(m) => m.$fn($($arg),*),
        }
    };
}

impl ModuleOps for Module {
    fn high_baudrate(&self) -> u32 {
        inner!(self, high_baudrate())
    }

    fn creg_cgreg_skip_first(&self) -> bool {
        inner!(self, creg_cgreg_skip_first())
    }

    fn reset_hold(&self) -> Duration {
        inner!(self, reset_hold())
    }

    fn boot_wait(&self) -> Duration {
        inner!(self, boot_wait())
    }

    fn cgact_line(&self, enable: bool) -> &'static str {
        inner!(self, cgact_line(enable))
    }

    fn socket_open_cmd(&self) -> AtCmd {
        inner!(self, socket_open_cmd())
    }

    fn socket_close_cmd(&self) -> AtCmd {
        inner!(self, socket_close_cmd())
    }

    fn socket_send_cmd(&self) -> AtCmd {
        inner!(self, socket_send_cmd())
    }

    fn socket_status_cmd(&self) -> AtCmd {
        inner!(self, socket_status_cmd())
    }

    fn ok_suppressed(&self, cur: AtCmd) -> bool {
        inner!(self, ok_suppressed(cur))
    }

    fn first_cmd(&self, op: &Operation) -> AtCmd {
        inner!(self, first_cmd(op))
    }

    async fn initiate_cmd<W: Write>(
        &self,
        at: &mut Emitter<W>,
        req: &mut Request,
        cx: &Ctx<'_>,
    ) -> Result<(), Error> {
        match self {
            Module::Sim800(m) => m.initiate_cmd(at, req, cx).await,
            Module::Bg95(m) => m.initiate_cmd(at, req, cx).await,
        }
    }

    fn process_sub_cmd(&self, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>) -> SubCmd {
        inner!(self, process_sub_cmd(req, flags, cx))
    }

    fn parse_plus(&self, line: &str, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>) {
        inner!(self, parse_plus(line, req, flags, cx))
    }

    fn parse_socket_status(
        &self,
        line: &str,
        req: &mut Request,
        flags: &mut CmdFlags,
        cx: &Ctx<'_>,
    ) {
        inner!(self, parse_socket_status(line, req, flags, cx))
    }
}

/// First command for the operations whose graphs are dialect-independent.
pub(crate) fn common_first_cmd(me: &impl ModuleOps, op: &Operation) -> Option<AtCmd> {
    Some(match op {
        Operation::Reset => AtCmd::Atz,
        Operation::NetworkDetach => AtCmd::CgattSet0,
        Operation::ConnStart { .. } => me.socket_status_cmd(),
        Operation::ConnSend { .. } => me.socket_send_cmd(),
        Operation::ConnClose { .. } => me.socket_close_cmd(),
        #[cfg(feature = "sms")]
        Operation::SmsSend { .. } | Operation::SmsList { .. } => AtCmd::CmgfSet,
        #[cfg(feature = "call")]
        Operation::CallStart { .. } => AtCmd::Atd,
        #[cfg(feature = "call")]
        Operation::CallAnswer => AtCmd::Ata,
        #[cfg(feature = "call")]
        Operation::CallHangup => AtCmd::Ath,
        #[cfg(feature = "ussd")]
        Operation::Ussd { .. } => AtCmd::Cusd,
        _ => return None,
    })
}

/// Emit the AT line for commands both dialects share. Returns `false` when the
/// command is not one of them.
pub(crate) async fn emit_common<W: Write>(
    me: &impl ModuleOps,
    at: &mut Emitter<W>,
    req: &mut Request,
    _cx: &Ctx<'_>,
) -> Result<bool, Error> {
    match req.cur {
        AtCmd::Atz => at.const_line("ATZ").await?,
        AtCmd::CpinGet => at.const_line("AT+CPIN?").await?,
        AtCmd::Ipr => {
            at.begin().await?;
            at.str("+IPR=").await?;
            at.number(me.high_baudrate(), false, false).await?;
            at.end().await?;
        }
        AtCmd::CgactSet0 => at.const_line(me.cgact_line(false)).await?,
        AtCmd::CgactSet1 => at.const_line(me.cgact_line(true)).await?,
        AtCmd::CgattSet0 => at.const_line("AT+CGATT=0").await?,
        AtCmd::CgattSet1 => at.const_line("AT+CGATT=1").await?,
        AtCmd::CgregGet => at.const_line("AT+CGREG?").await?,
        #[cfg(feature = "sms")]
        AtCmd::CmgfSet => at.const_line("AT+CMGF=1").await?,
        #[cfg(feature = "sms")]
        AtCmd::Cmgs => {
            let Operation::SmsSend { number, .. } = &req.op else {
                return Err(Error::InvalidParam);
            };
            at.begin().await?;
            at.str("+CMGS=").await?;
            at.arg(number, false, true, false).await?;
            at.end().await?;
        }
        #[cfg(feature = "sms")]
        AtCmd::Cmgl => {
            at.begin().await?;
            at.str("+CMGL=").await?;
            at.arg("ALL", false, true, false).await?;
            at.end().await?;
        }
        #[cfg(feature = "call")]
        AtCmd::Atd => {
            let Operation::CallStart { number } = &req.op else {
                return Err(Error::InvalidParam);
            };
            at.begin().await?;
            at.str("D").await?;
            at.arg(number, false, false, false).await?;
            at.str(";").await?;
            at.end().await?;
        }
        #[cfg(feature = "call")]
        AtCmd::Ata => at.const_line("ATA").await?,
        #[cfg(feature = "call")]
        AtCmd::Ath => at.const_line("ATH").await?,
        #[cfg(feature = "ussd")]
        AtCmd::Cusd => {
            let Operation::Ussd { code } = &req.op else {
                return Err(Error::InvalidParam);
            };
            at.begin().await?;
            at.str("+CUSD=1").await?;
            at.arg(code, true, true, true).await?;
            at.str(",15").await?;
            at.end().await?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// Detach graph: CGATT=0 → CGACT=0 → socket status; always reports success
/// once the table runs out.
pub(crate) fn process_detach(me: &impl ModuleOps, req: &Request, cx: &Ctx<'_>) -> SubCmd {
    match req.cur {
        AtCmd::CgattSet0 => SubCmd::next(AtCmd::CgactSet0),
        AtCmd::CgactSet0 => SubCmd::next(me.socket_status_cmd()),
        _ => {
            cx.set_attached(false);
            SubCmd::Done(Response::None)
        }
    }
}

/// Send completion shared by CIPSEND/QISEND.
pub(crate) fn process_send(req: &Request, flags: &CmdFlags, cx: &Ctx<'_>) -> SubCmd {
    let Operation::ConnSend { handle, data } = &req.op else {
        return SubCmd::Fail(Error::InvalidParam);
    };
    match flags.error {
        None if flags.ok => {
            cx.state.lock(|s| s.conns.touch(handle.num));
            cx.emit(Event::ConnSend {
                num: handle.num,
                len: data.len(),
                res: Ok(()),
            });
            SubCmd::Done(Response::None)
        }
        e => {
            let e = e.unwrap_or(Error::Failed);
            cx.emit(Event::ConnSend {
                num: handle.num,
                len: data.len(),
                res: Err(e),
            });
            SubCmd::Fail(e)
        }
    }
}

/// Close completion shared by CIPCLOSE/QICLOSE. The module is known to report
/// ERROR while the socket is in fact gone, so the slot is released either way.
pub(crate) fn process_close(req: &Request, flags: &CmdFlags, cx: &Ctx<'_>) -> SubCmd {
    let Operation::ConnClose { handle, forced } = &req.op else {
        return SubCmd::Fail(Error::InvalidParam);
    };
    if flags.error.is_some() {
        cx.conn_closed(handle.num, *forced, Err(Error::Failed));
        SubCmd::Fail(Error::Failed)
    } else {
        cx.conn_closed(handle.num, *forced, Ok(()));
        SubCmd::Done(Response::None)
    }
}

/// SMS graphs (send / list / delete-all) shared by both dialects.
#[cfg(feature = "sms")]
pub(crate) fn process_sms(req: &mut Request, flags: &CmdFlags) -> Option<SubCmd> {
    match (&req.op, req.cur) {
        (Operation::SmsSend { .. }, AtCmd::CmgfSet) => Some(match flags.error {
            Some(e) => SubCmd::Fail(e),
            None => SubCmd::next(AtCmd::Cmgs),
        }),
        (Operation::SmsSend { .. }, AtCmd::Cmgs) => Some(SubCmd::finish(flags)),
        (Operation::SmsList { .. }, AtCmd::CmgfSet) => Some(match flags.error {
            Some(e) => SubCmd::Fail(e),
            None => SubCmd::next(AtCmd::Cmgl),
        }),
        (Operation::SmsList { count, .. }, AtCmd::Cmgl) => Some(match flags.error {
            Some(e) => SubCmd::Fail(e),
            None => SubCmd::Done(Response::SmsCount(*count)),
        }),
        (Operation::SmsDeleteAll(_), _) => Some(SubCmd::finish(flags)),
        _ => None,
    }
}

/// Reply parsing shared by both dialects: SIM state, CGREG responses, CIFSR's
/// bare address, SMS list rows and send results.
pub(crate) fn parse_common(
    me: &impl ModuleOps,
    line: &str,
    req: &mut Request,
    flags: &mut CmdFlags,
    cx: &Ctx<'_>,
) {
    match req.cur {
        AtCmd::CpinGet => {
            if let Some(rest) = line.strip_prefix("+CPIN:") {
                let sim = parse_sim_state(rest.trim());
                cx.state.lock(|s| s.sim = sim);
                cx.emit(Event::SimState(sim));
                if sim != SimState::Ready {
                    warn!("SIM not ready");
                }
            }
        }
        AtCmd::CgregGet => {
            if let Some(rest) = line.strip_prefix("+CGREG:") {
                let mut s = Scanner::new(rest);
                // Response form is `<n>,<stat>`; tolerate a bare `<stat>`.
                let first = s.number();
                let stat = s.number().or(first).unwrap_or(0);
                cx.state.lock(|st| st.network.cgreg = (stat as u8).into());
            }
        }
        AtCmd::Cifsr => {
            // CIFSR answers with the bare address and no OK.
            if let Some(ip) = crate::parser::bare_ip(line) {
                cx.state.lock(|s| s.network.ip = Some(ip));
                flags.ok = true;
            }
        }
        _ => {}
    }

    if req.cur == me.socket_send_cmd() {
        parse_send_result(line, req, flags);
    }

    if req.cur == me.socket_close_cmd() {
        // SIM800 multi-connection close replies `<n>, CLOSE OK`.
        if let Some((_, rest)) = split_conn_prefix(line) {
            if rest == "CLOSE OK" {
                flags.ok = true;
            }
        }
    }

    #[cfg(feature = "sms")]
    parse_sms_list(line, req, flags, cx);

    #[cfg(feature = "ussd")]
    if req.cur == AtCmd::Cusd {
        if line == "CUSTOM_OK" {
            flags.ok = true;
        } else if let Some(rest) = line.strip_prefix("+CUSD:") {
            let mut s = Scanner::new(rest);
            s.number();
            if let Some(text) = s.quoted() {
                cx.emit(Event::Ussd(text));
            }
            flags.ok = true;
        }
    }
}

fn parse_send_result(line: &str, req: &Request, flags: &mut CmdFlags) {
    let (num, rest) = match split_conn_prefix(line) {
        Some((n, r)) => (Some(n), r),
        None => (None, line),
    };
    if let Operation::ConnSend { handle, .. } = &req.op {
        if let Some(n) = num {
            if n != handle.num {
                return;
            }
        }
        match rest {
            "SEND OK" => flags.ok = true,
            "SEND FAIL" => flags.fail(Error::Failed),
            _ => {}
        }
    }
}

#[cfg(feature = "sms")]
fn parse_sms_list(line: &str, req: &mut Request, _flags: &mut CmdFlags, cx: &Ctx<'_>) {
    use crate::event::SmsEntry;

    if req.cur != AtCmd::Cmgl {
        return;
    }
    let Operation::SmsList { count, pending } = &mut req.op else {
        return;
    };
    if let Some(rest) = line.strip_prefix("+CMGL:") {
        let mut s = Scanner::new(rest);
        let pos = s.number().unwrap_or(0) as u16;
        let status = s.quoted().unwrap_or_default();
        let number = s.quoted().unwrap_or_default();
        *pending = Some(SmsEntry {
            pos,
            status,
            number,
            text: heapless::String::new(),
        });
    } else if let Some(mut entry) = pending.take() {
        // The text body follows on the next line.
        entry.text.push_str(line).ok();
        *count = count.saturating_add(1);
        cx.emit(Event::SmsListed(entry));
    }
}

/// Split `"<n>, REST"` lines (connection-prefixed URCs and results).
pub(crate) fn split_conn_prefix(line: &str) -> Option<(u8, &str)> {
    let mut chars = line.as_bytes();
    if chars.len() < 3 || !chars[0].is_ascii_digit() {
        return None;
    }
    let num = chars[0] - b'0';
    chars = &chars[1..];
    if !chars.starts_with(b", ") {
        return None;
    }
    Some((num, &line[3..]))
}

pub(crate) fn parse_sim_state(s: &str) -> SimState {
    match s {
        "READY" => SimState::Ready,
        "SIM PIN" => SimState::PinRequired,
        "SIM PUK" => SimState::PukRequired,
        "NOT INSERTED" => SimState::NotInserted,
        _ => SimState::Unknown,
    }
}
