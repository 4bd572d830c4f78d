//! Quectel BG95 dialect.
//!
//! Attach waits for packet registration (`CGREG?` polled with a 3 s backoff),
//! then configures the context with `QICSGP` and activates it with `QIACT`.
//! Socket opens are asynchronous: `QIOPEN` answers `OK` immediately and the
//! decision arrives as `+QIOPEN: <id>,<err>`, so `QISTATE` is polled (bounded)
//! until the URC has landed.

use embassy_time::Duration;
use embedded_io_async::Write;
use no_std_net::IpAddr;

use super::{
    common_first_cmd, emit_common, parse_common, process_close, process_detach, process_send,
    Ctx, ModuleOps,
};
use crate::command::{AtCmd, CmdFlags, ConnResult, Operation, Request, Response, SubCmd};
use crate::config::MAX_CONNS;
use crate::emitter::Emitter;
use crate::error::Error;
use crate::event::Event;
use crate::parser::Scanner;

/// Extra QISTATE rounds (100 ms apart) allowed before an undecided open is
/// abandoned.
const OPEN_POLL_BOUND: u8 = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct Bg95;

impl Bg95 {
    fn process_open(&self, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>) -> SubCmd {
        let Operation::ConnStart { num, res, .. } = &mut req.op else {
            return SubCmd::Fail(Error::InvalidParam);
        };
        match (req.i, req.cur) {
            (0, AtCmd::QiState) => {
                if flags.ok {
                    SubCmd::next(AtCmd::QiOpen)
                } else {
                    SubCmd::finish(flags)
                }
            }
            (1, AtCmd::QiOpen) => {
                if flags.error.is_some() {
                    // `+QIOPEN: <id>,<err>` landed before the terminal token;
                    // no point in polling status for a dead open.
                    *res = ConnResult::ConnectError;
                    cx.emit(Event::ConnError {
                        num: *num,
                        err: Error::ConnFail,
                    });
                    SubCmd::Fail(Error::ConnFail)
                } else {
                    SubCmd::next_after(AtCmd::QiState, Duration::from_millis(100))
                }
            }
            (_, AtCmd::QiState) => match *res {
                ConnResult::ConnectOk => {
                    let handle = cx.state.lock(|s| s.conns.slot(*num).map(|c| c.handle()));
                    match handle {
                        Some(handle) => {
                            cx.emit(Event::ConnActive {
                                num: *num,
                                client: true,
                                forced: true,
                            });
                            SubCmd::Done(Response::Conn(handle))
                        }
                        None => SubCmd::Fail(Error::Failed),
                    }
                }
                ConnResult::ConnectError | ConnResult::AlreadyConnect => {
                    cx.emit(Event::ConnError {
                        num: *num,
                        err: Error::ConnFail,
                    });
                    SubCmd::Fail(Error::ConnFail)
                }
                ConnResult::Pending => {
                    if req.i >= 2 + OPEN_POLL_BOUND {
                        cx.emit(Event::ConnError {
                            num: *num,
                            err: Error::ConnTimeout,
                        });
                        SubCmd::Fail(Error::ConnTimeout)
                    } else {
                        SubCmd::next_after(AtCmd::QiState, Duration::from_millis(100))
                    }
                }
            },
            _ => SubCmd::finish(flags),
        }
    }

    fn process_attach(&self, req: &Request, flags: &CmdFlags, cx: &Ctx<'_>) -> SubCmd {
        match req.cur {
            AtCmd::CgregGet => {
                if let Some(e) = flags.error {
                    return SubCmd::Fail(e);
                }
                if cx.state.lock(|s| s.network.cgreg).attachable() {
                    SubCmd::next(AtCmd::QnwInfo)
                } else {
                    SubCmd::next_after(AtCmd::CgregGet, Duration::from_secs(3))
                }
            }
            AtCmd::QnwInfo => SubCmd::next(AtCmd::Qicsgp),
            AtCmd::Qicsgp => SubCmd::next(AtCmd::QiactSet),
            AtCmd::QiactSet => SubCmd::next(AtCmd::QiactGet),
            AtCmd::QiactGet => {
                if cx.state.lock(|s| s.network.attached) {
                    SubCmd::finish(flags)
                } else {
                    SubCmd::next_after(AtCmd::QiactSet, Duration::from_millis(100))
                }
            }
            _ => SubCmd::finish(flags),
        }
    }
}

impl ModuleOps for Bg95 {
    fn high_baudrate(&self) -> u32 {
        921_600
    }

    fn creg_cgreg_skip_first(&self) -> bool {
        true
    }

    fn cgact_line(&self, enable: bool) -> &'static str {
        if enable {
            "AT+CGACT=1,1"
        } else {
            "AT+CGACT=0,1"
        }
    }

    fn socket_open_cmd(&self) -> AtCmd {
        AtCmd::QiOpen
    }

    fn socket_close_cmd(&self) -> AtCmd {
        AtCmd::QiClose
    }

    fn socket_send_cmd(&self) -> AtCmd {
        AtCmd::QiSend
    }

    fn socket_status_cmd(&self) -> AtCmd {
        AtCmd::QiState
    }

    fn ok_suppressed(&self, cur: AtCmd) -> bool {
        match cur {
            #[cfg(feature = "ussd")]
            AtCmd::Cusd => true,
            _ => {
                let _ = cur;
                false
            }
        }
    }

    fn first_cmd(&self, op: &Operation) -> AtCmd {
        if let Some(cmd) = common_first_cmd(self, op) {
            return cmd;
        }
        match op {
            Operation::NetworkAttach { .. } => AtCmd::CgregGet,
            #[cfg(feature = "sms")]
            Operation::SmsDeleteAll(_) => AtCmd::Qmgda,
            _ => AtCmd::Idle,
        }
    }

    async fn initiate_cmd<W: Write>(
        &self,
        at: &mut Emitter<W>,
        req: &mut Request,
        cx: &Ctx<'_>,
    ) -> Result<(), Error> {
        match req.cur {
            AtCmd::QcfgNwScanMode => at.const_line("AT+QCFG=\"nwscanmode\",0,1").await?,
            AtCmd::QcfgNwScanSeq => at.const_line("AT+QCFG=\"nwscanseq\",00").await?,
            AtCmd::QcfgBand => {
                at.const_line(
                    "AT+QCFG=\"band\",F,100002000000000F0E389F,100042000000000B0E189F,1",
                )
                .await?
            }
            AtCmd::QicfgTcpRetransCfg => at.const_line("AT+QICFG=\"tcp/retranscfg\",20,200").await?,
            AtCmd::Ats10 => at.const_line("ATS10=2").await?,
            AtCmd::QnwInfo => at.const_line("AT+QNWINFO").await?,
            AtCmd::QiactSet => at.const_line("AT+QIACT=1").await?,
            AtCmd::QiactGet => at.const_line("AT+QIACT?").await?,
            AtCmd::QiState => at.const_line("AT+QISTATE").await?,
            AtCmd::Qicsgp => {
                let Operation::NetworkAttach { apn, user, pass } = &req.op else {
                    return Err(Error::InvalidParam);
                };
                at.begin().await?;
                at.str("+QICSGP=1,1").await?;
                at.arg(apn, true, true, true).await?;
                at.arg(user, true, true, true).await?;
                at.arg(pass, true, true, true).await?;
                at.end().await?;
            }
            AtCmd::QiOpen => {
                let Operation::ConnStart {
                    conn_type,
                    host,
                    port,
                    num,
                    ..
                } = &mut req.op
                else {
                    return Err(Error::InvalidParam);
                };
                let slot = cx
                    .state
                    .lock(|s| s.conns.free_slot())
                    .ok_or(Error::NoFreeConn)?;
                *num = slot;
                at.begin().await?;
                at.str("+QIOPEN=1,").await?;
                at.number(slot as u32, false, false).await?;
                at.arg(conn_type.as_at_str(), false, true, true).await?;
                at.arg(host, false, true, true).await?;
                at.port(*port, false, true).await?;
                // Local port 0: assigned automatically for TCP/UDP clients.
                at.number(0, false, true).await?;
                at.end().await?;
            }
            AtCmd::QiClose => {
                let Operation::ConnClose { handle, .. } = &req.op else {
                    return Err(Error::InvalidParam);
                };
                cx.state.validate(*handle)?;
                at.begin().await?;
                at.str("+QICLOSE=").await?;
                at.number(handle.num as u32, false, false).await?;
                at.end().await?;
            }
            AtCmd::QiSend => {
                let Operation::ConnSend { handle, data } = &req.op else {
                    return Err(Error::InvalidParam);
                };
                cx.state.validate(*handle)?;
                at.begin().await?;
                at.str("+QISEND=").await?;
                at.number(handle.num as u32, false, false).await?;
                at.number(data.len() as u32, false, true).await?;
                at.end().await?;
            }
            #[cfg(feature = "sms")]
            AtCmd::Qmgda => {
                use crate::command::SmsStatus;
                let Operation::SmsDeleteAll(status) = &req.op else {
                    return Err(Error::InvalidParam);
                };
                let which = match status {
                    SmsStatus::Read => "DEL READ",
                    SmsStatus::Unread => "DEL UNREAD",
                    SmsStatus::Sent => "DEL SENT",
                    SmsStatus::Unsent => "DEL UNSENT",
                    SmsStatus::Inbox => "DEL INBOX",
                    SmsStatus::All => "DEL ALL",
                };
                at.begin().await?;
                at.str("+QMGDA=").await?;
                at.arg(which, false, true, false).await?;
                at.end().await?;
            }
            _ => {
                if !emit_common(self, at, req, cx).await? {
                    return Err(Error::Failed);
                }
            }
        }
        Ok(())
    }

    fn process_sub_cmd(&self, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>) -> SubCmd {
        match &req.op {
            Operation::Reset => match req.cur {
                AtCmd::Atz => SubCmd::next(AtCmd::CpinGet),
                AtCmd::CpinGet if cx.use_high_baudrate => SubCmd::next(AtCmd::Ipr),
                AtCmd::CpinGet => SubCmd::next(AtCmd::QcfgNwScanMode),
                AtCmd::Ipr => {
                    SubCmd::next_after(AtCmd::QcfgNwScanMode, Duration::from_millis(500))
                }
                AtCmd::QcfgNwScanMode => SubCmd::next(AtCmd::QcfgNwScanSeq),
                AtCmd::QcfgNwScanSeq => SubCmd::next(AtCmd::QcfgBand),
                AtCmd::QcfgBand => SubCmd::next(AtCmd::QicfgTcpRetransCfg),
                AtCmd::QicfgTcpRetransCfg => SubCmd::next(AtCmd::Ats10),
                AtCmd::Ats10 => {
                    cx.emit(Event::DeviceReset);
                    SubCmd::Done(Response::None)
                }
                _ => SubCmd::finish(flags),
            },
            Operation::NetworkAttach { .. } => self.process_attach(req, flags, cx),
            Operation::NetworkDetach => process_detach(self, req, cx),
            Operation::ConnStart { .. } => self.process_open(req, flags, cx),
            Operation::ConnSend { .. } => process_send(req, flags, cx),
            Operation::ConnClose { .. } => process_close(req, flags, cx),
            #[cfg(feature = "sms")]
            Operation::SmsSend { .. } | Operation::SmsList { .. } | Operation::SmsDeleteAll(_) => {
                super::process_sms(req, flags).unwrap_or_else(|| SubCmd::finish(flags))
            }
            #[allow(unreachable_patterns)]
            _ => SubCmd::finish(flags),
        }
    }

    fn parse_plus(&self, line: &str, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>) {
        if let Some(rest) = line.strip_prefix("+QNWINFO:") {
            let mut s = Scanner::new(rest);
            if let Some(info) = s.quoted() {
                cx.state.lock(|st| st.network.info = Some(info.clone()));
                cx.emit(Event::NetworkInfo(info));
            }
            return;
        }
        if let Some(rest) = line.strip_prefix("+QIACT:") {
            // +QIACT: <ctx>,<state>,<type>,"<ip>" — success is known before
            // the terminal OK, which then only confirms.
            let mut s = Scanner::new(rest);
            let _ctx_id = s.number();
            let active = s.number() == Some(1);
            let _ctx_type = s.number();
            let ip = s.ip();
            cx.state.lock(|st| st.network.ip = ip);
            cx.set_attached(active);
            flags.ok = true;
            return;
        }
        if let Some(rest) = line.strip_prefix("+QIOPEN:") {
            let mut s = Scanner::new(rest);
            let (Some(id), Some(err)) = (s.number(), s.number()) else {
                return;
            };
            if id as usize >= MAX_CONNS {
                return;
            }
            if let Operation::ConnStart {
                conn_type,
                idle_timeout,
                num,
                res,
                ..
            } = &mut req.op
            {
                if err == 0 {
                    *num = id as u8;
                    cx.state
                        .lock(|s| s.conns.activate(id as u8, *conn_type, *idle_timeout));
                    *res = ConnResult::ConnectOk;
                } else {
                    warn!("+QIOPEN error {}", err);
                    *res = ConnResult::ConnectError;
                    flags.fail(Error::ConnFail);
                }
            }
            return;
        }
        parse_common(self, line, req, flags, cx);
    }

    fn parse_socket_status(
        &self,
        line: &str,
        req: &mut Request,
        flags: &mut CmdFlags,
        cx: &Ctx<'_>,
    ) {
        let Some(rest) = line.strip_prefix("+QISTATE:") else {
            // Non-row lines during QISTATE still carry command context.
            parse_common(self, line, req, flags, cx);
            return;
        };
        let mut s = Scanner::new(rest);
        let Some(num) = s.number() else { return };
        if num as usize >= MAX_CONNS {
            return;
        }
        let _service_type: Option<heapless::String<16>> = s.quoted();
        let ip = s.ip();
        let remote_port = s.number();
        let local_port = s.number();
        let _socket_state = s.number();

        cx.state.lock(|sh| {
            if let Some(c) = sh.conns.slot_mut(num as u8) {
                c.remote_ip = ip.map(IpAddr::V4);
                c.remote_port = remote_port.unwrap_or(0) as u16;
                c.local_port = local_port.unwrap_or(0) as u16;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asynch::state::State;
    use crate::command::{ConnType, HOST_LEN, Operation, Request};
    use crate::event::EventChannel;
    use crate::registration::Status;
    use heapless::String;
    use no_std_net::Ipv4Addr;

    fn open_req() -> Request {
        Request::new(
            1,
            Operation::ConnStart {
                conn_type: ConnType::Tcp,
                host: String::<HOST_LEN>::try_from("10.0.0.1").unwrap(),
                port: 1,
                idle_timeout: None,
                num: 0,
                res: ConnResult::Pending,
            },
        )
    }

    #[test]
    fn attach_polls_with_backoff_until_registered() {
        let state = State::new();
        let events: EventChannel<4, 1> = EventChannel::new();
        let publisher = events.dyn_publisher().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };
        let mut req = Request::new(
            1,
            Operation::NetworkAttach {
                apn: String::try_from("internet").unwrap(),
                user: String::new(),
                pass: String::new(),
            },
        );
        req.cur = AtCmd::CgregGet;

        // Two "searching" replies: two 3-second cooperative backoffs.
        for _ in 0..2 {
            state.lock(|s| s.network.cgreg = Status::Searching);
            let mut f = CmdFlags { ok: true, error: None };
            assert_eq!(
                Bg95.process_sub_cmd(&mut req, &mut f, &cx),
                SubCmd::next_after(AtCmd::CgregGet, Duration::from_secs(3))
            );
        }

        state.lock(|s| s.network.cgreg = Status::Home);
        let mut f = CmdFlags { ok: true, error: None };
        assert_eq!(
            Bg95.process_sub_cmd(&mut req, &mut f, &cx),
            SubCmd::next(AtCmd::QnwInfo)
        );

        // QNWINFO → QICSGP → QIACT=1 → QIACT?
        for (cur, want) in [
            (AtCmd::QnwInfo, AtCmd::Qicsgp),
            (AtCmd::Qicsgp, AtCmd::QiactSet),
            (AtCmd::QiactSet, AtCmd::QiactGet),
        ] {
            req.cur = cur;
            let mut f = CmdFlags { ok: true, error: None };
            assert_eq!(Bg95.process_sub_cmd(&mut req, &mut f, &cx), SubCmd::next(want));
        }

        // Not attached yet: retry QIACT=1 after 100 ms.
        req.cur = AtCmd::QiactGet;
        let mut f = CmdFlags { ok: true, error: None };
        assert_eq!(
            Bg95.process_sub_cmd(&mut req, &mut f, &cx),
            SubCmd::next_after(AtCmd::QiactSet, Duration::from_millis(100))
        );

        state.lock(|s| s.network.attached = true);
        let mut f = CmdFlags { ok: true, error: None };
        assert_eq!(
            Bg95.process_sub_cmd(&mut req, &mut f, &cx),
            SubCmd::Done(Response::None)
        );
    }

    #[test]
    fn qiact_reply_sets_attached_before_ok() {
        let state = State::new();
        let events: EventChannel<4, 1> = EventChannel::new();
        let publisher = events.dyn_publisher().unwrap();
        let mut sub = events.dyn_subscriber().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };
        let mut req = Request::new(1, Operation::NetworkDetach);
        req.cur = AtCmd::QiactGet;
        let mut flags = CmdFlags::default();
        Bg95.parse_plus("+QIACT: 1,1,1,\"25.106.234.47\"", &mut req, &mut flags, &cx);
        assert!(flags.ok);
        assert!(state.is_attached());
        assert_eq!(state.local_ip(), Some(Ipv4Addr::new(25, 106, 234, 47)));
        assert_eq!(sub.try_next_message_pure(), Some(Event::NetworkAttached));
    }

    #[test]
    fn qiopen_error_fails_without_status_round() {
        let state = State::new();
        let events: EventChannel<4, 1> = EventChannel::new();
        let publisher = events.dyn_publisher().unwrap();
        let mut sub = events.dyn_subscriber().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };

        let mut req = open_req();
        req.i = 1;
        req.cur = AtCmd::QiOpen;
        let mut flags = CmdFlags::default();
        Bg95.parse_plus("+QIOPEN: 0,566", &mut req, &mut flags, &cx);
        assert_eq!(flags.error, Some(Error::ConnFail));
        assert_eq!(
            Bg95.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::Fail(Error::ConnFail)
        );
        assert_eq!(
            sub.try_next_message_pure(),
            Some(Event::ConnError {
                num: 0,
                err: Error::ConnFail
            })
        );
        assert!(!state.lock(|s| s.conns.slot(0).unwrap().active));
    }

    #[test]
    fn qiopen_success_decides_on_status_poll() {
        let state = State::new();
        let events: EventChannel<4, 1> = EventChannel::new();
        let publisher = events.dyn_publisher().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };

        let mut req = open_req();
        req.i = 1;
        req.cur = AtCmd::QiOpen;
        let mut flags = CmdFlags {
            ok: true,
            error: None,
        };
        Bg95.parse_plus("+QIOPEN: 0,0", &mut req, &mut flags, &cx);
        assert!(state.lock(|s| s.conns.slot(0).unwrap().active));
        assert_eq!(
            Bg95.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::next_after(AtCmd::QiState, Duration::from_millis(100))
        );

        req.i = 2;
        req.cur = AtCmd::QiState;
        let mut flags = CmdFlags {
            ok: true,
            error: None,
        };
        match Bg95.process_sub_cmd(&mut req, &mut flags, &cx) {
            SubCmd::Done(Response::Conn(h)) => assert_eq!(h.num, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn undecided_open_times_out_after_poll_bound() {
        let state = State::new();
        let events: EventChannel<4, 1> = EventChannel::new();
        let publisher = events.dyn_publisher().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };

        let mut req = open_req();
        req.cur = AtCmd::QiState;
        for i in 2..(2 + OPEN_POLL_BOUND) {
            req.i = i;
            let mut flags = CmdFlags {
                ok: true,
                error: None,
            };
            assert_eq!(
                Bg95.process_sub_cmd(&mut req, &mut flags, &cx),
                SubCmd::next_after(AtCmd::QiState, Duration::from_millis(100))
            );
        }
        req.i = 2 + OPEN_POLL_BOUND;
        let mut flags = CmdFlags {
            ok: true,
            error: None,
        };
        assert_eq!(
            Bg95.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::Fail(Error::ConnTimeout)
        );
    }
}
