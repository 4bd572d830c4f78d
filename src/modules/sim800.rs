//! SIMCom SIM800 dialect.
//!
//! Sockets run over the CIP command set in multi-connection mode
//! (`CIPMUX=1`): open is CIPSTATUS → CIPSSL → CIPSTART → CIPSTATUS, with the
//! actual connect decision carried by the unsolicited `<n>, CONNECT OK/FAIL`
//! line that follows CIPSTART's premature `OK`.

use embassy_time::Duration;
use embedded_io_async::Write;
use no_std_net::IpAddr;

use super::{
    common_first_cmd, emit_common, parse_common, process_close, process_detach, process_send,
    Ctx, ModuleOps,
};
use crate::command::{AtCmd, CmdFlags, ConnResult, ConnType, Operation, Request, Response, SubCmd};
use crate::config::MAX_CONNS;
use crate::emitter::Emitter;
use crate::error::Error;
use crate::event::Event;
use crate::parser::Scanner;

#[derive(Debug, Clone, Copy, Default)]
pub struct Sim800;

/// Attach graph edges: command just completed → (next command, abort on the
/// completed command's error).
fn attach_next(cur: AtCmd) -> Option<(AtCmd, bool)> {
    Some(match cur {
        AtCmd::CgactSet0 => (AtCmd::CgactSet1, false),
        AtCmd::CgactSet1 => (
            AtCmd::CgattSet0,
            !cfg!(feature = "network-ignore-cgact-result"),
        ),
        AtCmd::CgattSet0 => (AtCmd::CgattSet1, false),
        AtCmd::CgattSet1 => (AtCmd::CipShut, true),
        AtCmd::CipShut => (AtCmd::CipMuxSet, true),
        AtCmd::CipMuxSet => (AtCmd::CipRxGetSet, true),
        AtCmd::CipRxGetSet => (AtCmd::CsttSet, true),
        AtCmd::CsttSet => (AtCmd::Ciicr, true),
        AtCmd::Ciicr => (AtCmd::Cifsr, true),
        AtCmd::Cifsr => (AtCmd::CipStatus, false),
        _ => return None,
    })
}

impl Sim800 {
    fn reset_tail(&self, cx: &Ctx<'_>, delay: Option<Duration>) -> SubCmd {
        if cfg!(feature = "call") {
            // Call state reporting is part of the SIM800 bring-up.
            match delay {
                Some(d) => SubCmd::next_after(AtCmd::ClccSet, d),
                None => SubCmd::next(AtCmd::ClccSet),
            }
        } else {
            cx.emit(Event::DeviceReset);
            SubCmd::Done(Response::None)
        }
    }

    fn process_open(&self, req: &mut Request, flags: &mut CmdFlags, cx: &Ctx<'_>) -> SubCmd {
        let Operation::ConnStart { num, res, .. } = &mut req.op else {
            return SubCmd::Fail(Error::InvalidParam);
        };
        match (req.i, req.cur) {
            (0, AtCmd::CipStatus) => {
                if flags.ok {
                    SubCmd::next(AtCmd::CipSsl)
                } else {
                    SubCmd::finish(flags)
                }
            }
            (1, AtCmd::CipSsl) => SubCmd::next(AtCmd::CipStart),
            (2, AtCmd::CipStart) => {
                if flags.error.is_some() {
                    *res = ConnResult::ConnectError;
                }
                SubCmd::next(AtCmd::CipStatus)
            }
            (3, AtCmd::CipStatus) => match *res {
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
                ConnResult::Pending => SubCmd::finish(flags),
            },
            _ => SubCmd::finish(flags),
        }
    }
}

impl ModuleOps for Sim800 {
    fn high_baudrate(&self) -> u32 {
        460_800
    }

    fn cgact_line(&self, enable: bool) -> &'static str {
        if enable {
            "AT+CGACT=1"
        } else {
            "AT+CGACT=0"
        }
    }

    fn socket_open_cmd(&self) -> AtCmd {
        AtCmd::CipStart
    }

    fn socket_close_cmd(&self) -> AtCmd {
        AtCmd::CipClose
    }

    fn socket_send_cmd(&self) -> AtCmd {
        AtCmd::CipSend
    }

    fn socket_status_cmd(&self) -> AtCmd {
        AtCmd::CipStatus
    }

    fn ok_suppressed(&self, cur: AtCmd) -> bool {
        // These report their outcome after the premature OK.
        match cur {
            AtCmd::CipStatus | AtCmd::CipStart | AtCmd::CipSend => true,
            #[cfg(feature = "ussd")]
            AtCmd::Cusd => true,
            _ => false,
        }
    }

    fn first_cmd(&self, op: &Operation) -> AtCmd {
        if let Some(cmd) = common_first_cmd(self, op) {
            return cmd;
        }
        match op {
            Operation::NetworkAttach { .. } => AtCmd::CgactSet0,
            #[cfg(feature = "sms")]
            Operation::SmsDeleteAll(_) => AtCmd::Cmgda,
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
            AtCmd::CipShut => at.const_line("AT+CIPSHUT").await?,
            AtCmd::CipMuxSet => at.const_line("AT+CIPMUX=1").await?,
            AtCmd::CipRxGetSet => at.const_line("AT+CIPRXGET=0").await?,
            AtCmd::Ciicr => at.const_line("AT+CIICR").await?,
            AtCmd::Cifsr => at.const_line("AT+CIFSR").await?,
            AtCmd::CipStatus => at.const_line("AT+CIPSTATUS").await?,
            #[cfg(feature = "call")]
            AtCmd::ClccSet => at.const_line("AT+CLCC=1").await?,
            AtCmd::CsttSet => {
                let Operation::NetworkAttach { apn, user, pass } = &req.op else {
                    return Err(Error::InvalidParam);
                };
                at.begin().await?;
                at.str("+CSTT=").await?;
                at.arg(apn, true, true, false).await?;
                at.arg(user, true, true, true).await?;
                at.arg(pass, true, true, true).await?;
                at.end().await?;
            }
            AtCmd::CipSsl => {
                let Operation::ConnStart { conn_type, .. } = &req.op else {
                    return Err(Error::InvalidParam);
                };
                let ssl = matches!(*conn_type, ConnType::Ssl);
                at.begin().await?;
                at.str("+CIPSSL=").await?;
                at.number(ssl as u32, false, false).await?;
                at.end().await?;
            }
            AtCmd::CipStart => {
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
                at.str("+CIPSTART=").await?;
                at.number(slot as u32, false, false).await?;
                at.arg(conn_type.as_at_str(), false, true, true).await?;
                at.arg(host, false, true, true).await?;
                at.port(*port, false, true).await?;
                at.end().await?;
            }
            AtCmd::CipClose => {
                let Operation::ConnClose { handle, .. } = &req.op else {
                    return Err(Error::InvalidParam);
                };
                cx.state.validate(*handle)?;
                at.begin().await?;
                at.str("+CIPCLOSE=").await?;
                at.number(handle.num as u32, false, false).await?;
                at.end().await?;
            }
            AtCmd::CipSend => {
                let Operation::ConnSend { handle, data } = &req.op else {
                    return Err(Error::InvalidParam);
                };
                cx.state.validate(*handle)?;
                at.begin().await?;
                at.str("+CIPSEND=").await?;
                at.number(handle.num as u32, false, false).await?;
                at.number(data.len() as u32, false, true).await?;
                at.end().await?;
            }
            #[cfg(feature = "sms")]
            AtCmd::Cmgda => {
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
                at.str("+CMGDA=").await?;
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
                AtCmd::CpinGet => self.reset_tail(cx, None),
                AtCmd::Ipr => self.reset_tail(cx, Some(Duration::from_millis(500))),
                #[cfg(feature = "call")]
                AtCmd::ClccSet => {
                    cx.emit(Event::DeviceReset);
                    SubCmd::Done(Response::None)
                }
                _ => SubCmd::finish(flags),
            },
            Operation::NetworkAttach { .. } => match attach_next(req.cur) {
                Some((next, abort_on_error)) => {
                    if abort_on_error {
                        if let Some(e) = flags.error {
                            return SubCmd::Fail(e);
                        }
                    }
                    SubCmd::next(next)
                }
                None => SubCmd::finish(flags),
            },
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
        if req.cur == AtCmd::CipStart {
            if let Some((num, rest)) = super::split_conn_prefix(line) {
                if let Operation::ConnStart {
                    conn_type,
                    idle_timeout,
                    num: open_num,
                    res,
                    ..
                } = &mut req.op
                {
                    match rest {
                        "CONNECT OK" => {
                            *open_num = num;
                            cx.state
                                .lock(|s| s.conns.activate(num, *conn_type, *idle_timeout));
                            *res = ConnResult::ConnectOk;
                            flags.ok = true;
                        }
                        "CONNECT FAIL" => {
                            *res = ConnResult::ConnectError;
                            flags.fail(Error::ConnFail);
                        }
                        "ALREADY CONNECT" => {
                            *res = ConnResult::AlreadyConnect;
                            flags.fail(Error::ConnFail);
                        }
                        _ => {}
                    }
                    return;
                }
            }
        }
        parse_common(self, line, req, flags, cx);
    }

    fn parse_socket_status(
        &self,
        line: &str,
        _req: &mut Request,
        flags: &mut CmdFlags,
        cx: &Ctx<'_>,
    ) {
        if let Some(state) = line.strip_prefix("STATE: ") {
            // `IP INITIAL` also means no further C: rows will follow.
            let attached = !(state.starts_with("IP INITIAL") || state.starts_with("PDP DEACT"));
            cx.set_attached(attached);
            if state.starts_with("IP INITIAL") {
                flags.ok = true;
            }
            return;
        }
        let Some(rest) = line.strip_prefix("C: ") else {
            return;
        };
        let mut s = Scanner::new(rest);
        let Some(num) = s.number() else { return };
        if num as usize >= MAX_CONNS {
            return;
        }
        let num = num as u8;
        let _bearer = s.number();
        let conn_type: Option<heapless::String<8>> = s.quoted();
        let ip = s.ip();
        let port = s.number();
        let conn_state: Option<heapless::String<16>> = s.quoted();

        cx.state.lock(|sh| {
            if let Some(c) = sh.conns.slot_mut(num) {
                match conn_type.as_deref() {
                    Some("TCP") if c.conn_type != ConnType::Ssl => c.conn_type = ConnType::Tcp,
                    Some("UDP") => c.conn_type = ConnType::Udp,
                    _ => {}
                }
                c.remote_ip = ip.map(IpAddr::V4);
                c.remote_port = port.unwrap_or(0) as u16;
            }
        });

        if conn_state.as_deref() == Some("CLOSED") {
            cx.conn_closed(num, false, Ok(()));
        }

        // The table ends with the highest slot; that row completes the command.
        if num as usize == MAX_CONNS - 1 {
            flags.ok = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asynch::state::State;
    use crate::command::{HOST_LEN, Operation, Request};
    use crate::event::EventChannel;
    use heapless::String;

    fn open_req() -> Request {
        Request::new(
            1,
            Operation::ConnStart {
                conn_type: ConnType::Tcp,
                host: String::<HOST_LEN>::try_from("93.184.216.34").unwrap(),
                port: 80,
                idle_timeout: None,
                num: 0,
                res: ConnResult::Pending,
            },
        )
    }

    #[test]
    fn attach_chain_order() {
        let expected = [
            AtCmd::CgactSet1,
            AtCmd::CgattSet0,
            AtCmd::CgattSet1,
            AtCmd::CipShut,
            AtCmd::CipMuxSet,
            AtCmd::CipRxGetSet,
            AtCmd::CsttSet,
            AtCmd::Ciicr,
            AtCmd::Cifsr,
            AtCmd::CipStatus,
        ];
        let mut cur = AtCmd::CgactSet0;
        for want in expected {
            let (next, _) = attach_next(cur).unwrap();
            assert_eq!(next, want);
            cur = next;
        }
        assert!(attach_next(AtCmd::CipStatus).is_none());
    }

    #[test]
    fn attach_aborts_on_checked_step_error() {
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
        req.cur = AtCmd::CipShut;
        let mut flags = CmdFlags::default();
        flags.fail(Error::Failed);
        assert_eq!(
            Sim800.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::Fail(Error::Failed)
        );

        // CGACT=0 failure is tolerated, the chain continues.
        req.cur = AtCmd::CgactSet0;
        let mut flags = CmdFlags::default();
        flags.fail(Error::Failed);
        assert_eq!(
            Sim800.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::next(AtCmd::CgactSet1)
        );
    }

    #[test]
    fn open_graph_success_path() {
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
        req.cur = AtCmd::CipStatus;
        let mut flags = CmdFlags {
            ok: true,
            error: None,
        };
        assert_eq!(
            Sim800.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::next(AtCmd::CipSsl)
        );
        req.i = 1;
        req.cur = AtCmd::CipSsl;
        assert_eq!(
            Sim800.process_sub_cmd(&mut req, &mut CmdFlags::default(), &cx),
            SubCmd::next(AtCmd::CipStart)
        );

        // `0, CONNECT OK` activates the slot during CIPSTART.
        req.i = 2;
        req.cur = AtCmd::CipStart;
        let mut flags = CmdFlags::default();
        Sim800.parse_plus("0, CONNECT OK", &mut req, &mut flags, &cx);
        assert!(flags.ok);
        assert!(state.lock(|s| s.conns.slot(0).unwrap().active));
        assert_eq!(
            Sim800.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::next(AtCmd::CipStatus)
        );

        req.i = 3;
        req.cur = AtCmd::CipStatus;
        let sub_cmd = Sim800.process_sub_cmd(&mut req, &mut CmdFlags::default(), &cx);
        match sub_cmd {
            SubCmd::Done(Response::Conn(h)) => {
                assert_eq!(h.num, 0);
                assert_eq!(h.val_id, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            sub.try_next_message_pure(),
            Some(Event::ConnActive {
                num: 0,
                client: true,
                forced: true
            })
        );
    }

    #[test]
    fn open_graph_connect_fail() {
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
        req.i = 2;
        req.cur = AtCmd::CipStart;
        let mut flags = CmdFlags::default();
        Sim800.parse_plus("0, CONNECT FAIL", &mut req, &mut flags, &cx);
        assert_eq!(flags.error, Some(Error::ConnFail));
        assert_eq!(
            Sim800.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::next(AtCmd::CipStatus)
        );

        req.i = 3;
        req.cur = AtCmd::CipStatus;
        assert_eq!(
            Sim800.process_sub_cmd(&mut req, &mut CmdFlags::default(), &cx),
            SubCmd::Fail(Error::ConnFail)
        );
        assert_eq!(
            sub.try_next_message_pure(),
            Some(Event::ConnError {
                num: 0,
                err: Error::ConnFail
            })
        );
    }

    #[test]
    fn close_error_still_releases_slot() {
        let state = State::new();
        let events: EventChannel<4, 1> = EventChannel::new();
        let publisher = events.dyn_publisher().unwrap();
        let mut sub = events.dyn_subscriber().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };

        let handle = state.lock(|s| s.conns.activate(1, ConnType::Tcp, None));
        let mut req = Request::new(
            1,
            Operation::ConnClose {
                handle,
                forced: true,
            },
        );
        req.cur = AtCmd::CipClose;
        let mut flags = CmdFlags::default();
        flags.fail(Error::Failed);
        assert_eq!(
            Sim800.process_sub_cmd(&mut req, &mut flags, &cx),
            SubCmd::Fail(Error::Failed)
        );
        assert!(!state.lock(|s| s.conns.slot(1).unwrap().active));
        assert_eq!(
            sub.try_next_message_pure(),
            Some(Event::ConnClose {
                num: 1,
                forced: true,
                res: Err(Error::Failed)
            })
        );
    }

    #[test]
    fn status_rows_update_attach_state() {
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
        req.cur = AtCmd::CipStatus;

        let mut flags = CmdFlags::default();
        Sim800.parse_socket_status("STATE: IP STATUS", &mut req, &mut flags, &cx);
        assert!(state.is_attached());
        assert_eq!(sub.try_next_message_pure(), Some(Event::NetworkAttached));
        assert!(!flags.ok);

        // Last row of the table completes the (suppressed-OK) command.
        Sim800.parse_socket_status(
            "C: 5,0,\"\",\"\",\"\",\"INITIAL\"",
            &mut req,
            &mut flags,
            &cx,
        );
        assert!(flags.ok);

        let mut flags = CmdFlags::default();
        Sim800.parse_socket_status("STATE: IP INITIAL", &mut req, &mut flags, &cx);
        assert!(!state.is_attached());
        assert_eq!(sub.try_next_message_pure(), Some(Event::NetworkDetached));
        assert!(flags.ok);
    }
}
