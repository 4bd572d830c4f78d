//! Unsolicited result code dispatch.
//!
//! URCs are serialized with the command stream: the sequencer hands every line
//! here first, whether idle or mid-request. Returns `true` when the line was a
//! URC and is consumed; command-scoped replies (a tag owned by the current
//! command) are left for the dialect parsers.

use crate::command::{CmdFlags, Operation, Request};
use crate::event::Event;
use crate::modules::{Ctx, Module, ModuleOps};
use crate::parser::Scanner;

pub(crate) struct UrcHandler {
    module: Module,
}

impl UrcHandler {
    pub fn new(module: Module) -> Self {
        Self { module }
    }

    /// An inline data frame: deliver to the connection's subscriber and feed
    /// its idle timer. Never affects an in-flight request's result.
    pub fn data_frame(
        &self,
        conn: u8,
        payload: heapless::Vec<u8, { crate::config::RECV_CAP }>,
        cx: &Ctx<'_>,
    ) {
        let active = cx.state.lock(|s| {
            s.conns.touch(conn);
            s.conns.slot(conn).map(|c| c.active).unwrap_or(false)
        });
        if !active {
            warn!("data frame for inactive connection {}", conn);
            return;
        }
        cx.emit(Event::ConnDataRecv {
            num: conn,
            data: payload,
        });
    }

    /// Text-line URCs. `in_flight` carries the current request so peer closes
    /// can fail a send that is waiting on the same connection.
    pub fn text(
        &self,
        line: &str,
        mut in_flight: Option<(&mut Request, &mut CmdFlags)>,
        cx: &Ctx<'_>,
    ) -> bool {
        // A tag owned by the current command is a reply, not a URC.
        if let Some((req, _)) = &in_flight {
            if let Some(tag) = req.cur.response_tag() {
                if line.starts_with(tag) {
                    return false;
                }
            }
        }

        // `<n>, CLOSED` / `CLOSED`: peer or module dropped the connection.
        let closed_conn = match crate::modules::split_conn_prefix(line) {
            Some((num, "CLOSED")) => Some(num),
            _ if line == "CLOSED" => Some(0),
            _ => None,
        };
        if let Some(num) = closed_conn {
            cx.conn_closed(num, false, Ok(()));
            if let Some((req, flags)) = &mut in_flight {
                if let Operation::ConnSend { handle, .. } = &req.op {
                    if handle.num == num {
                        flags.fail(crate::error::Error::Failed);
                    }
                }
            }
            return true;
        }

        if let Some(rest) = line.strip_prefix("+QIURC:") {
            return self.qiurc(rest.trim_start(), cx);
        }

        if line.starts_with("+PDP: DEACT") || line.starts_with("+PDP DEACT") {
            cx.set_attached(false);
            return true;
        }

        // Peer address notification on inbound data; tolerated, unused.
        if line.starts_with("+CIPSRIP") {
            return true;
        }

        // Unsolicited SIM state change (the solicited reply is owned by CPIN?
        // and never reaches this point).
        if let Some(rest) = line.strip_prefix("+CPIN:") {
            let sim = crate::modules::parse_sim_state(rest.trim());
            cx.state.lock(|s| s.sim = sim);
            cx.emit(Event::SimState(sim));
            return true;
        }

        if let Some(rest) = line
            .strip_prefix("+CREG:")
            .or_else(|| line.strip_prefix("+CGREG:"))
        {
            self.registration(line.starts_with("+CGREG"), rest, cx);
            return true;
        }

        #[cfg(feature = "call")]
        if let Some(rest) = line.strip_prefix("+CLCC:") {
            self.call_status(rest, cx);
            return true;
        }

        #[cfg(feature = "sms")]
        if let Some(rest) = line.strip_prefix("+CMTI:") {
            let mut s = Scanner::new(rest);
            let mem = s.quoted().unwrap_or_default();
            let pos = s.number().unwrap_or(0) as u16;
            cx.emit(Event::SmsRecv { mem, pos });
            return true;
        }

        false
    }

    /// `+QIURC:` variants other than "recv" (which the splitter turns into a
    /// data frame before it gets here).
    fn qiurc(&self, rest: &str, cx: &Ctx<'_>) -> bool {
        if let Some(tail) = rest.strip_prefix("\"closed\",") {
            if let Some(num) = Scanner::new(tail).number() {
                cx.conn_closed(num as u8, false, Ok(()));
            }
            return true;
        }
        if rest.starts_with("\"pdpdeact\"") {
            cx.set_attached(false);
            return true;
        }
        true
    }

    fn registration(&self, cgreg: bool, rest: &str, cx: &Ctx<'_>) {
        let mut s = Scanner::new(rest);
        // URC form carries one number, the solicited form `<n>,<stat>` two.
        let first = s.number();
        let stat = s.number().or(first).unwrap_or(0) as u8;

        let skip = self.module.creg_cgreg_skip_first()
            && cx.state.lock(|st| {
                let first_urc = !st.network.reg_urc_seen;
                st.network.reg_urc_seen = true;
                first_urc
            });
        if skip {
            debug!("ignoring first registration URC after reset");
            return;
        }
        cx.state.lock(|st| {
            if cgreg {
                st.network.cgreg = stat.into();
            } else {
                st.network.creg = stat.into();
            }
        });
    }

    #[cfg(feature = "call")]
    fn call_status(&self, rest: &str, cx: &Ctx<'_>) {
        use crate::event::CallInfo;

        let mut s = Scanner::new(rest);
        let (Some(id), Some(dir), Some(stat)) = (s.number(), s.number(), s.number()) else {
            return;
        };
        let _mode = s.number();
        let _mpty = s.number();
        let number = s.quoted().unwrap_or_default();
        cx.emit(Event::CallChanged(CallInfo {
            id: id as u8,
            incoming: dir == 1,
            state: (stat as u8).into(),
            number,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asynch::state::State;
    use crate::command::{AtCmd, ConnType};
    use crate::event::EventChannel;
    use crate::registration::Status;

    fn fixture() -> (State, EventChannel<8, 1>) {
        (State::new(), EventChannel::new())
    }

    #[test]
    fn peer_close_fires_event_once() {
        let (state, events) = fixture();
        let publisher = events.dyn_publisher().unwrap();
        let mut sub = events.dyn_subscriber().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };
        state.lock(|s| s.conns.activate(1, ConnType::Tcp, None));

        let h = UrcHandler::new(Module::sim800());
        assert!(h.text("1, CLOSED", None, &cx));
        assert_eq!(
            sub.try_next_message_pure(),
            Some(Event::ConnClose {
                num: 1,
                forced: false,
                res: Ok(())
            })
        );

        // Second CLOSED for the same slot: no second event.
        assert!(h.text("1, CLOSED", None, &cx));
        assert_eq!(sub.try_next_message_pure(), None);
    }

    #[test]
    fn close_during_send_fails_the_send() {
        let (state, events) = fixture();
        let publisher = events.dyn_publisher().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };
        let handle = state.lock(|s| s.conns.activate(1, ConnType::Tcp, None));

        let mut req = Request::new(
            7,
            Operation::ConnSend {
                handle,
                data: heapless::Vec::from_slice(b"hi").unwrap(),
            },
        );
        req.cur = AtCmd::CipSend;
        let mut flags = CmdFlags::default();

        let h = UrcHandler::new(Module::sim800());
        assert!(h.text("1, CLOSED", Some((&mut req, &mut flags)), &cx));
        assert_eq!(flags.error, Some(crate::error::Error::Failed));
        assert!(!state.lock(|s| s.conns.slot(1).unwrap().active));
    }

    #[test]
    fn owned_tag_is_not_a_urc() {
        let (state, events) = fixture();
        let publisher = events.dyn_publisher().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };
        let mut req = Request::new(1, Operation::NetworkDetach);
        req.cur = AtCmd::CgregGet;
        let mut flags = CmdFlags::default();

        let h = UrcHandler::new(Module::bg95());
        assert!(!h.text("+CGREG: 0,1", Some((&mut req, &mut flags)), &cx));
    }

    #[test]
    fn bg95_skips_first_registration_urc() {
        let (state, events) = fixture();
        let publisher = events.dyn_publisher().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };
        let h = UrcHandler::new(Module::bg95());

        assert!(h.text("+CGREG: 1", None, &cx));
        assert_eq!(state.registration().1, Status::NotRegistered);

        assert!(h.text("+CGREG: 1", None, &cx));
        assert_eq!(state.registration().1, Status::Home);
    }

    #[test]
    fn qiurc_closed_releases_slot() {
        let (state, events) = fixture();
        let publisher = events.dyn_publisher().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };
        state.lock(|s| s.conns.activate(2, ConnType::Tcp, None));

        let h = UrcHandler::new(Module::bg95());
        assert!(h.text("+QIURC: \"closed\",2", None, &cx));
        assert!(!state.lock(|s| s.conns.slot(2).unwrap().active));
    }

    #[test]
    fn data_frame_for_inactive_slot_is_dropped() {
        let (state, events) = fixture();
        let publisher = events.dyn_publisher().unwrap();
        let mut sub = events.dyn_subscriber().unwrap();
        let cx = Ctx {
            state: &state,
            events: &publisher,
            use_high_baudrate: false,
        };
        let h = UrcHandler::new(Module::sim800());

        h.data_frame(4, heapless::Vec::from_slice(b"x").unwrap(), &cx);
        assert_eq!(sub.try_next_message_pure(), None);

        state.lock(|s| s.conns.activate(4, ConnType::Udp, None));
        h.data_frame(4, heapless::Vec::from_slice(b"hello").unwrap(), &cx);
        match sub.try_next_message_pure() {
            Some(Event::ConnDataRecv { num, data }) => {
                assert_eq!(num, 4);
                assert_eq!(data.as_slice(), b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
