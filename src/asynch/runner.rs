//! The sequencer task.
//!
//! Exactly one long-lived task owns this runner; it is the only thread that
//! touches the emitter, the connection table and the network state. Requests
//! execute strictly one at a time: the runner pops a request, walks its
//! sub-command graph (emit → consume lines until a terminal outcome → advance),
//! and signals completion. URC lines observed on the way — idle or mid-request
//! — are processed within the same serialized stream.

use embassy_futures::select::{select3, Either3};
use embassy_time::{with_timeout, Duration, Instant, Timer};
use embedded_hal::digital::OutputPin;
use embedded_io_async::Write;

use super::resources::{DoneSignal, Resources};
use super::state::State;
use super::urc_handler::UrcHandler;
use crate::command::{AtCmd, CmdFlags, Operation, Request, RequestResult, SubCmd};
use crate::config::{ModemConfig, MAX_CONNS, REQUEST_QUEUE_LEN};
use crate::connection::ConnHandle;
use crate::emitter::Emitter;
use crate::error::Error;
use crate::event::EventPublisher;
use crate::ingress::{Line, LineReceiver};
use crate::modules::{Ctx, Module, ModuleOps};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Receiver, Sender};

type RequestReceiver<'a> = Receiver<'a, CriticalSectionRawMutex, Request, REQUEST_QUEUE_LEN>;
type RequestSender<'a> = Sender<'a, CriticalSectionRawMutex, Request, REQUEST_QUEUE_LEN>;

/// Interval of the housekeeping tick that ages connection idle timers.
const POLL_TICK: Duration = Duration::from_millis(500);

/// Background sequencer. Call [`Runner::run`] in a dedicated task.
pub struct Runner<'a, W: Write, C: ModemConfig> {
    module: Module,
    config: C,
    at: Emitter<W>,
    state: &'a State,
    requests: RequestReceiver<'a>,
    req_tx: RequestSender<'a>,
    lines: LineReceiver<'a>,
    done: &'a DoneSignal,
    events: EventPublisher<'a>,
    urc: UrcHandler,
}

impl<'a, W: Write, C: ModemConfig> Runner<'a, W, C> {
    pub(crate) fn new<const EC: usize, const ES: usize>(
        resources: &'a Resources<EC, ES>,
        module: Module,
        config: C,
        tx: W,
    ) -> Self {
        Self {
            module,
            config,
            at: Emitter::new(tx),
            state: &resources.state,
            requests: resources.requests.receiver(),
            req_tx: resources.requests.sender(),
            lines: resources.lines.receiver(),
            done: &resources.done,
            events: resources.events.dyn_publisher().unwrap(),
            urc: UrcHandler::new(module),
        }
    }

    pub async fn run(mut self) -> ! {
        loop {
            match select3(
                self.requests.receive(),
                self.lines.receive(),
                Timer::after(POLL_TICK),
            )
            .await
            {
                Either3::First(req) => self.execute(req).await,
                Either3::Second(line) => self.handle_idle_line(line),
                Either3::Third(()) => self.scan_idle_timeouts(),
            }
        }
    }

    fn ctx(&self) -> Ctx<'_> {
        Ctx {
            state: self.state,
            events: &self.events,
            use_high_baudrate: C::USE_HIGH_BAUDRATE,
        }
    }

    async fn execute(&mut self, mut req: Request) {
        debug!("request {} start", req.id);
        let res = self.run_request(&mut req).await;
        match &res {
            Ok(_) => debug!("request {} done", req.id),
            Err(e) => warn!("request {} failed: {:?}", req.id, e),
        }
        // Events belonging to the request were published above; only now is
        // the caller released.
        if !req.internal {
            self.done.signal((req.id, res));
        }
    }

    async fn run_request(&mut self, req: &mut Request) -> RequestResult {
        if matches!(req.op, Operation::Reset) {
            self.hard_reset().await;
        }
        req.cur = self.module.first_cmd(&req.op);
        if req.cur == AtCmd::Idle {
            return Err(Error::InvalidParam);
        }
        loop {
            let module = self.module;
            if let Err(e) = {
                // Field-level borrows: the emitter is taken mutably while the
                // context only touches state/events.
                let cx = Ctx {
                    state: self.state,
                    events: &self.events,
                    use_high_baudrate: C::USE_HIGH_BAUDRATE,
                };
                module.initiate_cmd(&mut self.at, req, &cx).await
            } {
                warn!("cannot initiate {:?}: {:?}", req.cur, e);
                return Err(e);
            }

            let mut flags = self.collect(req).await;

            if req.cur == AtCmd::Ipr && flags.error.is_none() {
                self.config.set_baudrate(module.high_baudrate());
            }

            let sub = {
                let cx = self.ctx();
                module.process_sub_cmd(req, &mut flags, &cx)
            };
            match sub {
                SubCmd::Next { cmd, delay } => {
                    if let Some(d) = delay {
                        Timer::after(d).await;
                    }
                    req.cur = cmd;
                    req.i = req.i.saturating_add(1);
                }
                SubCmd::Done(r) => return Ok(r),
                SubCmd::Fail(e) => return Err(e),
            }
        }
    }

    /// Consume lines until the command in flight reaches a terminal outcome
    /// or its reply budget runs out.
    async fn collect(&mut self, req: &mut Request) -> CmdFlags {
        let mut flags = CmdFlags::default();
        let deadline = Instant::now() + req.cur.reply_budget();
        while !flags.done() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                flags.fail(Error::Timeout);
                break;
            };
            let line = match with_timeout(remaining, self.lines.receive()).await {
                Ok(line) => line,
                Err(_) => {
                    warn!("{:?}: no terminal token within budget", req.cur);
                    flags.fail(Error::Timeout);
                    break;
                }
            };
            self.process_line(req, &mut flags, line).await;
        }
        flags
    }

    async fn process_line(&mut self, req: &mut Request, flags: &mut CmdFlags, line: Line) {
        match line {
            Line::Ok => {
                if !self.module.ok_suppressed(req.cur) {
                    flags.ok = true;
                }
            }
            Line::Error => flags.fail(Error::Failed),
            Line::CmeError(n) => flags.fail(Error::Cme(n)),
            Line::CmsError(n) => flags.fail(Error::Cms(n)),
            Line::Busy | Line::NoDialtone | Line::NoAnswer | Line::NoCarrier => {
                flags.fail(Error::Failed)
            }
            Line::Ring => {
                #[cfg(feature = "call")]
                self.ctx().emit(crate::event::Event::CallRing);
            }
            Line::Prompt => {
                if req.cur.wants_prompt() {
                    if let Err(e) = self.send_payload(req).await {
                        flags.fail(e);
                    }
                }
            }
            Line::Data { conn, payload } => {
                let cx = self.ctx();
                self.urc.data_frame(conn, payload, &cx);
            }
            Line::Text(s) => {
                let cx = self.ctx();
                if !self.urc.text(&s, Some((&mut *req, &mut *flags)), &cx) {
                    if req.cur == self.module.socket_status_cmd() {
                        self.module.parse_socket_status(&s, req, flags, &cx);
                    } else {
                        self.module.parse_plus(&s, req, flags, &cx);
                    }
                }
            }
        }
    }

    /// Data phase after the `> ` prompt: raw payload committed with Ctrl-Z.
    async fn send_payload(&mut self, req: &Request) -> Result<(), Error> {
        match &req.op {
            Operation::ConnSend { data, .. } => {
                self.at.payload(data).await?;
                self.at.ctrl_z().await
            }
            #[cfg(feature = "sms")]
            Operation::SmsSend { text, .. } => {
                self.at.payload(text.as_bytes()).await?;
                self.at.ctrl_z().await
            }
            _ => self.at.esc().await,
        }
    }

    async fn hard_reset(&mut self) {
        if let Some(pin) = self.config.reset_pin() {
            debug!("hard resetting module");
            pin.set_low().ok();
            Timer::after(self.module.reset_hold()).await;
            pin.set_high().ok();
            Timer::after(self.module.boot_wait()).await;
        }
        self.state.reset_runtime();
        // Drop whatever the module produced before the reset.
        while self.lines.try_receive().is_ok() {}
    }

    /// URCs arriving while no request is in flight.
    fn handle_idle_line(&mut self, line: Line) {
        match line {
            Line::Ring => {
                #[cfg(feature = "call")]
                self.ctx().emit(crate::event::Event::CallRing);
            }
            Line::Data { conn, payload } => {
                let cx = self.ctx();
                self.urc.data_frame(conn, payload, &cx);
            }
            Line::Text(s) => {
                let cx = self.ctx();
                if !self.urc.text(&s, None, &cx) {
                    trace!("unhandled line dropped");
                }
            }
            _ => {}
        }
    }

    /// Enqueue a synthetic close for every connection whose idle timeout
    /// elapsed.
    fn scan_idle_timeouts(&mut self) {
        let now = Instant::now();
        let mut expired: heapless::Vec<ConnHandle, MAX_CONNS> = heapless::Vec::new();
        self.state.lock(|s| {
            for h in s.conns.take_idle_expired(now) {
                expired.push(h).ok();
            }
        });
        for handle in expired {
            debug!("idle timeout on connection {}", handle.num);
            let req = Request::internal(Operation::ConnClose {
                handle,
                forced: true,
            });
            if self.req_tx.try_send(req).is_err() {
                warn!("request queue full, idle close postponed");
                self.state.lock(|s| {
                    if let Some(c) = s.conns.slot_mut(handle.num) {
                        c.closing = false;
                    }
                });
            }
        }
    }
}
