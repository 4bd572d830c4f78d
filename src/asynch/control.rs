//! Application-facing handle.
//!
//! Every operation is a blocking request: it is placed in the sequencer's
//! mailbox and the caller waits for that request's completion. Submissions are
//! serialized, so requests complete in FIFO order. Callers wanting a bounded
//! wait wrap the call in `embassy_time::with_timeout`; a timed-out caller
//! abandons only the wait — the sequencer still finishes the request.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_sync::mutex::Mutex;
use embassy_time::Duration;
use heapless::{String, Vec};
use no_std_net::Ipv4Addr;

use super::resources::{DoneSignal, Resources};
use super::state::State;
use crate::command::{ConnType, Operation, Request, RequestResult, Response};
use crate::config::REQUEST_QUEUE_LEN;
use crate::connection::ConnHandle;
use crate::error::Error;
use crate::event::SimState;
use crate::registration::Status;

#[derive(Clone, Copy)]
pub struct Control<'a> {
    state: &'a State,
    requests: Sender<'a, CriticalSectionRawMutex, Request, REQUEST_QUEUE_LEN>,
    done: &'a DoneSignal,
    submit_lock: &'a Mutex<CriticalSectionRawMutex, ()>,
}

impl<'a> Control<'a> {
    pub(crate) fn new<const EC: usize, const ES: usize>(
        resources: &'a Resources<EC, ES>,
    ) -> Self {
        Self {
            state: &resources.state,
            requests: resources.requests.sender(),
            done: &resources.done,
            submit_lock: &resources.submit_lock,
        }
    }

    async fn run_op(&self, op: Operation) -> RequestResult {
        let _guard = self.submit_lock.lock().await;
        let id = self.state.alloc_id();
        self.requests
            .try_send(Request::new(id, op))
            .map_err(|_| Error::Busy)?;
        loop {
            let (done_id, res) = self.done.wait().await;
            if done_id == id {
                return res;
            }
            // Completion of a request whose submitter stopped waiting.
            trace!("discarding stale completion");
        }
    }

    /// Cold bring-up: hardware reset (when a pin is configured), `ATZ`, SIM
    /// check and the module's init chain.
    pub async fn reset(&self) -> Result<(), Error> {
        self.run_op(Operation::Reset).await.map(|_| ())
    }

    pub async fn network_attach(&self, apn: &str, user: &str, pass: &str) -> Result<(), Error> {
        let op = Operation::NetworkAttach {
            apn: String::try_from(apn).map_err(|_| Error::InvalidParam)?,
            user: String::try_from(user).map_err(|_| Error::InvalidParam)?,
            pass: String::try_from(pass).map_err(|_| Error::InvalidParam)?,
        };
        self.run_op(op).await.map(|_| ())
    }

    pub async fn network_detach(&self) -> Result<(), Error> {
        self.run_op(Operation::NetworkDetach).await.map(|_| ())
    }

    /// Open a client connection. `idle_timeout` arms a per-connection timer;
    /// on expiry the engine closes the connection on the caller's behalf.
    pub async fn conn_start(
        &self,
        conn_type: ConnType,
        host: &str,
        port: u16,
        idle_timeout: Option<Duration>,
    ) -> Result<ConnHandle, Error> {
        if !self.state.is_attached() {
            return Err(Error::NotAttached);
        }
        // Checked here so a full table costs no AT traffic at all.
        self.state
            .lock(|s| s.conns.free_slot())
            .ok_or(Error::NoFreeConn)?;
        let op = Operation::ConnStart {
            conn_type,
            host: String::try_from(host).map_err(|_| Error::InvalidParam)?,
            port,
            idle_timeout,
            num: 0,
            res: Default::default(),
        };
        match self.run_op(op).await? {
            Response::Conn(handle) => Ok(handle),
            _ => Err(Error::Failed),
        }
    }

    pub async fn conn_send(&self, handle: ConnHandle, data: &[u8]) -> Result<(), Error> {
        self.state.validate(handle)?;
        let op = Operation::ConnSend {
            handle,
            data: Vec::from_slice(data).map_err(|_| Error::InvalidParam)?,
        };
        self.run_op(op).await.map(|_| ())
    }

    pub async fn conn_close(&self, handle: ConnHandle) -> Result<(), Error> {
        self.state.validate(handle)?;
        let op = Operation::ConnClose {
            handle,
            forced: true,
        };
        self.run_op(op).await.map(|_| ())
    }

    #[cfg(feature = "sms")]
    pub async fn sms_send(&self, number: &str, text: &str) -> Result<(), Error> {
        let op = Operation::SmsSend {
            number: String::try_from(number).map_err(|_| Error::InvalidParam)?,
            text: String::try_from(text).map_err(|_| Error::InvalidParam)?,
        };
        self.run_op(op).await.map(|_| ())
    }

    /// List stored messages; entries arrive as `SmsListed` events, the count
    /// is returned.
    #[cfg(feature = "sms")]
    pub async fn sms_list(&self) -> Result<u8, Error> {
        match self
            .run_op(Operation::SmsList {
                count: 0,
                pending: None,
            })
            .await?
        {
            Response::SmsCount(n) => Ok(n),
            _ => Err(Error::Failed),
        }
    }

    #[cfg(feature = "sms")]
    pub async fn sms_delete_all(&self, status: crate::command::SmsStatus) -> Result<(), Error> {
        self.run_op(Operation::SmsDeleteAll(status)).await.map(|_| ())
    }

    #[cfg(feature = "call")]
    pub async fn call_start(&self, number: &str) -> Result<(), Error> {
        let op = Operation::CallStart {
            number: String::try_from(number).map_err(|_| Error::InvalidParam)?,
        };
        self.run_op(op).await.map(|_| ())
    }

    #[cfg(feature = "call")]
    pub async fn call_answer(&self) -> Result<(), Error> {
        self.run_op(Operation::CallAnswer).await.map(|_| ())
    }

    #[cfg(feature = "call")]
    pub async fn call_hangup(&self) -> Result<(), Error> {
        self.run_op(Operation::CallHangup).await.map(|_| ())
    }

    #[cfg(feature = "ussd")]
    pub async fn ussd(&self, code: &str) -> Result<(), Error> {
        let op = Operation::Ussd {
            code: String::try_from(code).map_err(|_| Error::InvalidParam)?,
        };
        self.run_op(op).await.map(|_| ())
    }

    pub fn is_attached(&self) -> bool {
        self.state.is_attached()
    }

    /// (CREG, CGREG) registration status.
    pub fn registration(&self) -> (Status, Status) {
        self.state.registration()
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.state.local_ip()
    }

    pub fn sim_state(&self) -> SimState {
        self.state.sim_state()
    }

    /// Check a connection handle against the current table generation.
    pub fn conn_is_active(&self, handle: ConnHandle) -> bool {
        self.state.validate(handle).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ConnType;
    use embassy_futures::block_on;

    #[test]
    fn stale_handle_is_rejected_without_traffic() {
        let res: Resources<8, 2> = Resources::new();
        let control = Control::new(&res);

        // Slot 0 used once (val_id 1), closed, reused (val_id 2).
        let old = res.state.lock(|s| s.conns.activate(0, ConnType::Tcp, None));
        res.state.lock(|s| s.conns.close(0));
        let _fresh = res.state.lock(|s| s.conns.activate(0, ConnType::Tcp, None));

        let err = block_on(control.conn_send(old, b"payload")).unwrap_err();
        assert_eq!(err, Error::Failed);
        // Nothing must have reached the sequencer mailbox.
        assert!(res.requests.try_receive().is_err());

        let err = block_on(control.conn_close(old)).unwrap_err();
        assert_eq!(err, Error::Failed);
        assert!(res.requests.try_receive().is_err());
    }

    #[test]
    fn conn_start_guards_attach_and_capacity() {
        let res: Resources<8, 2> = Resources::new();
        let control = Control::new(&res);

        let err = block_on(control.conn_start(ConnType::Tcp, "example.com", 80, None));
        assert_eq!(err.unwrap_err(), Error::NotAttached);

        res.state.lock(|s| s.network.attached = true);
        for n in 0..crate::config::MAX_CONNS as u8 {
            res.state.lock(|s| s.conns.activate(n, ConnType::Tcp, None));
        }
        let err = block_on(control.conn_start(ConnType::Tcp, "example.com", 80, None));
        assert_eq!(err.unwrap_err(), Error::NoFreeConn);
        assert!(res.requests.try_receive().is_err());
    }

    #[test]
    fn overlong_arguments_are_param_errors() {
        let res: Resources<8, 2> = Resources::new();
        let control = Control::new(&res);
        res.state.lock(|s| s.network.attached = true);

        let buf = [b'a'; 200];
        let long = core::str::from_utf8(&buf).unwrap();
        let err = block_on(control.conn_start(ConnType::Tcp, long, 80, None));
        assert_eq!(err.unwrap_err(), Error::InvalidParam);

        let err = block_on(control.network_attach(long, "", ""));
        assert_eq!(err.unwrap_err(), Error::InvalidParam);
    }
}
