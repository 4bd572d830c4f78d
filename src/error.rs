/// Result codes surfaced to the application.
///
/// Every completed request resolves to exactly one of these (or success); the
/// internal continuation marker of the sub-command graphs is not part of this
/// enum and never reaches a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Unspecified failure reported by the module or the engine.
    Failed,
    /// Invalid or over-long argument; nothing was sent to the module.
    InvalidParam,
    /// All connection slots are active.
    NoFreeConn,
    /// The module reported `CONNECT FAIL` / `+QIOPEN` with a non-zero error.
    ConnFail,
    /// No connection decision within the status poll bound.
    ConnTimeout,
    /// No `OK`/`ERROR` within the command's reply budget.
    Timeout,
    /// Operation requires an attached PDP context.
    NotAttached,
    /// Out of buffer space.
    Mem,
    /// The request mailbox cannot accept another top-level request.
    Busy,
    /// Serial transmit failed.
    Tx,
    /// `+CME ERROR: <n>`
    Cme(u16),
    /// `+CMS ERROR: <n>`
    Cms(u16),
}
