//! Line buffer and URC splitter.
//!
//! Accumulates transport bytes into CRLF-delimited lines, classifies terminal
//! response tokens, recognizes the `> ` data prompt, and switches to a
//! byte-counted mode for inline data frames (`+RECEIVE,<n>,<len>:`,
//! `+IPD,<len>:`, `+QIURC: "recv",<n>,<len>`). Produced lines go into a queue
//! consumed by the sequencer task; nothing is processed inline here.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embedded_io_async::Read;
use heapless::{String, Vec};

use crate::config::{LINE_CAP, LINE_QUEUE_LEN, RECV_CAP};
use crate::parser::Scanner;

pub type LineChannel = Channel<CriticalSectionRawMutex, Line, LINE_QUEUE_LEN>;
pub(crate) type LineSender<'a> = Sender<'a, CriticalSectionRawMutex, Line, LINE_QUEUE_LEN>;
pub(crate) type LineReceiver<'a> = Receiver<'a, CriticalSectionRawMutex, Line, LINE_QUEUE_LEN>;

/// One classified unit out of the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Line {
    Ok,
    Error,
    CmeError(u16),
    CmsError(u16),
    Busy,
    NoDialtone,
    NoAnswer,
    NoCarrier,
    Ring,
    /// The `> ` data prompt (no CRLF).
    Prompt,
    /// Anything else: `+TAG:` lines, `C:`/`STATE:` rows, `n, CONNECT OK`, …
    Text(String<LINE_CAP>),
    /// A complete inline data frame.
    Data { conn: u8, payload: Vec<u8, RECV_CAP> },
}

enum Classified {
    Emit(Line),
    /// Header announced `len` raw payload bytes for `conn`.
    Frame { conn: u8, len: usize },
    Skip,
}

enum Mode {
    Line,
    Frame {
        conn: u8,
        remaining: usize,
        dropped: usize,
        payload: Vec<u8, RECV_CAP>,
    },
}

pub struct Ingress<'a> {
    buf: Vec<u8, LINE_CAP>,
    overflow: bool,
    mode: Mode,
    lines: LineSender<'a>,
}

impl<'a> Ingress<'a> {
    pub(crate) fn new(lines: LineSender<'a>) -> Self {
        Self {
            buf: Vec::new(),
            overflow: false,
            mode: Mode::Line,
            lines,
        }
    }

    /// Feed raw transport bytes. May be called with arbitrary framing; an
    /// incomplete line is retained until more bytes arrive.
    pub async fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b).await;
        }
    }

    /// Drive the splitter from an async reader. Intended to be spawned as the
    /// transport glue task.
    pub async fn read_from<R: Read>(mut self, reader: &mut R) -> ! {
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf).await {
                Ok(n) => self.write(&buf[..n]).await,
                Err(_) => {
                    error!("transport read error");
                }
            }
        }
    }

    async fn push(&mut self, b: u8) {
        match &mut self.mode {
            Mode::Frame {
                conn,
                remaining,
                dropped,
                payload,
            } => {
                if payload.push(b).is_err() {
                    *dropped += 1;
                }
                *remaining -= 1;
                if *remaining == 0 {
                    let conn = *conn;
                    let dropped = *dropped;
                    let payload = core::mem::take(payload);
                    self.mode = Mode::Line;
                    if dropped > 0 {
                        error!(
                            "data frame for conn {} exceeds buffer, dropped {} bytes",
                            conn, dropped
                        );
                    } else {
                        self.lines.send(Line::Data { conn, payload }).await;
                    }
                }
            }
            Mode::Line => match b {
                b'\n' => self.finish_line().await,
                b'\r' => {}
                _ => {
                    if self.buf.push(b).is_err() {
                        self.overflow = true;
                    } else if b == b' ' && self.buf.as_slice() == b"> " {
                        self.buf.clear();
                        self.lines.send(Line::Prompt).await;
                    } else if b == b':' {
                        // +IPD carries its payload right after the colon,
                        // without a CRLF in between.
                        if let Some(len) = parse_ipd(&self.buf) {
                            self.buf.clear();
                            self.start_frame(0, len).await;
                        }
                    }
                }
            },
        }
    }

    async fn finish_line(&mut self) {
        if self.overflow {
            error!("reply line longer than {} dropped", LINE_CAP);
            self.overflow = false;
            self.buf.clear();
            return;
        }
        let Ok(line) = core::str::from_utf8(&self.buf) else {
            warn!("non-ASCII reply line dropped");
            self.buf.clear();
            return;
        };
        let classified = classify(line);
        self.buf.clear();
        match classified {
            Classified::Emit(l) => self.lines.send(l).await,
            Classified::Frame { conn, len } => self.start_frame(conn, len).await,
            Classified::Skip => {}
        }
    }

    async fn start_frame(&mut self, conn: u8, len: usize) {
        if len == 0 {
            self.lines
                .send(Line::Data {
                    conn,
                    payload: Vec::new(),
                })
                .await;
            return;
        }
        self.mode = Mode::Frame {
            conn,
            remaining: len,
            dropped: 0,
            payload: Vec::new(),
        };
    }
}

/// `+IPD,<len>:` with nothing but digits between comma and colon.
fn parse_ipd(buf: &[u8]) -> Option<usize> {
    let s = core::str::from_utf8(buf).ok()?;
    let digits = s.strip_prefix("+IPD,")?.strip_suffix(':')?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn classify(line: &str) -> Classified {
    if line.is_empty() {
        return Classified::Skip;
    }
    match line {
        "OK" | "SHUT OK" => return Classified::Emit(Line::Ok),
        "ERROR" => return Classified::Emit(Line::Error),
        "BUSY" => return Classified::Emit(Line::Busy),
        "NO DIALTONE" => return Classified::Emit(Line::NoDialtone),
        "NO ANSWER" => return Classified::Emit(Line::NoAnswer),
        "NO CARRIER" => return Classified::Emit(Line::NoCarrier),
        "RING" => return Classified::Emit(Line::Ring),
        _ => {}
    }
    if let Some(rest) = line.strip_prefix("+CME ERROR:") {
        let code = rest.trim().parse().unwrap_or(0);
        return Classified::Emit(Line::CmeError(code));
    }
    if let Some(rest) = line.strip_prefix("+CMS ERROR:") {
        let code = rest.trim().parse().unwrap_or(0);
        return Classified::Emit(Line::CmsError(code));
    }
    // +RECEIVE,<n>,<len>: — payload follows after this line's CRLF.
    if line.starts_with("+RECEIVE,") && line.ends_with(':') {
        let mut s = Scanner::new(line);
        if let (Some(conn), Some(len)) = (s.number(), s.number()) {
            return Classified::Frame {
                conn: conn as u8,
                len: len as usize,
            };
        }
    }
    // +QIURC: "recv",<n>,<len> — same inline-frame shape on BG95.
    if let Some(rest) = line.strip_prefix("+QIURC: \"recv\",") {
        let mut s = Scanner::new(rest);
        if let (Some(conn), Some(len)) = (s.number(), s.number()) {
            return Classified::Frame {
                conn: conn as u8,
                len: len as usize,
            };
        }
    }
    match String::try_from(line) {
        Ok(s) => Classified::Emit(Line::Text(s)),
        Err(_) => Classified::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    fn setup(ch: &LineChannel) -> Ingress<'_> {
        Ingress::new(ch.sender())
    }

    #[test]
    fn splits_tokens_and_text() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);
        block_on(ing.write(b"\r\nOK\r\n\r\nERROR\r\n+CGREG: 0,2\r\n"));
        assert_eq!(ch.try_receive().unwrap(), Line::Ok);
        assert_eq!(ch.try_receive().unwrap(), Line::Error);
        assert_eq!(
            ch.try_receive().unwrap(),
            Line::Text(String::try_from("+CGREG: 0,2").unwrap())
        );
        assert!(ch.try_receive().is_err());
    }

    #[test]
    fn incomplete_line_is_retained() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);
        block_on(ing.write(b"\r\nSHUT O"));
        assert!(ch.try_receive().is_err());
        block_on(ing.write(b"K\r\n"));
        assert_eq!(ch.try_receive().unwrap(), Line::Ok);
    }

    #[test]
    fn cme_and_cms_errors() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);
        block_on(ing.write(b"+CME ERROR: 30\r\n+CMS ERROR: 500\r\n"));
        assert_eq!(ch.try_receive().unwrap(), Line::CmeError(30));
        assert_eq!(ch.try_receive().unwrap(), Line::CmsError(500));
    }

    #[test]
    fn prompt_has_no_crlf() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);
        block_on(ing.write(b"\r\n> "));
        assert_eq!(ch.try_receive().unwrap(), Line::Prompt);
    }

    #[test]
    fn receive_frame_delivers_exact_len() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);
        block_on(ing.write(b"\r\n+RECEIVE,1,5:\r\nhelloOK\r\n"));
        match ch.try_receive().unwrap() {
            Line::Data { conn, payload } => {
                assert_eq!(conn, 1);
                assert_eq!(payload.as_slice(), b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        // Line mode resumes right after the counted bytes.
        assert_eq!(ch.try_receive().unwrap(), Line::Ok);
    }

    #[test]
    fn receive_len_zero_is_immediate_empty_frame() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);
        block_on(ing.write(b"+RECEIVE,2,0:\r\nOK\r\n"));
        assert_eq!(
            ch.try_receive().unwrap(),
            Line::Data {
                conn: 2,
                payload: Vec::new()
            }
        );
        assert_eq!(ch.try_receive().unwrap(), Line::Ok);
    }

    #[test]
    fn ipd_payload_follows_colon_directly() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);
        block_on(ing.write(b"\r\n+IPD,3:abcOK\r\n"));
        match ch.try_receive().unwrap() {
            Line::Data { conn, payload } => {
                assert_eq!(conn, 0);
                assert_eq!(payload.as_slice(), b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ch.try_receive().unwrap(), Line::Ok);
    }

    #[test]
    fn qiurc_recv_frame() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);
        block_on(ing.write(b"+QIURC: \"recv\",3,4\r\nabcd"));
        match ch.try_receive().unwrap() {
            Line::Data { conn, payload } => {
                assert_eq!(conn, 3);
                assert_eq!(payload.as_slice(), b"abcd");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn line_cap_boundary() {
        let ch = LineChannel::new();
        let mut ing = setup(&ch);

        let max = [b'A'; LINE_CAP];
        block_on(ing.write(&max));
        block_on(ing.write(b"\r\n"));
        match ch.try_receive().unwrap() {
            Line::Text(s) => assert_eq!(s.len(), LINE_CAP),
            other => panic!("unexpected {other:?}"),
        }

        let over = [b'A'; LINE_CAP + 1];
        block_on(ing.write(&over));
        block_on(ing.write(b"\r\nOK\r\n"));
        // Over-long line dropped, following traffic unaffected.
        assert_eq!(ch.try_receive().unwrap(), Line::Ok);
        assert!(ch.try_receive().is_err());
    }
}
