//! AT command emitter.
//!
//! Stateless between commands: every command is `AT…` + CRLF + flush, arguments
//! are appended piecewise with the quoting/comma rules the dialects need. The
//! payload phase of prompt commands (`CIPSEND`, `CMGS`, …) is raw bytes
//! committed with Ctrl-Z or cancelled with ESC.

use core::fmt::Write as _;

use embedded_io_async::Write;
use heapless::String;
use no_std_net::Ipv4Addr;

use crate::error::Error;

const CTRL_Z: u8 = 0x1A;
const ESC: u8 = 0x1B;

pub struct Emitter<W: Write> {
    tx: W,
}

impl<W: Write> Emitter<W> {
    pub fn new(tx: W) -> Self {
        Self { tx }
    }

    pub fn writer(&self) -> &W {
        &self.tx
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.tx.write_all(bytes).await.map_err(|_| Error::Tx)
    }

    /// `AT` — every command line starts with this.
    pub async fn begin(&mut self) -> Result<(), Error> {
        self.send(b"AT").await
    }

    /// CRLF terminator plus flush.
    pub async fn end(&mut self) -> Result<(), Error> {
        self.send(b"\r\n").await?;
        self.tx.flush().await.map_err(|_| Error::Tx)
    }

    /// A complete constant command line (`s` includes the `AT` prefix).
    pub async fn const_line(&mut self, s: &str) -> Result<(), Error> {
        self.send(s.as_bytes()).await?;
        self.end().await
    }

    pub async fn str(&mut self, s: &str) -> Result<(), Error> {
        self.send(s.as_bytes()).await
    }

    pub async fn number(&mut self, n: u32, quote: bool, comma: bool) -> Result<(), Error> {
        let mut buf: String<12> = String::new();
        write!(buf, "{}", n).ok();
        self.arg(buf.as_str(), false, quote, comma).await
    }

    pub async fn signed_number(&mut self, n: i32, quote: bool, comma: bool) -> Result<(), Error> {
        let mut buf: String<12> = String::new();
        write!(buf, "{}", n).ok();
        self.arg(buf.as_str(), false, quote, comma).await
    }

    pub async fn port(&mut self, port: u16, quote: bool, comma: bool) -> Result<(), Error> {
        self.number(port as u32, quote, comma).await
    }

    pub async fn ip(&mut self, ip: Ipv4Addr, quote: bool, comma: bool) -> Result<(), Error> {
        let mut buf: String<16> = String::new();
        write!(buf, "{}", ip).ok();
        self.arg(buf.as_str(), false, quote, comma).await
    }

    /// String argument: optional leading comma, optional quotes, optional
    /// escaping of `"`/`\` (CR/LF are never sent inside an argument).
    pub async fn arg(
        &mut self,
        s: &str,
        escape: bool,
        quote: bool,
        comma: bool,
    ) -> Result<(), Error> {
        if comma {
            self.send(b",").await?;
        }
        if quote {
            self.send(b"\"").await?;
        }
        if escape {
            for &b in s.as_bytes() {
                match b {
                    b'\r' | b'\n' => {}
                    b'"' | b'\\' => {
                        self.send(&[b'\\', b]).await?;
                    }
                    _ => self.send(&[b]).await?,
                }
            }
        } else {
            self.send(s.as_bytes()).await?;
        }
        if quote {
            self.send(b"\"").await?;
        }
        Ok(())
    }

    /// Raw payload for the data phase, not terminated.
    pub async fn payload(&mut self, data: &[u8]) -> Result<(), Error> {
        self.send(data).await?;
        self.tx.flush().await.map_err(|_| Error::Tx)
    }

    /// Commit the data phase.
    pub async fn ctrl_z(&mut self) -> Result<(), Error> {
        self.send(&[CTRL_Z]).await?;
        self.tx.flush().await.map_err(|_| Error::Tx)
    }

    /// Cancel the data phase.
    pub async fn esc(&mut self) -> Result<(), Error> {
        self.send(&[ESC]).await?;
        self.tx.flush().await.map_err(|_| Error::Tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::Sink;
    use embassy_futures::block_on;

    #[test]
    fn command_line_shape() {
        let mut at = Emitter::new(Sink::default());
        block_on(async {
            at.begin().await.unwrap();
            at.str("+CIPSSL=").await.unwrap();
            at.number(0, false, false).await.unwrap();
            at.end().await.unwrap();
        });
        assert_eq!(at.tx.as_str(), "AT+CIPSSL=0\r\n");
    }

    #[test]
    fn quoted_comma_args() {
        let mut at = Emitter::new(Sink::default());
        block_on(async {
            at.begin().await.unwrap();
            at.str("+CSTT=").await.unwrap();
            at.arg("internet", true, true, false).await.unwrap();
            at.arg("user", true, true, true).await.unwrap();
            at.arg("pass", true, true, true).await.unwrap();
            at.end().await.unwrap();
        });
        assert_eq!(at.tx.as_str(), "AT+CSTT=\"internet\",\"user\",\"pass\"\r\n");
    }

    #[test]
    fn escaping_quotes_and_backslash() {
        let mut at = Emitter::new(Sink::default());
        block_on(async {
            at.arg("a\"b\\c\r\n", true, true, false).await.unwrap();
        });
        assert_eq!(at.tx.as_str(), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn data_phase_terminators() {
        let mut at = Emitter::new(Sink::default());
        block_on(async {
            at.payload(b"hello").await.unwrap();
            at.ctrl_z().await.unwrap();
        });
        assert_eq!(at.tx.as_bytes(), b"hello\x1a");
    }
}
