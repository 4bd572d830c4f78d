//! Shared test doubles.

use core::convert::Infallible;

/// Serial sink recording everything the emitter writes.
#[derive(Default)]
pub struct Sink {
    pub written: std::vec::Vec<u8>,
}

impl Sink {
    pub fn as_bytes(&self) -> &[u8] {
        &self.written
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.written).unwrap()
    }

    /// The emitted AT command lines, CRLF-split, data-phase bytes included
    /// as-is.
    pub fn lines(&self) -> std::vec::Vec<std::string::String> {
        self.as_str()
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .map(std::string::String::from)
            .collect()
    }
}

impl embedded_io_async::ErrorType for Sink {
    type Error = Infallible;
}

impl embedded_io_async::Write for Sink {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
