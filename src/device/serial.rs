//! Diagnostic serial port.
//!
//! Only the transmit path of COM1 is emulated: a one-byte `OUT` to port
//! 0x3F8 is copied to the host output stream. There are no line or modem
//! registers and nothing the guest can read back.

use std::io::{self, Write};

/// I/O port of the first PC serial port.
pub const COM1_PORT: u16 = 0x3f8;

/// Transmit-only serial sink.
pub struct Serial {
    /// Output writer
    output: Box<dyn Write + Send>,
    /// Bytes written so far
    written: u64,
}

impl Serial {
    /// Create a new serial port that writes to stdout.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Create a new serial port with a custom output writer.
    pub fn with_output(output: Box<dyn Write + Send>) -> Self {
        Self { output, written: 0 }
    }

    /// Transmit one byte from the guest.
    ///
    /// Flushes immediately so output interleaves correctly with host logs.
    pub fn write_byte(&mut self, value: u8) -> io::Result<()> {
        self.output.write_all(&[value])?;
        self.output.flush()?;
        self.written += 1;
        Ok(())
    }

    /// Number of bytes transmitted.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Writer that records everything into a shared buffer.
    #[derive(Clone, Default)]
    pub(crate) struct TestWriter {
        pub(crate) data: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_serial_output() {
        let writer = TestWriter::default();
        let mut serial = Serial::with_output(Box::new(writer.clone()));

        serial.write_byte(b'H').unwrap();
        serial.write_byte(b'i').unwrap();

        assert_eq!(&*writer.data.lock().unwrap(), b"Hi");
        assert_eq!(serial.bytes_written(), 2);
    }

    #[test]
    fn test_serial_output_error_is_reported() {
        let mut serial = Serial::with_output(Box::new(BrokenWriter));
        let err = serial.write_byte(b'x').unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(serial.bytes_written(), 0);
    }
}
