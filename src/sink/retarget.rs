//! Retargeting Writer
//!
//! A long-lived `Write` adapter whose destination can be swapped between
//! writes. The record encoder writes through one adapter for the whole life
//! of a file, while each sync attaches a fresh upload body and detaches it
//! once the part has been encoded:
//!
//! ```text
//! RecordEncoder ──► RetargetingWriter ──► body #1  (header)
//!                                     ──► body #2  (part 1)
//!                                     ──► body #3  (part 2)
//! ```
//!
//! At most one destination is attached at a time.

use std::io::{self, Write};

#[derive(Debug)]
pub struct RetargetingWriter<W: Write> {
    destination: Option<W>,
    bytes_written: u64,
    attachments: u64,
}

impl<W: Write> Default for RetargetingWriter<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> RetargetingWriter<W> {
    /// An adapter with nothing attached
    pub fn new() -> Self {
        RetargetingWriter {
            destination: None,
            bytes_written: 0,
            attachments: 0,
        }
    }

    /// Route subsequent writes to `destination`
    pub fn attach(&mut self, destination: W) -> io::Result<()> {
        if self.destination.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a destination is already attached",
            ));
        }
        self.destination = Some(destination);
        self.attachments += 1;
        Ok(())
    }

    /// Flush and hand back the current destination, if any
    pub fn detach(&mut self) -> io::Result<Option<W>> {
        match self.destination.as_mut() {
            Some(destination) => destination.flush()?,
            None => return Ok(None),
        }
        Ok(self.destination.take())
    }

    pub fn is_attached(&self) -> bool {
        self.destination.is_some()
    }

    /// Bytes accepted across all destinations
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Destinations attached so far
    pub fn attachments(&self) -> u64 {
        self.attachments
    }
}

impl<W: Write> Write for RetargetingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let destination = self.destination.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no destination attached")
        })?;
        let written = destination.write(buf)?;
        self.bytes_written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.destination.as_mut() {
            Some(destination) => destination.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_writes_follow_destination() {
        let mut writer = RetargetingWriter::new();

        writer.attach(Vec::new()).unwrap();
        writer.write_all(b"first").unwrap();
        let first = writer.detach().unwrap().unwrap();

        writer.attach(Vec::new()).unwrap();
        writer.write_all(b"second").unwrap();
        let second = writer.detach().unwrap().unwrap();

        assert_eq!(first, b"first");
        assert_eq!(second, b"second");
        assert_eq!(writer.bytes_written(), 11);
        assert_eq!(writer.attachments(), 2);
    }

    #[test]
    fn test_write_without_destination_fails() {
        let mut writer: RetargetingWriter<Vec<u8>> = RetargetingWriter::new();
        let err = writer.write(b"lost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(writer.flush().is_ok());
        assert_eq!(writer.bytes_written(), 0);
    }

    #[test]
    fn test_double_attach_rejected() {
        let mut writer = RetargetingWriter::new();
        writer.attach(Vec::new()).unwrap();
        let err = writer.attach(Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(writer.attachments(), 1);
    }

    #[test]
    fn test_detach_when_empty() {
        let mut writer: RetargetingWriter<Vec<u8>> = RetargetingWriter::new();
        assert!(writer.detach().unwrap().is_none());
        assert!(!writer.is_attached());
    }

    #[test]
    fn test_bytes_writer_destination() {
        let mut writer = RetargetingWriter::new();
        writer.attach(BytesMut::new().writer()).unwrap();
        writer.write_all(&[1, 2, 3]).unwrap();
        let body = writer.detach().unwrap().unwrap().into_inner().freeze();
        assert_eq!(&body[..], &[1, 2, 3]);
    }
}
