use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::tnc::{Tnc, TncError};

/// A transport that delivers nothing and discards everything.
#[derive(Clone)]
pub(crate) struct NullTnc;

impl Tnc for NullTnc {
    fn try_clone(&mut self) -> Result<Self, TncError> {
        Ok(self.clone())
    }

    fn start(&mut self) -> Result<(), TncError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), TncError> {
        Ok(())
    }
}

impl Read for NullTnc {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for NullTnc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An in-memory transport: bytes pushed with `feed` come out of `read`, and
/// everything written is captured for inspection.
#[derive(Clone, Default)]
pub(crate) struct MockTnc {
    incoming: Arc<Mutex<Vec<u8>>>,
    outgoing: Arc<Mutex<Vec<u8>>>,
}

impl MockTnc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.incoming.lock().unwrap().extend_from_slice(bytes);
    }

    pub fn written(&self) -> Vec<u8> {
        self.outgoing.lock().unwrap().clone()
    }
}

impl Read for MockTnc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = self.incoming.lock().unwrap();
        if incoming.is_empty() {
            drop(incoming);
            // Behave like a transport with a short read timeout.
            std::thread::sleep(Duration::from_millis(5));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data queued"));
        }
        let n = incoming.len().min(buf.len());
        buf[..n].copy_from_slice(&incoming[..n]);
        incoming.drain(..n);
        Ok(n)
    }
}

impl Write for MockTnc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Tnc for MockTnc {
    fn try_clone(&mut self) -> Result<Self, TncError> {
        Ok(self.clone())
    }

    fn start(&mut self) -> Result<(), TncError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), TncError> {
        Ok(())
    }
}
