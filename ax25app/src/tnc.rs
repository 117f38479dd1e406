use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use thiserror::Error;

/// Read timeout applied to TNC transports so that reader threads come back
/// around to check their stop flags.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A TNC that carries KISS byte streams.
///
/// TNCs must be cloneable to support reading and writing from different
/// threads, via a working implementation of try_clone(). We do not require
/// `Clone` directly as this could not be fulfilled by `TcpStream`.
pub trait Tnc: Read + Write + Sized + Send + 'static {
    /// Return a copy of this TNC.
    ///
    /// The client will use this to create a second instance of the supplied
    /// TNC then use one of them for reading and one of them for writing,
    /// concurrently across two threads.
    fn try_clone(&mut self) -> Result<Self, TncError>;

    /// Start I/O.
    fn start(&mut self) -> Result<(), TncError>;

    /// Shut down I/O - it is assumed we cannot restart.
    fn close(&mut self) -> Result<(), TncError>;
}

#[derive(Debug, Error)]
pub enum TncError {
    #[error("TNC I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl Tnc for std::net::TcpStream {
    fn try_clone(&mut self) -> Result<Self, TncError> {
        Ok(std::net::TcpStream::try_clone(self)?)
    }

    fn start(&mut self) -> Result<(), TncError> {
        // Bound reads so the reader loop can notice a stop request.
        self.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TncError> {
        Ok(self.shutdown(std::net::Shutdown::Both)?)
    }
}

/// A serial-attached KISS TNC.
pub struct SerialTnc {
    port: Box<dyn SerialPort>,
}

impl SerialTnc {
    pub fn available_ports() -> impl Iterator<Item = String> {
        serialport::available_ports()
            .unwrap_or_else(|_| vec![])
            .into_iter()
            .map(|i| i.port_name)
    }

    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, TncError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        Ok(Self { port })
    }
}

impl Read for SerialTnc {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTnc {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl Tnc for SerialTnc {
    fn try_clone(&mut self) -> Result<Self, TncError> {
        Ok(Self {
            port: self.port.try_clone()?,
        })
    }

    fn start(&mut self) -> Result<(), TncError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), TncError> {
        Ok(())
    }
}
