use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};

/// Adafruit's USB vendor id.
pub const ADAFRUIT_VENDOR_ID: u16 = 0x239a;
pub const BAUD_RATE: u32 = 115_200;
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on a single line read.
pub const MAX_LINE_LENGTH: usize = 256;

/// A line-oriented, exclusively owned link to one sensor.
pub trait Port: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Whether at least one byte is waiting to be read.
    fn has_input(&mut self) -> io::Result<bool>;

    /// Reads up to and including the next newline.
    ///
    /// Returns early with whatever arrived when the read timeout expires or
    /// [`MAX_LINE_LENGTH`] bytes have been collected.
    fn read_line(&mut self) -> io::Result<String>;

    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens a [`Port`] for a physical address.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &str) -> io::Result<Box<dyn Port>>;
}

#[derive(Debug, Clone, Copy)]
pub struct SerialConnector {
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for SerialConnector {
    fn default() -> Self {
        SerialConnector {
            baud_rate: BAUD_RATE,
            read_timeout: READ_TIMEOUT,
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self, address: &str) -> io::Result<Box<dyn Port>> {
        let port = serialport::new(address, self.baud_rate)
            .timeout(self.read_timeout)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Box::new(SerialLink::new(port)))
    }
}

pub struct SerialLink {
    port: Box<dyn SerialPort>,
    lines: LineBuffer,
}

impl SerialLink {
    pub fn new(port: Box<dyn SerialPort>) -> SerialLink {
        SerialLink {
            port,
            lines: LineBuffer::default(),
        }
    }
}

impl Port for SerialLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn has_input(&mut self) -> io::Result<bool> {
        if !self.lines.is_empty() {
            return Ok(true);
        }
        Ok(self.port.bytes_to_read()? > 0)
    }

    fn read_line(&mut self) -> io::Result<String> {
        self.lines.read_line(&mut *self.port)
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.port.flush()
        // the OS handle is released when `self.port` drops
    }
}

/// Bytes received but not yet handed out as a line.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fills the buffer from `reader` until it holds a newline,
    /// [`MAX_LINE_LENGTH`] bytes, or the reader times out or hits EOF.
    fn read_line<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<String> {
        let mut chunk = [0u8; 64];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                return self.take(pos + 1);
            }
            if self.pending.len() >= MAX_LINE_LENGTH {
                return self.take(MAX_LINE_LENGTH);
            }

            let room = (MAX_LINE_LENGTH - self.pending.len()).min(chunk.len());
            match reader.read(&mut chunk[..room]) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let len = self.pending.len();
        self.take(len)
    }

    // The bytes are consumed even when they are not valid UTF-8.
    fn take(&mut self, end: usize) -> io::Result<String> {
        let bytes: Vec<u8> = self.pending.drain(..end).collect();
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Lists the serial ports of USB devices with the given vendor id, sorted by
/// port name.
pub fn discover(vendor_id: u16) -> Result<Vec<String>, serialport::Error> {
    let mut addresses: Vec<String> = serialport::available_ports()?
        .into_iter()
        .filter(|port| {
            matches!(&port.port_type, SerialPortType::UsbPort(usb) if usb.vid == vendor_id)
        })
        .map(|port| port.port_name)
        .collect();
    addresses.sort();

    Ok(addresses)
}
