use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use backon::{BlockingRetryable, ConstantBuilder};

use crate::config::DeviceConfig;
use crate::line::{Line, Malformed, parse_line};
use crate::port::{Connector, Port};
use crate::reading::Reading;

pub const IDENTIFY_COMMAND: u8 = b'n';
pub const START_COMMAND: u8 = b's';
pub const UPDATE_COMMAND: u8 = b'u';

pub const UNKNOWN_LABEL: &str = "unknown";

/// Limit on lines discarded in one drain, for devices that never go quiet.
const MAX_DRAIN_LINES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("could not open {address}: {source}")]
    Open {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("could not read a serial number from {address}")]
    NoSerialNumber { address: String },

    #[error("I/O error on {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Who a session is talking to. Fixed once the handshake succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub address: String,
    pub serial_number: String,
    pub label: String,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.label)
    }
}

/// Serial number to human label mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap(HashMap<String, String>);

impl LabelMap {
    pub fn new<I, S, L>(entries: I) -> LabelMap
    where
        I: IntoIterator<Item = (S, L)>,
        S: Into<String>,
        L: Into<String>,
    {
        LabelMap(
            entries
                .into_iter()
                .map(|(serial, label)| (serial.into(), label.into()))
                .collect(),
        )
    }

    pub fn get(&self, serial_number: &str) -> Option<&str> {
        self.0.get(serial_number).map(String::as_str)
    }

    /// Falls back to [`UNKNOWN_LABEL`] for serial numbers not in the map.
    pub fn label_for(&self, serial_number: &str) -> &str {
        self.get(serial_number).unwrap_or(UNKNOWN_LABEL)
    }
}

impl Default for LabelMap {
    fn default() -> Self {
        LabelMap::new([
            ("0xEFCF86D7", "yellow"),
            ("0xF030D05B", "blue"),
            ("0xF030D0CF", "red"),
        ])
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected serial=label, got {0:?}")]
pub struct LabelParseError(String);

impl FromStr for LabelMap {
    type Err = LabelParseError;

    /// Parses `serial=label,serial=label`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((serial, label)) = entry.split_once('=') else {
                return Err(LabelParseError(entry.to_string()));
            };
            let (serial, label) = (serial.trim(), label.trim());
            if serial.is_empty() || label.is_empty() {
                return Err(LabelParseError(entry.to_string()));
            }
            entries.push((serial, label));
        }

        Ok(LabelMap::new(entries))
    }
}

/// How a device is asked for data once it is streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStrategy {
    /// The device measures once per `u` byte.
    UpdateRequest,
    /// The device measures on its own clock every `interval`.
    Continuous { interval: Duration },
}

impl PollingStrategy {
    pub fn start_command(&self) -> Vec<u8> {
        match self {
            PollingStrategy::UpdateRequest => vec![START_COMMAND],
            PollingStrategy::Continuous { interval } => {
                let mut command = vec![START_COMMAND];
                command.extend_from_slice(format!("{}\n", interval.as_millis()).as_bytes());
                command
            }
        }
    }

    pub fn update_command(&self) -> Option<u8> {
        match self {
            PollingStrategy::UpdateRequest => Some(UPDATE_COMMAND),
            PollingStrategy::Continuous { .. } => None,
        }
    }
}

/// One identified sensor and the port it owns.
pub struct DeviceSession {
    identity: DeviceIdentity,
    port: Box<dyn Port>,
    latest: Option<Reading>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.identity)
            .field("latest", &self.latest)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Opens `address`, discards the power-on banner and asks the device for
    /// its serial number.
    ///
    /// Blocks for at least two settle delays; call it off the async runtime.
    pub fn open(
        connector: &dyn Connector,
        address: &str,
        labels: &LabelMap,
        config: &DeviceConfig,
    ) -> Result<DeviceSession, DeviceError> {
        let mut port = connector
            .connect(address)
            .map_err(|source| DeviceError::Open {
                address: address.to_string(),
                source,
            })?;

        std::thread::sleep(config.settle_delay);
        log_banner(address, port.as_mut());

        let retry = ConstantBuilder::default()
            .with_delay(config.settle_delay)
            .with_max_times(config.identify_attempts.saturating_sub(1));
        let serial_number = (|| identify(port.as_mut(), address, config.settle_delay))
            .retry(retry)
            .notify(|e, dur| {
                log::warn!("{e}");
                log::info!("Retrying identification of {address} in {dur:?}");
            })
            .call();

        let serial_number = match serial_number {
            Ok(serial_number) => serial_number,
            Err(e) => {
                if let Err(close_err) = port.close() {
                    log::error!("Failed to close {address}: {close_err}");
                }
                return Err(e);
            }
        };

        if labels.get(&serial_number).is_none() {
            log::warn!(
                "Unknown serial number {serial_number} on {address}, labelling it '{UNKNOWN_LABEL}'"
            );
        }
        let label = labels.label_for(&serial_number).to_string();

        let identity = DeviceIdentity {
            address: address.to_string(),
            serial_number,
            label,
        };
        log::info!("Opened {identity}, serial number: {}", identity.serial_number);

        Ok(DeviceSession {
            identity,
            port,
            latest: None,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The reading captured by the most recent [`collect`](Self::collect).
    pub fn latest(&self) -> Option<&Reading> {
        self.latest.as_ref()
    }

    pub fn start_streaming(&mut self, strategy: &PollingStrategy) -> Result<(), DeviceError> {
        self.port
            .write_all(&strategy.start_command())
            .map_err(|source| self.io_error(source))
    }

    /// Logs and discards everything the device has buffered.
    pub fn drain(&mut self) {
        log_banner(&self.identity.to_string(), self.port.as_mut());
    }

    /// Sends the per-tick update request, if the strategy uses one.
    pub fn request_update(&mut self, strategy: &PollingStrategy) {
        let Some(command) = strategy.update_command() else {
            return;
        };
        if let Err(e) = self.port.write_all(&[command]) {
            log::error!("{}: {}", self.identity, self.io_error(e));
        }
    }

    /// Reads at most one line and keeps it as this tick's reading if it is a
    /// valid data line from this device.
    pub fn collect(&mut self) -> Option<Reading> {
        self.latest = None;

        let line = match self.read_pending_line() {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => {
                log::error!("{}: {e}", self.identity);
                return None;
            }
        };

        match parse_line(&line) {
            Line::Reading {
                serial_number,
                reading,
            } if serial_number == self.identity.serial_number => {
                log::debug!("{}: device time {}", self.identity, reading.timestamp);
                self.latest = Some(reading);
            }
            Line::Reading { serial_number, .. } => {
                let mismatch = Malformed::SerialMismatch {
                    expected: self.identity.serial_number.clone(),
                    got: serial_number.to_string(),
                };
                log::warn!("{}: Malformed line {:?}: {mismatch}", self.identity, line.trim());
            }
            Line::Comment(comment) => log::info!("{}: Comment line: {comment}", self.identity),
            Line::Empty => {}
            Line::Malformed(e) => {
                log::warn!("{}: Malformed line {:?}: {e}", self.identity, line.trim());
            }
        }

        self.latest
    }

    /// Releases the port. Consuming `self` makes a second close impossible.
    pub fn close(self) -> Result<(), DeviceError> {
        let address = self.identity.address;
        self.port
            .close()
            .map_err(|source| DeviceError::Io { address, source })
    }

    fn read_pending_line(&mut self) -> Result<Option<String>, DeviceError> {
        if !self.port.has_input().map_err(|e| self.io_error(e))? {
            return Ok(None);
        }
        self.port
            .read_line()
            .map(Some)
            .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: io::Error) -> DeviceError {
        DeviceError::Io {
            address: self.identity.address.clone(),
            source,
        }
    }
}

/// Sends the identify command and returns the first line that looks like a
/// serial number. Comment and data lines still arriving from the device are
/// skipped; an empty read means the device has gone quiet.
fn identify(
    port: &mut dyn Port,
    address: &str,
    settle_delay: Duration,
) -> Result<String, DeviceError> {
    let io_error = |source| DeviceError::Io {
        address: address.to_string(),
        source,
    };

    port.write_all(&[IDENTIFY_COMMAND]).map_err(io_error)?;
    std::thread::sleep(settle_delay);

    for _ in 0..MAX_DRAIN_LINES {
        let line = port.read_line().map_err(io_error)?;
        if line.is_empty() {
            break;
        }
        match parse_line(&line) {
            Line::Malformed(Malformed::FieldCount(1)) => return Ok(line.trim().to_string()),
            Line::Empty => {}
            Line::Comment(comment) => log::info!("{address}: Comment line: {comment}"),
            _ => log::debug!("{address}: Skipping {:?} while identifying", line.trim()),
        }
    }

    Err(DeviceError::NoSerialNumber {
        address: address.to_string(),
    })
}

fn log_banner(name: &str, port: &mut dyn Port) {
    let mut message = String::new();
    for _ in 0..MAX_DRAIN_LINES {
        match port.has_input() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                log::error!("{name}: {e}");
                break;
            }
        }
        match port.read_line() {
            Ok(line) => {
                message.push_str("  ");
                message.push_str(line.trim_end());
                message.push('\n');
            }
            Err(e) => {
                log::error!("{name}: {e}");
                break;
            }
        }
    }

    if !message.is_empty() {
        log::info!("Message from {name}:\n{message}");
    }
}
