//! Scripted stand-ins for the sensor firmware and the log file.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::port::{Connector, Port};

type UpdateHook = Box<dyn FnMut(usize) + Send>;

/// Behaves like the trinkey firmware: answers `n` with its serial number,
/// prints a banner on `s` and answers each `u` with the next scripted line.
/// With `s<ms>\n` it instead emits one scripted line per interval.
pub struct MockDevice {
    address: String,
    serial_number: Option<String>,
    before_serial: Vec<String>,
    inbox: VecDeque<u8>,
    responses: VecDeque<String>,
    ignore_identify: usize,
    fail_update_reads: usize,
    fail_next_read: bool,
    fail_close: bool,
    streaming: bool,
    interval_digits: Option<String>,
    continuous: Option<Duration>,
    stream_started: Option<Instant>,
    emitted: u128,
    updates: usize,
    on_update: Option<UpdateHook>,
    written: Arc<Mutex<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
}

impl MockDevice {
    pub fn new(address: &str, serial_number: &str) -> MockDevice {
        let mut device = MockDevice::silent(address);
        device.push_line(&format!("# Serial number: {serial_number}"));
        device.push_line(
            "Send 's' to start measurement, 'n' to get serial number, 'h' for decontamination.",
        );
        device.serial_number = Some(serial_number.to_string());
        device
    }

    /// A device that never reports a serial number.
    pub fn silent(address: &str) -> MockDevice {
        let mut device = MockDevice {
            address: address.to_string(),
            serial_number: None,
            before_serial: Vec::new(),
            inbox: VecDeque::new(),
            responses: VecDeque::new(),
            ignore_identify: 0,
            fail_update_reads: 0,
            fail_next_read: false,
            fail_close: false,
            streaming: false,
            interval_digits: None,
            continuous: None,
            stream_started: None,
            emitted: 0,
            updates: 0,
            on_update: None,
            written: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        };
        device.push_line("# Adafruit SHT41");
        device.push_line("# Found SHT4x sensor");
        device
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn respond_with(mut self, line: &str) -> MockDevice {
        self.responses.push_back(line.to_string());
        self
    }

    /// Line printed in answer to `n` ahead of the serial number.
    pub fn before_serial(mut self, line: &str) -> MockDevice {
        self.before_serial.push(line.to_string());
        self
    }

    pub fn ignore_identify(mut self, times: usize) -> MockDevice {
        self.ignore_identify = times;
        self
    }

    /// The read following each of the first `times` update requests fails.
    pub fn fail_update_reads(mut self, times: usize) -> MockDevice {
        self.fail_update_reads = times;
        self
    }

    pub fn fail_close(mut self) -> MockDevice {
        self.fail_close = true;
        self
    }

    /// Called with the running count of `u` commands received.
    pub fn on_update(mut self, hook: impl FnMut(usize) + Send + 'static) -> MockDevice {
        self.on_update = Some(Box::new(hook));
        self
    }

    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    fn push_line(&mut self, line: &str) {
        self.inbox.extend(line.as_bytes());
        self.inbox.extend(b"\r\n");
    }

    fn handle(&mut self, byte: u8) {
        if let Some(digits) = self.interval_digits.as_mut() {
            if byte.is_ascii_digit() {
                digits.push(byte as char);
                return;
            }
            let digits = self.interval_digits.take().unwrap_or_default();
            if !digits.is_empty() {
                let ms: u64 = digits.parse().unwrap();
                self.continuous = Some(Duration::from_millis(ms));
                return;
            }
        }

        match byte {
            b'n' if self.ignore_identify > 0 => self.ignore_identify -= 1,
            b'n' => {
                for line in self.before_serial.clone() {
                    self.push_line(&line);
                }
                if let Some(serial_number) = self.serial_number.clone() {
                    self.push_line(&serial_number);
                }
            }
            b's' if !self.streaming => {
                self.streaming = true;
                self.interval_digits = Some(String::new());
                self.push_line("Enabled the watchdog with max countdown of 60000 milliseconds!");
                self.push_line("#=========================#");
                self.push_line(
                    "# sht4SerialNumber, timestamp, temperature (degrees C), humidity (% rH)",
                );
            }
            b'u' if self.streaming && self.continuous.is_none() => {
                self.updates += 1;
                let updates = self.updates;
                if let Some(hook) = self.on_update.as_mut() {
                    hook(updates);
                }
                if let Some(line) = self.responses.pop_front() {
                    self.push_line(&line);
                }
                if self.fail_update_reads > 0 {
                    self.fail_update_reads -= 1;
                    self.fail_next_read = true;
                }
            }
            _ => {}
        }
    }

    fn emit_due_lines(&mut self) {
        let Some(interval) = self.continuous else {
            return;
        };
        let started = *self.stream_started.get_or_insert_with(Instant::now);
        let due = started.elapsed().as_millis() / interval.as_millis();
        while self.emitted < due {
            self.emitted += 1;
            if let Some(line) = self.responses.pop_front() {
                self.push_line(&line);
            }
        }
    }
}

impl Port for MockDevice {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.written.lock().unwrap().extend_from_slice(bytes);
        for &byte in bytes {
            self.handle(byte);
        }
        Ok(())
    }

    fn has_input(&mut self) -> io::Result<bool> {
        self.emit_due_lines();
        Ok(!self.inbox.is_empty())
    }

    fn read_line(&mut self) -> io::Result<String> {
        if self.fail_next_read {
            self.fail_next_read = false;
            return Err(io::Error::other("device reports an error"));
        }
        let end = self
            .inbox
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.inbox.len(), |pos| pos + 1);
        let bytes: Vec<u8> = self.inbox.drain(..end).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(io::Error::other("close failed"));
        }
        Ok(())
    }
}

pub struct MockConnector {
    devices: Mutex<HashMap<String, MockDevice>>,
}

impl MockConnector {
    pub fn new(devices: impl IntoIterator<Item = MockDevice>) -> MockConnector {
        MockConnector {
            devices: Mutex::new(
                devices
                    .into_iter()
                    .map(|device| (device.address.clone(), device))
                    .collect(),
            ),
        }
    }
}

impl Connector for MockConnector {
    fn connect(&self, address: &str) -> io::Result<Box<dyn Port>> {
        match self.devices.lock().unwrap().remove(address) {
            Some(device) => Ok(Box::new(device)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such device {address}"),
            )),
        }
    }
}

#[derive(Default)]
struct SharedBufferInner {
    bytes: Vec<u8>,
    lines: usize,
    trigger: Option<(usize, oneshot::Sender<()>)>,
}

/// An in-memory sink that can signal once a number of lines was written.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<SharedBufferInner>>);

impl SharedBuffer {
    pub fn new() -> SharedBuffer {
        SharedBuffer::default()
    }

    pub fn notify_after_lines(&self, lines: usize) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.0.lock().unwrap().trigger = Some((lines, tx));
        rx
    }

    pub fn lines(&self) -> Vec<String> {
        let inner = self.0.lock().unwrap();
        String::from_utf8_lossy(&inner.bytes)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.0.lock().unwrap();
        inner.bytes.extend_from_slice(buf);
        inner.lines += buf.iter().filter(|&&b| b == b'\n').count();

        let reached = matches!(&inner.trigger, Some((lines, _)) if inner.lines >= *lines);
        if reached {
            if let Some((_, tx)) = inner.trigger.take() {
                let _ = tx.send(());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Splits a CSV line written by the sink into its cells.
pub fn cells(line: &str) -> Vec<&str> {
    line.split(',').collect()
}
