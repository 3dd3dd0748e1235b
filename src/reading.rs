/// One temperature/humidity sample as reported by a sensor.
///
/// `timestamp` is the device's own uptime clock (milliseconds since boot on
/// the current firmware) and is not comparable across devices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub timestamp: u64,
    pub temperature: f32,
    pub humidity: f32,
}

#[cfg(test)]
impl Reading {
    /// Formats the reading the way the firmware prints it on a data line.
    pub fn to_line(&self, serial_number: &str) -> String {
        format!(
            "{}, {}, {}, {}",
            serial_number, self.timestamp, self.temperature, self.humidity
        )
    }
}
