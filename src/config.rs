use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;

use crate::device::{LabelMap, PollingStrategy};
use crate::port::{ADAFRUIT_VENDOR_ID, SerialConnector};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);
pub const RESPONSE_DELAY: Duration = Duration::from_millis(100);
pub const IDENTIFY_ATTEMPTS: usize = 3;
pub const FILE_PREFIX: &str = "sensor_readings";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub serial: SerialConnector,
    pub vendor_id: u16,
    pub acquisition: AcquisitionConfig,
    pub output: OutputConfig,
    pub labels: LabelMap,
    pub log_level: LevelFilter,
}

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub poll_interval: Duration,
    pub strategy: PollingStrategy,
    /// Time given to devices to answer an update request before reading.
    pub response_delay: Duration,
    pub emit_empty_rows: bool,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Wait after opening a port and after sending identify/start commands.
    pub settle_delay: Duration,
    pub identify_attempts: usize,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            poll_interval: POLL_INTERVAL,
            strategy: PollingStrategy::UpdateRequest,
            response_delay: RESPONSE_DELAY,
            emit_empty_rows: false,
            device: DeviceConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            settle_delay: SETTLE_DELAY,
            identify_attempts: IDENTIFY_ATTEMPTS,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: PathBuf::from("."),
            file_prefix: FILE_PREFIX.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial: SerialConnector::default(),
            vendor_id: ADAFRUIT_VENDOR_ID,
            acquisition: AcquisitionConfig::default(),
            output: OutputConfig::default(),
            labels: LabelMap::default(),
            log_level: LevelFilter::Info,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from the defaults, overriding every setting
    /// for which `lookup` returns a value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(ms) = read::<u64>(&lookup, "SENSOR_LOGGER_INTERVAL_MS")? {
            if ms == 0 {
                return Err(invalid("SENSOR_LOGGER_INTERVAL_MS", "0"));
            }
            config.acquisition.poll_interval = Duration::from_millis(ms);
        }
        if let Some(mode) = lookup("SENSOR_LOGGER_MODE") {
            config.acquisition.strategy = match mode.trim() {
                "update" => PollingStrategy::UpdateRequest,
                "continuous" => PollingStrategy::Continuous {
                    interval: config.acquisition.poll_interval,
                },
                other => return Err(invalid("SENSOR_LOGGER_MODE", other)),
            };
        }
        if let Some(ms) = read::<u64>(&lookup, "SENSOR_LOGGER_RESPONSE_DELAY_MS")? {
            config.acquisition.response_delay = Duration::from_millis(ms);
        }
        if let Some(emit) = read::<bool>(&lookup, "SENSOR_LOGGER_EMIT_EMPTY_ROWS")? {
            config.acquisition.emit_empty_rows = emit;
        }
        if let Some(ms) = read::<u64>(&lookup, "SENSOR_LOGGER_SETTLE_MS")? {
            config.acquisition.device.settle_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = read::<usize>(&lookup, "SENSOR_LOGGER_IDENTIFY_ATTEMPTS")? {
            if attempts == 0 {
                return Err(invalid("SENSOR_LOGGER_IDENTIFY_ATTEMPTS", "0"));
            }
            config.acquisition.device.identify_attempts = attempts;
        }

        if let Some(baud_rate) = read::<u32>(&lookup, "SENSOR_LOGGER_BAUD_RATE")? {
            config.serial.baud_rate = baud_rate;
        }
        if let Some(ms) = read::<u64>(&lookup, "SENSOR_LOGGER_READ_TIMEOUT_MS")? {
            if ms == 0 {
                return Err(invalid("SENSOR_LOGGER_READ_TIMEOUT_MS", "0"));
            }
            config.serial.read_timeout = Duration::from_millis(ms);
        }
        if let Some(vendor_id) = lookup("SENSOR_LOGGER_VENDOR_ID") {
            let digits = vendor_id.trim();
            let digits = digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
                .unwrap_or(digits);
            config.vendor_id = u16::from_str_radix(digits, 16)
                .map_err(|_| invalid("SENSOR_LOGGER_VENDOR_ID", &vendor_id))?;
        }

        if let Some(dir) = lookup("SENSOR_LOGGER_OUTPUT_DIR") {
            config.output.dir = PathBuf::from(dir);
        }
        if let Some(prefix) = lookup("SENSOR_LOGGER_FILE_PREFIX") {
            config.output.file_prefix = prefix;
        }

        if let Some(labels) = lookup("SENSOR_LOGGER_LABELS") {
            config.labels = labels
                .parse()
                .map_err(|_| invalid("SENSOR_LOGGER_LABELS", &labels))?;
        }
        if let Some(level) = read::<LevelFilter>(&lookup, "SENSOR_LOGGER_LOG_LEVEL")? {
            config.log_level = level;
        }

        Ok(config)
    }
}

fn read<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| value.trim().parse().map_err(|_| invalid(key, &value)))
        .transpose()
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid(key, value.to_string())
}
