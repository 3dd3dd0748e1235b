use crate::reading::Reading;

/// Prefix the firmware uses for diagnostic lines.
pub const COMMENT_MARKER: char = '#';
/// Separator between the fields of a data line.
pub const DELIMITER: char = ',';

/// Classification of one line received from a sensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Line<'a> {
    Reading { serial_number: &'a str, reading: Reading },
    Comment(&'a str),
    Empty,
    Malformed(Malformed),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Malformed {
    #[error("expected 4 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    #[error("invalid temperature {0:?}")]
    Temperature(String),

    #[error("invalid humidity {0:?}")]
    Humidity(String),

    #[error("serial number {got:?} does not match {expected:?}")]
    SerialMismatch { expected: String, got: String },
}

/// Parses `serial_number, timestamp, temperature, humidity`.
///
/// Surrounding whitespace (including the `\r\n` terminator) is ignored both
/// for the whole line and for each field.
pub fn parse_line(line: &str) -> Line<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Line::Empty;
    }
    if line.starts_with(COMMENT_MARKER) {
        return Line::Comment(line);
    }

    let fields: Vec<&str> = line.split(DELIMITER).map(str::trim).collect();
    let [serial_number, timestamp, temperature, humidity] = fields[..] else {
        return Line::Malformed(Malformed::FieldCount(fields.len()));
    };

    let Ok(timestamp) = timestamp.parse::<u64>() else {
        return Line::Malformed(Malformed::Timestamp(timestamp.to_string()));
    };
    let Ok(temperature) = temperature.parse::<f32>() else {
        return Line::Malformed(Malformed::Temperature(temperature.to_string()));
    };
    let Ok(humidity) = humidity.parse::<f32>() else {
        return Line::Malformed(Malformed::Humidity(humidity.to_string()));
    };

    Line::Reading {
        serial_number,
        reading: Reading {
            timestamp,
            temperature,
            humidity,
        },
    }
}
