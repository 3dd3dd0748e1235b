use chrono::{DateTime, Local, SecondsFormat};

use crate::device::DeviceIdentity;
use crate::reading::Reading;

pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Column layout of one logging session.
///
/// Device `i` (in session order) owns the temperature cell at `offsets[i]`
/// and the humidity cell right after it. Offsets index into [`Row::cells`],
/// which excludes the timestamp column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<String>,
    offsets: Vec<usize>,
}

impl Schema {
    pub fn new<'a>(devices: impl IntoIterator<Item = &'a DeviceIdentity>) -> Schema {
        let mut columns = vec![TIMESTAMP_COLUMN.to_string()];
        let mut offsets = Vec::new();
        for device in devices {
            offsets.push(columns.len() - 1);
            columns.push(format!("{}_temperature", device.label));
            columns.push(format!("{}_humidity", device.label));
        }

        Schema { columns, offsets }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn device_count(&self) -> usize {
        self.offsets.len()
    }

    /// Total number of cells in a row, timestamp included.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn offset(&self, device: usize) -> Option<usize> {
        self.offsets.get(device).copied()
    }
}

/// One tick's worth of data across all devices of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp: DateTime<Local>,
    cells: Box<[Option<f32>]>,
}

impl Row {
    pub fn empty(schema: &Schema, timestamp: DateTime<Local>) -> Row {
        Row {
            timestamp,
            cells: vec![None; schema.width() - 1].into_boxed_slice(),
        }
    }

    /// Places `reading` in the cells owned by `device`. Returns `false` if the
    /// schema has no such device.
    pub fn set(&mut self, schema: &Schema, device: usize, reading: &Reading) -> bool {
        let Some(offset) = schema.offset(device) else {
            return false;
        };
        match self.cells.get_mut(offset..offset + 2) {
            Some([temperature, humidity]) => {
                *temperature = Some(reading.temperature);
                *humidity = Some(reading.humidity);
                true
            }
            _ => false,
        }
    }

    pub fn cells(&self) -> &[Option<f32>] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        1 + self.cells.len()
    }

    pub fn has_data(&self) -> bool {
        self.cells.iter().any(Option::is_some)
    }

    /// Renders every cell as text; missing values become empty strings.
    pub fn to_record(&self) -> Vec<String> {
        let mut record = Vec::with_capacity(self.len());
        record.push(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, false));
        record.extend(
            self.cells()
                .iter()
                .map(|cell| cell.map(|value| value.to_string()).unwrap_or_default()),
        );
        record
    }
}

/// Builds the row for one tick from each device's reading, in session order.
///
/// The row is stamped with `timestamp`, never with a device clock.
pub fn aggregate<'a>(
    schema: &Schema,
    timestamp: DateTime<Local>,
    readings: impl IntoIterator<Item = Option<&'a Reading>>,
) -> Row {
    let mut row = Row::empty(schema, timestamp);
    for (device, reading) in readings.into_iter().enumerate() {
        if let Some(reading) = reading {
            if !row.set(schema, device, reading) {
                log::warn!("Dropping reading for device #{device}, which is not in the schema");
            }
        }
    }
    row
}
