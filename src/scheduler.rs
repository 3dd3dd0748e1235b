use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::Local;
use tokio::time::{MissedTickBehavior, interval, sleep};

use crate::aggregator::{Schema, aggregate};
use crate::config::AcquisitionConfig;
use crate::device::{DeviceIdentity, DeviceSession, LabelMap};
use crate::port::Connector;
use crate::sink::CsvSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Identifying,
    Streaming,
    Draining,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("No candidate devices found")]
    NoCandidates,

    #[error("None of the {0} candidate devices could be identified")]
    NoActiveDevices(usize),

    #[error("Failed to write to the log: {0}")]
    Sink(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub devices: Vec<DeviceIdentity>,
    pub ticks: u64,
    pub rows_written: u64,
}

/// Drives one logging session from identification to the final close.
pub struct Scheduler<W: Write> {
    config: AcquisitionConfig,
    connector: Arc<dyn Connector>,
    labels: Arc<LabelMap>,
    sink: CsvSink<W>,
    state: State,
    sessions: Vec<DeviceSession>,
    ticks: u64,
    rows_written: u64,
}

impl<W: Write> Scheduler<W> {
    pub fn new(
        config: AcquisitionConfig,
        connector: Arc<dyn Connector>,
        labels: LabelMap,
        sink: CsvSink<W>,
    ) -> Self {
        Self {
            config,
            connector,
            labels: Arc::new(labels),
            sink,
            state: State::Idle,
            sessions: Vec::new(),
            ticks: 0,
            rows_written: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Identifies the candidates, writes the header and logs one row per
    /// tick until `shutdown` completes.
    ///
    /// `shutdown` is only checked between ticks, so a tick that has started
    /// always writes its row. Every opened device is closed before this
    /// returns, whatever the outcome.
    pub async fn run(
        mut self,
        candidates: Vec<String>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary, AcquisitionError> {
        if candidates.is_empty() {
            return Err(AcquisitionError::NoCandidates);
        }

        self.identify(&candidates).await;
        if self.sessions.is_empty() {
            return Err(AcquisitionError::NoActiveDevices(candidates.len()));
        }
        let devices: Vec<DeviceIdentity> = self
            .sessions
            .iter()
            .map(|session| session.identity().clone())
            .collect();

        let outcome = self.stream(shutdown).await;
        self.close_all();

        outcome.map(|()| RunSummary {
            devices,
            ticks: self.ticks,
            rows_written: self.rows_written,
        })
    }

    async fn identify(&mut self, candidates: &[String]) {
        self.transition(State::Identifying);

        let handles: Vec<_> = candidates
            .iter()
            .map(|address| {
                let connector = Arc::clone(&self.connector);
                let labels = Arc::clone(&self.labels);
                let config = self.config.device.clone();
                let task_address = address.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    DeviceSession::open(connector.as_ref(), &task_address, &labels, &config)
                });
                (address, handle)
            })
            .collect();

        for (address, handle) in handles {
            match handle.await {
                Ok(Ok(session)) => self.sessions.push(session),
                Ok(Err(e)) => log::warn!("Dropping {address}: {e}"),
                Err(e) => log::error!("Identification task for {address} failed: {e}"),
            }
        }

        log::info!(
            "{} of {} devices identified",
            self.sessions.len(),
            candidates.len()
        );
    }

    async fn stream(
        &mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), AcquisitionError> {
        let schema = Schema::new(self.sessions.iter().map(DeviceSession::identity));
        self.transition(State::Streaming);

        self.sink
            .write_header(&schema)
            .map_err(AcquisitionError::Sink)?;
        log::info!(
            "Header for {} devices: {:?}, length: {}",
            schema.device_count(),
            schema.columns(),
            schema.width()
        );

        let strategy = self.config.strategy;
        for session in &mut self.sessions {
            if let Err(e) = session.start_streaming(&strategy) {
                log::error!("{}: Failed to start streaming: {e}", session.identity());
            }
        }
        sleep(self.config.device.settle_delay).await;
        for session in &mut self.sessions {
            session.drain();
        }

        log::info!("Logging data every {:?}. Press Ctrl+C to stop.", self.config.poll_interval);

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            self.tick(&schema).await?;
        }

        Ok(())
    }

    async fn tick(&mut self, schema: &Schema) -> Result<(), AcquisitionError> {
        self.ticks += 1;
        let timestamp = Local::now();
        let strategy = self.config.strategy;

        for session in &mut self.sessions {
            session.request_update(&strategy);
        }
        if strategy.update_command().is_some() {
            sleep(self.config.response_delay).await;
        }
        for session in &mut self.sessions {
            session.collect();
        }

        let row = aggregate(
            schema,
            timestamp,
            self.sessions.iter().map(DeviceSession::latest),
        );
        if !row.has_data() && !self.config.emit_empty_rows {
            log::debug!("No device reported in tick {}", self.ticks);
            return Ok(());
        }

        self.sink.write_row(&row).map_err(AcquisitionError::Sink)?;
        self.rows_written += 1;
        log::info!("Logged: {:?}", row.to_record());

        Ok(())
    }

    fn close_all(&mut self) {
        self.transition(State::Draining);

        for session in self.sessions.drain(..) {
            let name = session.identity().to_string();
            match session.close() {
                Ok(()) => log::info!("Closed {name}"),
                Err(e) => log::error!("Failed to close {name}: {e}"),
            }
        }

        self.transition(State::Closed);
    }

    fn transition(&mut self, next: State) {
        log::debug!("{:?} -> {:?}", self.state(), next);
        self.state = next;
    }
}
