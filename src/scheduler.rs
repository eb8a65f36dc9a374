use crate::prelude::*;
use crate::clock::Clock;
use crate::mppt::session::{poll_station, Connector, PollOptions};
use crate::sink::{RecordSink, Sink};
use crate::stations;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Time left to wait before the next cycle may start. Zero if the cycle overran.
pub fn cadence_sleep(floor: Duration, elapsed: Duration) -> Duration {
    floor.saturating_sub(elapsed)
}

#[derive(Debug, Default)]
pub struct PollStats {
    pub cycles: u64,
    pub polls: u64,
    pub records: u64,
    pub field_errors: u64,
    pub station_list_errors: u64,
    // Failures by kind
    pub connect_failures: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub closed: u64,
    pub frame_errors: u64,
    // Sinks
    pub sink_writes: u64,
    pub sink_errors: u64,
    // Per station
    pub station_failures: HashMap<String, u64>,
    pub last_errors: HashMap<String, String>,
}

impl PollStats {
    fn record_failure(&mut self, station: &str, err: &PollError) {
        match err {
            PollError::Connect { .. } | PollError::ConnectTimeout { .. } => self.connect_failures += 1,
            PollError::Timeout(_) => self.timeouts += 1,
            PollError::Transport(_) => self.transport_errors += 1,
            PollError::Closed => self.closed += 1,
            PollError::Frame(_) => self.frame_errors += 1,
        }
        *self.station_failures.entry(station.to_string()).or_default() += 1;
        self.last_errors.insert(station.to_string(), err.to_string());
    }

    pub fn failures(&self) -> u64 {
        self.connect_failures + self.timeouts + self.transport_errors + self.closed + self.frame_errors
    }

    pub fn print_summary(&self) {
        info!("Poll Statistics:");
        info!("  Cycles completed: {}", self.cycles);
        info!("  Stations polled: {}", self.polls);
        info!("  Records decoded: {}", self.records);
        info!("  Fields not decoded: {}", self.field_errors);
        info!("  Station list errors: {}", self.station_list_errors);
        info!("  Failures:");
        info!("    Connect: {}", self.connect_failures);
        info!("    Timeout: {}", self.timeouts);
        info!("    Transport: {}", self.transport_errors);
        info!("    Closed by peer: {}", self.closed);
        info!("    Bad frame: {}", self.frame_errors);
        info!("  Sinks:");
        info!("    Writes: {}", self.sink_writes);
        info!("    Errors: {}", self.sink_errors);
        info!("  Failures by station:");
        for (station, count) in &self.station_failures {
            info!("    {}: {}", station, count);
            if let Some(last) = self.last_errors.get(station) {
                info!("    Last error: {}", last);
            }
        }
    }
}

pub struct Scheduler<C, K> {
    config: ConfigWrapper,
    registry: Arc<SchemaRegistry>,
    connector: C,
    clock: K,
    sinks: Vec<Sink>,
    pub stats: Arc<Mutex<PollStats>>,
}

impl<C, K> Scheduler<C, K>
where
    C: Connector,
    K: Clock,
{
    pub fn new(
        config: ConfigWrapper,
        registry: Arc<SchemaRegistry>,
        connector: C,
        clock: K,
        sinks: Vec<Sink>,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            clock,
            sinks,
            stats: Arc::new(Mutex::new(PollStats::default())),
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut PollStats)) {
        match self.stats.lock() {
            Ok(mut stats) => f(&mut stats),
            Err(_) => warn!("poll stats lock poisoned"),
        }
    }

    /// Polls every enabled station once and returns how long that took.
    pub async fn run_cycle(&self) -> Duration {
        self.cycle(None).await.0
    }

    fn shutdown_requested(shutdown: &mut Option<&mut broadcast::Receiver<()>>) -> bool {
        match shutdown {
            Some(rx) => !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
            None => false,
        }
    }

    /// One pass over the station list. In sequential mode a shutdown signal is
    /// honoured between stations; the flag reports whether that happened.
    async fn cycle(&self, mut shutdown: Option<&mut broadcast::Receiver<()>>) -> (Duration, bool) {
        let started = self.clock.now();
        let mut interrupted = false;

        let list = match stations::load(self.config.station_file()) {
            Ok(list) => list,
            Err(e) => {
                error!("{}", e);
                self.with_stats(|s| {
                    s.station_list_errors += 1;
                    s.cycles += 1;
                });
                return (self.clock.now().saturating_duration_since(started), false);
            }
        };
        if list.error.is_some() {
            self.with_stats(|s| s.station_list_errors += 1);
        }

        let options = PollOptions::from(&self.config);
        let enabled: Vec<&Station> = list.enabled().collect();

        if self.config.concurrent() {
            let polls = enabled
                .iter()
                .map(|station| poll_station(&self.connector, &self.clock, station, &self.registry, options));
            let results = futures::future::join_all(polls).await;
            for (station, result) in enabled.iter().zip(results) {
                self.handle(station, result);
            }
        } else {
            for (done, station) in enabled.iter().enumerate() {
                if Self::shutdown_requested(&mut shutdown) {
                    info!("shutdown requested, skipping {} stations", enabled.len() - done);
                    interrupted = true;
                    break;
                }
                let result = poll_station(&self.connector, &self.clock, station, &self.registry, options).await;
                self.handle(station, result);
            }
        }

        self.with_stats(|s| s.cycles += 1);
        let elapsed = self.clock.now().saturating_duration_since(started);
        debug!("cycle of {} stations took {:.3}s", enabled.len(), elapsed.as_secs_f64());
        (elapsed, interrupted)
    }

    fn handle(&self, station: &Station, result: Result<DecodedRecord, PollError>) {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                error!("{}: {}", station, e);
                self.with_stats(|s| {
                    s.polls += 1;
                    s.record_failure(&station.name, &e);
                });
                return;
            }
        };

        let field_errors = record.errors().count() as u64;
        self.with_stats(|s| {
            s.polls += 1;
            s.records += 1;
            s.field_errors += field_errors;
        });

        for sink in &self.sinks {
            match sink.publish(&record) {
                Ok(()) => self.with_stats(|s| s.sink_writes += 1),
                Err(e) => {
                    error!("{}: sink {} failed: {}", station.name, sink.name(), e);
                    self.with_stats(|s| s.sink_errors += 1);
                }
            }
        }
    }

    /// One cycle followed by the cadence wait. Returns the wait, or `None` if the
    /// shutdown signal cut it short.
    pub async fn tick(&self, shutdown: &mut broadcast::Receiver<()>) -> Option<Duration> {
        let (elapsed, interrupted) = self.cycle(Some(&mut *shutdown)).await;
        if interrupted {
            return None;
        }
        let pause = cadence_sleep(self.config.cadence(), elapsed);
        if pause.is_zero() {
            warn!(
                "cycle took {:.3}s, longer than the {}s cadence",
                elapsed.as_secs_f64(),
                self.config.cadence().as_secs()
            );
        }

        tokio::select! {
            biased;
            _ = shutdown.recv() => None,
            _ = self.clock.sleep(pause) => Some(pause),
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("polling every {}s", self.config.cadence().as_secs());

        while self.tick(&mut shutdown).await.is_some() {}

        info!("scheduler exiting");
        Ok(())
    }

    pub async fn run_once(&self) -> Result<()> {
        self.run_cycle().await;
        Ok(())
    }
}
