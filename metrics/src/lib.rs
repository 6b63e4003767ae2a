pub mod server;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<Metrics>;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    candidate_peers: IntGauge,
    sync_phase: IntGauge,
    state_transitions: IntCounterVec,
    peer_reports: IntCounterVec,
    blocks_saved: IntCounterVec,
    request_timeouts: IntCounterVec,
    sync_attempt_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new(
            "sync_peers_known",
            "Number of peers with a reported chain status",
        ))?;
        registry.register(Box::new(peers.clone()))?;

        let candidate_peers = IntGauge::with_opts(Opts::new(
            "sync_peers_candidate",
            "Number of peers ahead of the local chain",
        ))?;
        registry.register(Box::new(candidate_peers.clone()))?;

        let sync_phase = IntGauge::with_opts(Opts::new(
            "sync_phase",
            "Numeric id of the active sync phase",
        ))?;
        registry.register(Box::new(sync_phase.clone()))?;

        let state_transitions = IntCounterVec::new(
            Opts::new("sync_state_transitions_total", "Total number of sync state transitions"),
            &["to"],
        )?;
        registry.register(Box::new(state_transitions.clone()))?;

        let peer_reports = IntCounterVec::new(
            Opts::new("sync_peer_reports_total", "Total number of peer misbehaviour reports"),
            &["event"],
        )?;
        registry.register(Box::new(peer_reports.clone()))?;

        let blocks_saved = IntCounterVec::new(
            Opts::new("sync_blocks_saved_total", "Total number of blocks saved by sync"),
            &["direction"],
        )?;
        registry.register(Box::new(blocks_saved.clone()))?;

        let request_timeouts = IntCounterVec::new(
            Opts::new("sync_request_timeouts_total", "Total number of timed out sync requests"),
            &["phase"],
        )?;
        registry.register(Box::new(request_timeouts.clone()))?;

        let sync_attempt_duration = HistogramVec::new(
            HistogramOpts::new(
                "sync_attempt_duration_seconds",
                "Time from leaving peer wait to the end of a sync attempt",
            )
            .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(sync_attempt_duration.clone()))?;

        Ok(Self {
            registry,
            peers,
            candidate_peers,
            sync_phase,
            state_transitions,
            peer_reports,
            blocks_saved,
            request_timeouts,
            sync_attempt_duration,
        })
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn set_peers(&self, known: i64, candidates: i64) {
        self.peers.set(known);
        self.candidate_peers.set(candidates);
    }

    pub fn set_sync_phase(&self, phase: i64) {
        self.sync_phase.set(phase);
    }

    pub fn inc_state_transition(&self, to: &str) {
        self.state_transitions.with_label_values(&[to]).inc();
    }

    pub fn inc_peer_report(&self, event: &str) {
        self.peer_reports.with_label_values(&[event]).inc();
    }

    pub fn inc_blocks_saved(&self, direction: &str, count: u64) {
        self.blocks_saved.with_label_values(&[direction]).inc_by(count);
    }

    pub fn inc_request_timeout(&self, phase: &str) {
        self.request_timeouts.with_label_values(&[phase]).inc();
    }

    pub fn observe_sync_attempt(&self, outcome: &str, seconds: f64) {
        self.sync_attempt_duration
            .with_label_values(&[outcome])
            .observe(seconds);
    }

    pub fn state_transitions(&self, to: &str) -> u64 {
        self.state_transitions.with_label_values(&[to]).get()
    }

    pub fn peer_reports(&self, event: &str) -> u64 {
        self.peer_reports.with_label_values(&[event]).get()
    }

    pub fn blocks_saved(&self, direction: &str) -> u64 {
        self.blocks_saved.with_label_values(&[direction]).get()
    }

    /// Number of finished sync attempts with the given outcome.
    pub fn sync_attempts(&self, outcome: &str) -> u64 {
        self.sync_attempt_duration
            .with_label_values(&[outcome])
            .get_sample_count()
    }
}
