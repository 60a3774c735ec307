//! Counters for every condition the loop drops or ignores instead of failing.
//!
//! Producers on the network path and the tick path bump these without
//! locking: plain `AtomicU64` for global counters and a `DashMap` of atomics
//! for the per-property ones.

use std::{
    fs::File,
    io::BufWriter,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use csv::Writer;
use dashmap::DashMap;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// Datagram that did not decode.
    Malformed,
    /// Reply whose sequence number was not awaiting one.
    UnpromptedReply,
    /// Message of a kind this endpoint does not handle.
    IgnoredKind,
    /// Actuation for a property with no registered actuator.
    UnregisteredCommand,
    /// Datagram the socket refused to take.
    DroppedSend,
    /// Sample replaced in the work slot before the worker took it.
    OverwrittenSample,
    ControllerFailure,
    TickOverrun,
    /// Tick whose samples were withheld because a sensed property had no value.
    MissingProperty,
    /// Sample still unanswered at shutdown.
    Unanswered,
}

#[derive(Debug, Default)]
struct Counters {
    malformed: AtomicU64,
    unprompted: AtomicU64,
    ignored_kind: AtomicU64,
    unregistered: AtomicU64,
    dropped_send: AtomicU64,
    overwritten: AtomicU64,
    controller_failure: AtomicU64,
    tick_overrun: AtomicU64,
    missing_property: AtomicU64,
    unanswered: AtomicU64,
}

/// Shared counter set. Cloning shares the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    counters: Arc<Counters>,
    unregistered_by_prop: Arc<DashMap<String, AtomicU64>>,
}

/// Point-in-time copy of all global counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub malformed: u64,
    pub unprompted_replies: u64,
    pub ignored_kinds: u64,
    pub unregistered_commands: u64,
    pub dropped_sends: u64,
    pub overwritten_samples: u64,
    pub controller_failures: u64,
    pub tick_overruns: u64,
    pub missing_properties: u64,
    pub unanswered: u64,
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    metric: &'a str,
    value: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: DiagnosticEvent) {
        self.add(event, 1);
    }

    pub fn add(&self, event: DiagnosticEvent, n: u64) {
        let c = &self.counters;
        let counter = match event {
            DiagnosticEvent::Malformed => &c.malformed,
            DiagnosticEvent::UnpromptedReply => &c.unprompted,
            DiagnosticEvent::IgnoredKind => &c.ignored_kind,
            DiagnosticEvent::UnregisteredCommand => &c.unregistered,
            DiagnosticEvent::DroppedSend => &c.dropped_send,
            DiagnosticEvent::OverwrittenSample => &c.overwritten,
            DiagnosticEvent::ControllerFailure => &c.controller_failure,
            DiagnosticEvent::TickOverrun => &c.tick_overrun,
            DiagnosticEvent::MissingProperty => &c.missing_property,
            DiagnosticEvent::Unanswered => &c.unanswered,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts a command for `prop`, which has no actuator.
    pub fn record_unregistered(&self, prop: &str) {
        self.record(DiagnosticEvent::UnregisteredCommand);
        if let Some(c) = self.unregistered_by_prop.get(prop) {
            c.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.unregistered_by_prop
            .entry(prop.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn unregistered_for(&self, prop: &str) -> u64 {
        self.unregistered_by_prop
            .get(prop)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let c = &self.counters;
        DiagnosticsSnapshot {
            malformed: c.malformed.load(Ordering::Relaxed),
            unprompted_replies: c.unprompted.load(Ordering::Relaxed),
            ignored_kinds: c.ignored_kind.load(Ordering::Relaxed),
            unregistered_commands: c.unregistered.load(Ordering::Relaxed),
            dropped_sends: c.dropped_send.load(Ordering::Relaxed),
            overwritten_samples: c.overwritten.load(Ordering::Relaxed),
            controller_failures: c.controller_failure.load(Ordering::Relaxed),
            tick_overruns: c.tick_overrun.load(Ordering::Relaxed),
            missing_properties: c.missing_property.load(Ordering::Relaxed),
            unanswered: c.unanswered.load(Ordering::Relaxed),
        }
    }

    /// Writes `metric,value` rows: global counters first, then one
    /// `unregistered:<prop>` row per property.
    pub fn export_summary(&self, path: impl AsRef<Path>) -> Result<()> {
        let s = self.snapshot();
        let mut wtr = Writer::from_writer(BufWriter::new(File::create(path)?));
        let rows = [
            ("malformed", s.malformed),
            ("unprompted_replies", s.unprompted_replies),
            ("ignored_kinds", s.ignored_kinds),
            ("unregistered_commands", s.unregistered_commands),
            ("dropped_sends", s.dropped_sends),
            ("overwritten_samples", s.overwritten_samples),
            ("controller_failures", s.controller_failures),
            ("tick_overruns", s.tick_overruns),
            ("missing_properties", s.missing_properties),
            ("unanswered", s.unanswered),
        ];
        for (metric, value) in rows {
            wtr.serialize(SummaryRow { metric, value })?;
        }

        let mut per_prop: Vec<(String, u64)> = self
            .unregistered_by_prop
            .iter()
            .map(|r| (r.key().clone(), r.value().load(Ordering::Relaxed)))
            .collect();
        per_prop.sort();
        for (prop, value) in per_prop {
            let metric = format!("unregistered:{prop}");
            wtr.serialize(SummaryRow {
                metric: &metric,
                value,
            })?;
        }
        wtr.flush()?;
        Ok(())
    }
}
