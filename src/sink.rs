/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Pluggable error and monitoring sinks (§6).
//!
//! The core spec treats error reporting and metrics as abstract
//! collaborators. The default implementations here route both through
//! `tracing`, which is how the teacher surfaces structured diagnostics
//! without committing callers to a specific metrics backend.

use std::collections::HashMap;

/// Severity of an event reported to an [`ErrorSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Error,
    Fatal,
}

/// Structured key/value context attached to a sink event.
pub type Extra = HashMap<String, String>;

/// Receives leveled diagnostic events from every layer of the engine.
///
/// `TaskManager` calls this once per `RepoError::Deadlock` retry and once
/// more when a retry budget is exhausted (§4.2); `Sender` calls it when a
/// `confirm_execution` batch fails after retries (§4.5).
pub trait ErrorSink: Send + Sync {
    fn record(&self, level: Level, message: &str, extra: Extra);
}

/// Named counters and gauges (§6): `tasks_created`, `tasks_fired`,
/// `tasks_deleted`, `preload_lag_seconds`, `heap_size`.
pub trait MonitoringSink: Send + Sync {
    fn counter(&self, name: &'static str, value: u64);
    fn gauge(&self, name: &'static str, value: f64);
}

/// Default [`ErrorSink`] that emits structured `tracing` events on the
/// `trigger_engine::sink` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn record(&self, level: Level, message: &str, extra: Extra) {
        match level {
            Level::Debug => tracing::debug!(target: "trigger_engine::sink", ?extra, "{message}"),
            Level::Info => tracing::info!(target: "trigger_engine::sink", ?extra, "{message}"),
            Level::Error => tracing::error!(target: "trigger_engine::sink", ?extra, "{message}"),
            Level::Fatal => {
                tracing::error!(target: "trigger_engine::sink", fatal = true, ?extra, "{message}")
            }
        }
    }
}

/// Default [`MonitoringSink`] that surfaces counters/gauges as `tracing`
/// fields on the `trigger_engine::metrics` target, and mirrors them into
/// the process-wide `metrics` recorder when one is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitoringSink;

impl MonitoringSink for TracingMonitoringSink {
    fn counter(&self, name: &'static str, value: u64) {
        tracing::debug!(target: "trigger_engine::metrics", counter = name, value, "metric");
        metrics::counter!(name).increment(value);
    }

    fn gauge(&self, name: &'static str, value: f64) {
        tracing::debug!(target: "trigger_engine::metrics", gauge = name, value, "metric");
        metrics::gauge!(name).set(value);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingErrorSink {
        pub events: Mutex<Vec<(Level, String)>>,
    }

    impl ErrorSink for RecordingErrorSink {
        fn record(&self, level: Level, message: &str, _extra: Extra) {
            self.events.lock().unwrap().push((level, message.to_string()));
        }
    }

    impl RecordingErrorSink {
        pub fn error_count(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(level, _)| *level == Level::Error)
                .count()
        }
    }

    #[derive(Default)]
    pub struct RecordingMonitoringSink {
        pub counters: Mutex<HashMap<&'static str, u64>>,
        pub gauges: Mutex<HashMap<&'static str, f64>>,
    }

    impl MonitoringSink for RecordingMonitoringSink {
        fn counter(&self, name: &'static str, value: u64) {
            *self.counters.lock().unwrap().entry(name).or_insert(0) += value;
        }

        fn gauge(&self, name: &'static str, value: f64) {
            self.gauges.lock().unwrap().insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingErrorSink;
    use super::*;

    #[test]
    fn recording_sink_counts_only_error_level() {
        let sink = RecordingErrorSink::default();
        sink.record(Level::Debug, "debug event", Extra::new());
        sink.record(Level::Error, "error event", Extra::new());
        sink.record(Level::Error, "another error", Extra::new());
        assert_eq!(sink.error_count(), 2);
    }
}
