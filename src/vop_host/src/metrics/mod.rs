/*
Copyright 2026  The VOP Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::time::Duration;

use metrics_macro::{NamedMetric, define_metrics};

mod metrics_macro;

define_metrics! {
    CounterMetric {
        CopyFallback { reason } => {
            name: "vop_copy_fallbacks_total",
            description: "Number of asynchronous copies redone on the synchronous path",
            unit: metrics::Unit::Count,
        },
        MissedHeadsUp { line } => {
            name: "vop_missed_heads_up_total",
            description: "Number of waits that timed out although their condition held",
            unit: metrics::Unit::Count,
        },
        Cancellation { status } => {
            name: "vop_cancellations_total",
            description: "Number of answered kvec cancellation requests",
            unit: metrics::Unit::Count,
        },
        TransferError { kind } => {
            name: "vop_transfer_errors_total",
            description: "Number of transfers finished with an error",
            unit: metrics::Unit::Count,
        },
    }
    HistogramMetric {
        TransferDuration { mode, duration: Duration } => {
            name: "vop_transfer_duration_seconds",
            description: "Time from fetching a descriptor to writing its used record",
            unit: metrics::Unit::Seconds,
        },
    }
}

impl CounterMetric {
    #[must_use]
    pub(crate) fn copy_fallback(reason: &'static str) -> Self {
        CounterMetric::CopyFallback { reason }
    }

    #[must_use]
    pub(crate) fn missed_heads_up(line: &'static str) -> Self {
        CounterMetric::MissedHeadsUp { line }
    }

    #[must_use]
    pub(crate) fn cancellation(status: &'static str) -> Self {
        CounterMetric::Cancellation { status }
    }

    #[must_use]
    pub(crate) fn transfer_error(kind: &'static str) -> Self {
        CounterMetric::TransferError { kind }
    }
}

impl HistogramMetric {
    /// Record the duration of one transfer.
    ///
    /// Does nothing unless the `transfer_metrics` feature is enabled.
    pub(crate) fn transfer_finished(
        #[allow(unused_variables)] mode: &'static str,
        #[allow(unused_variables)] started: std::time::Instant,
    ) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "transfer_metrics")] {
                HistogramMetric::TransferDuration { mode, duration: started.elapsed() }.emit();
            }
        }
    }
}

/// A metric which can be emitted to the underlying metrics system
pub(crate) trait EmittableMetric {
    /// Emits the metric. The first emit of a variant also describes it.
    fn emit(self);
}

impl EmittableMetric for CounterMetric {
    /// Increases the counter represented by `self` by 1
    fn emit(self) {
        self.describe_once(|name, unit, description| {
            metrics::describe_counter!(name, unit, description);
        });
        let (key, value) = self.label();
        metrics::counter!(self.name(), key => value).increment(1);
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        self.describe_once(|name, unit, description| {
            metrics::describe_histogram!(name, unit, description);
        });
        let (key, value) = self.label();
        match self {
            HistogramMetric::TransferDuration { duration, .. } => {
                metrics::histogram!(self.name(), key => value).record(duration);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Label};
    use metrics_util::CompositeKey;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;

    #[test]
    fn test_counter_and_histogram_metrics() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let fallback = CounterMetric::copy_fallback("submit");
        let missed = CounterMetric::missed_heads_up("used");
        let duration = HistogramMetric::TransferDuration {
            mode: "sync",
            duration: Duration::from_secs(2),
        };

        let snapshot = metrics::with_local_recorder(&recorder, || {
            fallback.clone().emit();
            fallback.clone().emit();
            missed.clone().emit();
            duration.clone().emit();
            snapshotter.snapshot()
        });

        #[expect(clippy::mutable_key_type)]
        let snapshot = snapshot.into_hashmap();
        assert_eq!(snapshot.len(), 3, "Expected three metrics in the snapshot");

        let key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(fallback.name(), vec![Label::new("reason", "submit")]),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(2));

        let key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(missed.name(), vec![Label::new("line", "used")]),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(1));

        let key = CompositeKey::new(
            metrics_util::MetricKind::Histogram,
            Key::from_parts(duration.name(), vec![Label::new("mode", "sync")]),
        );
        let value = &snapshot.get(&key).unwrap().2;
        assert!(
            matches!(value, DebugValue::Histogram(h) if h.len() == 1 && h[0].0 == 2.0),
            "Histogram metric does not match expected value"
        );
    }

    #[test]
    fn labels_come_from_the_variant_field() {
        assert_eq!(CounterMetric::cancellation("ok").label(), ("status", "ok"));
        assert_eq!(CounterMetric::transfer_error("no_space").label(), ("kind", "no_space"));
        assert_eq!(
            CounterMetric::transfer_error("x").name(),
            "vop_transfer_errors_total"
        );
    }
}
