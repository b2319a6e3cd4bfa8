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

/// Crate-internal trait implemented by every metric enum.
pub(crate) trait NamedMetric {
    /// The name of the metric.
    fn name(&self) -> &'static str;
    /// The description of the metric.
    fn description(&self) -> &'static str;
    /// The unit of the metric.
    fn unit(&self) -> metrics::Unit;
    /// The single label of the metric as `(key, value)`.
    fn label(&self) -> (&'static str, &'static str);
    /// Run `describe` the first time this variant is emitted.
    fn describe_once(&self, describe: fn(&'static str, metrics::Unit, &'static str));
}

/// Defines metric enums whose variants carry one `&'static str` label and an
/// optional value field.
///
/// ```ignore
/// define_metrics! {
///     CounterMetric {
///         Drops { reason } => { name: "drops_total", description: "...", unit: metrics::Unit::Count },
///     }
/// }
/// ```
macro_rules! define_metrics {
    (
        $(
            $metric_type:ident {
                $(
                    $variant:ident { $label:ident $(, $value:ident : $value_ty:ty)? } => {
                        name: $name:expr,
                        description: $description:expr,
                        unit: $unit:expr $(,)?
                    }
                ),* $(,)?
            }
        )*
    ) => {
        $(
            #[derive(Debug, Clone)]
            pub(crate) enum $metric_type {
                $(
                    $variant { $label: &'static str $(, $value: $value_ty)? }
                ),*
            }

            impl $crate::metrics::metrics_macro::NamedMetric for $metric_type {
                fn name(&self) -> &'static str {
                    match self {
                        $( Self::$variant { .. } => $name, )*
                    }
                }

                fn description(&self) -> &'static str {
                    match self {
                        $( Self::$variant { .. } => $description, )*
                    }
                }

                fn unit(&self) -> metrics::Unit {
                    match self {
                        $( Self::$variant { .. } => $unit, )*
                    }
                }

                fn label(&self) -> (&'static str, &'static str) {
                    match self {
                        $( Self::$variant { $label, .. } => (stringify!($label), *$label), )*
                    }
                }

                fn describe_once(&self, describe: fn(&'static str, metrics::Unit, &'static str)) {
                    match self {
                        $(
                            Self::$variant { .. } => {
                                static DESCRIBE: std::sync::Once = std::sync::Once::new();
                                DESCRIBE.call_once(|| describe(self.name(), self.unit(), self.description()));
                            }
                        )*
                    }
                }
            }
        )*
    };
}

pub(crate) use define_metrics;
