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

use std::sync::atomic::{AtomicBool, Ordering};

/// Latch for diagnostics that are loud the first time and quiet afterwards.
#[derive(Debug, Default)]
pub(crate) struct LogOnce {
    fired: AtomicBool,
}

impl LogOnce {
    pub(crate) const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// True for the first caller only.
    pub(crate) fn first(&self) -> bool {
        !self.fired.swap(true, Ordering::Relaxed)
    }
}

/// `warn!` the first time `$once` fires, `debug!` after that.
macro_rules! warn_once {
    ($once:expr, $($arg:tt)+) => {
        if $once.first() {
            tracing::warn!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

/// `error!` the first time `$once` fires, `debug!` after that.
macro_rules! error_once {
    ($once:expr, $($arg:tt)+) => {
        if $once.first() {
            tracing::error!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

pub(crate) use {error_once, warn_once};

#[cfg(test)]
mod tests {
    use super::LogOnce;

    #[test]
    fn fires_once() {
        let once = LogOnce::default();
        assert!(once.first());
        assert!(!once.first());
        assert!(!once.first());
    }
}
