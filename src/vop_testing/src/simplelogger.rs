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

use std::sync::{Mutex, Once};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// The process wide capturing logger.
pub static LOGGER: SimpleLogger = SimpleLogger::new();
static INSTALL: Once = Once::new();

/// Only records from the VOP crates are captured.
const TARGET_PREFIX: &str = "vop";

/// One captured record.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub module_path: Option<String>,
}

impl LogCall {
    fn capture(record: &Record) -> Self {
        Self {
            level: record.level(),
            args: record.args().to_string(),
            target: record.target().to_owned(),
            module_path: record.module_path().map(str::to_owned),
        }
    }
}

pub struct SimpleLogger {
    calls: Mutex<Vec<LogCall>>,
}

impl SimpleLogger {
    const fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Install [`LOGGER`] at trace level. Later calls do nothing.
    pub fn initialize_test_logger() {
        INSTALL.call_once(|| {
            log::set_logger(&LOGGER).unwrap();
            log::set_max_level(LevelFilter::Trace);
        });
    }

    pub fn clear_log_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Hand the records captured so far to `f`, then forget them.
    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        let calls = std::mem::take(&mut *self.calls.lock().unwrap());
        f(&calls);
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with(TARGET_PREFIX) && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.calls.lock().unwrap().push(LogCall::capture(record));
        }
    }

    fn flush(&self) {}
}
