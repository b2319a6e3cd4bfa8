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

use log::Level;
use vop_host::hal::sim::SimLinkConfig;
use vop_testing::simplelogger::{LOGGER, SimpleLogger};

pub mod common;
use common::{pattern, started};

// Own test binary: the logger is process wide.
#[test]
fn copy_fallback_is_reported_once() {
    SimpleLogger::initialize_test_logger();
    let link = started(SimLinkConfig::default());
    LOGGER.clear_log_calls();

    link.a.hw.fail_next_submits(3);
    for i in 0..3 {
        link.b.post_receive();
        link.a.send(&pattern(400, i));
    }
    for i in 0..3 {
        link.a.wait_sent();
        let used = link.b.wait_received();
        assert_eq!(link.b.payload(used), pattern(400, i));
    }

    LOGGER.test_log_records(|calls| {
        let fallbacks = calls
            .iter()
            .filter(|c| c.level == Level::Error && c.args.contains("async copy submit failed"))
            .count();
        assert_eq!(fallbacks, 1, "{calls:#?}");
        assert!(calls.iter().all(|c| c.target.starts_with("vop")));
    });
}
