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

use std::sync::Mutex;

use crate::hal::{LineId, SignalCallback, SignalKind};
use crate::{Result, new_error};

struct Line {
    kind: SignalKind,
    callback: Option<SignalCallback>,
    armed: bool,
    pending: bool,
}

/// Signal lines owned by one endpoint.
///
/// A line fires its callback once, then stays disarmed until acknowledged.
/// Raises while disarmed are coalesced into a single delivery on acknowledge.
#[derive(Default)]
pub(crate) struct SignalRegistry {
    lines: Mutex<Vec<Option<Line>>>,
}

impl SignalRegistry {
    pub(crate) fn allocate(&self, kind: SignalKind) -> Result<LineId> {
        let mut lines = self.lines.lock()?;
        let line = Line {
            kind,
            callback: None,
            armed: true,
            pending: false,
        };
        let idx = match lines.iter().position(Option::is_none) {
            Some(idx) => {
                lines[idx] = Some(line);
                idx
            }
            None => {
                lines.push(Some(line));
                lines.len() - 1
            }
        };
        Ok(LineId(idx as u32))
    }

    pub(crate) fn register(&self, id: LineId, callback: SignalCallback) -> Result<()> {
        let mut lines = self.lines.lock()?;
        match lines.get_mut(id.0 as usize) {
            Some(Some(line)) => {
                line.callback = Some(callback);
                Ok(())
            }
            _ => Err(new_error!("signal line {} is not allocated", id.0)),
        }
    }

    pub(crate) fn free(&self, id: LineId) {
        if let Ok(mut lines) = self.lines.lock()
            && let Some(slot) = lines.get_mut(id.0 as usize)
        {
            *slot = None;
        }
    }

    /// Deliver a signal of `kind` to every registered line of that kind.
    pub(crate) fn raise(&self, kind: SignalKind) {
        let callbacks: Vec<SignalCallback> = match self.lines.lock() {
            Ok(mut lines) => lines
                .iter_mut()
                .flatten()
                .filter(|l| l.kind == kind && l.callback.is_some())
                .filter_map(|l| {
                    if l.armed {
                        l.armed = false;
                        l.callback.clone()
                    } else {
                        l.pending = true;
                        None
                    }
                })
                .collect(),
            Err(_) => return,
        };
        // callbacks may acknowledge, so the lock is not held here
        callbacks.iter().for_each(|cb| cb());
    }

    pub(crate) fn acknowledge(&self, id: LineId) {
        let callback = match self.lines.lock() {
            Ok(mut lines) => match lines.get_mut(id.0 as usize) {
                Some(Some(line)) if line.pending => {
                    line.pending = false;
                    line.callback.clone()
                }
                Some(Some(line)) => {
                    line.armed = true;
                    None
                }
                _ => None,
            },
            Err(_) => None,
        };
        if let Some(cb) = callback {
            cb();
        }
    }

    pub(crate) fn allocated(&self) -> usize {
        match self.lines.lock() {
            Ok(lines) => lines.iter().flatten().count(),
            Err(_) => 0,
        }
    }
}
