//! Debug event notification.
//!
//! Every observable debugger action produces a [`DebugEvent`]. Events always
//! get a `tracing` line; when a channel sender is installed they are also
//! delivered there, otherwise they accumulate in a drainable buffer.

use std::path::PathBuf;
use std::sync::mpsc::Sender;

use mantis_runtime::value::Value;
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::breakpoint::model::Breakpoint;

/// Structured debugger notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    /// A breakpoint was requested.
    Requested(Breakpoint),
    /// Installation is deferred until the target module loads.
    PendingInstall(Breakpoint),
    /// The breakpoint is installed.
    Set(Breakpoint),
    /// A breakpoint interrupted a thread.
    Hit {
        /// The interrupting breakpoint.
        breakpoint: Breakpoint,
        /// Name of the interrupted thread.
        thread: String,
    },
    /// The breakpoint was cleared.
    Cleared(Breakpoint),
    /// An existing breakpoint's condition was replaced.
    ConditionUpdated(Breakpoint),
    /// An existing breakpoint's condition was removed.
    ConditionRemoved(Breakpoint),
    /// A breakpoint operation failed.
    BreakpointError {
        /// The breakpoint the failure belongs to.
        breakpoint: Breakpoint,
        /// Human-readable reason.
        reason: String,
    },
    /// Where an interrupted or stepped frame stands.
    FrameLocation {
        /// Source file of the executing unit.
        source: PathBuf,
        /// Current line.
        line: u32,
        /// Executing unit name.
        unit: SmolStr,
    },
    /// A traced frame returned.
    ReturnValue {
        /// Unit that returned.
        unit: SmolStr,
        /// The returned value.
        value: Value,
    },
    /// A condition expression was evaluated at the prompt.
    Evaluated {
        /// Expression text.
        expr: String,
        /// Resulting value.
        value: Value,
    },
    /// Snapshot of a frame's value stack.
    ValueStack {
        /// Stack contents, bottom first.
        values: Vec<Value>,
        /// Stack depth; negative signals an internal inconsistency.
        depth: i64,
    },
}

/// Event fan-out: `tracing` always, a channel when installed, a buffer
/// otherwise.
#[derive(Debug, Default)]
pub struct EventSink {
    sender: Mutex<Option<Sender<DebugEvent>>>,
    buffer: Mutex<Vec<DebugEvent>>,
}

impl EventSink {
    /// Route future events into `sender` instead of the buffer.
    pub fn install_sender(&self, sender: Sender<DebugEvent>) {
        *self.sender.lock() = Some(sender);
    }

    /// Emit one event.
    pub fn emit(&self, event: DebugEvent) {
        tracing::info!(?event, "debug event");
        let mut sender = self.sender.lock();
        if let Some(tx) = sender.as_ref() {
            if tx.send(event.clone()).is_ok() {
                return;
            }
            // Receiver gone; fall back to buffering.
            *sender = None;
        }
        drop(sender);
        self.buffer.lock().push(event);
    }

    /// Take every buffered event.
    #[must_use]
    pub fn drain(&self) -> Vec<DebugEvent> {
        std::mem::take(&mut *self.buffer.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::model::LineBreakpoint;

    #[test]
    fn buffered_until_a_sender_is_installed() {
        let sink = EventSink::default();
        let bp = Breakpoint::Line(LineBreakpoint::new("/p/mod.mt", 3));
        sink.emit(DebugEvent::Requested(bp.clone()));
        assert_eq!(sink.drain(), vec![DebugEvent::Requested(bp.clone())]);
        assert!(sink.drain().is_empty());

        let (tx, rx) = std::sync::mpsc::channel();
        sink.install_sender(tx);
        sink.emit(DebugEvent::Set(bp.clone()));
        assert_eq!(rx.try_recv().unwrap(), DebugEvent::Set(bp));
        assert!(sink.drain().is_empty());
    }
}
