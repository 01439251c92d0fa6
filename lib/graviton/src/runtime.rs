//! The explicit runtime context every instance is built from: the shared
//! completion core, the root logger, the error sink and instance-id
//! allocation.

use crate::iocore::IoCore;
use crate::support::{Error, NetResult};
use crate::sync::Event;
use lumen::InstanceId;
use slog::{o, Discard, Logger};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Action taken when an error escapes a public API boundary. Modes are
/// bits; any combination can be enabled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorMode {
    /// Emit a structured error-level log record.
    Display = 1,
    /// Store the error in the single-slot last-error store.
    Record = 2,
    /// Return the error to the caller.
    Throw = 4,
}

/// Routes errors that cross the public boundary. Internal code always
/// propagates `NetResult`; only instance entry points consult the sink, in
/// the order Display, Record, Throw.
pub struct ErrorSink {
    mode: AtomicU8,
    last: Mutex<Option<Error>>,
    loaded: Event,
    log: Logger,
}

impl ErrorSink {
    fn new(log: Logger) -> ErrorSink {
        ErrorSink {
            mode: AtomicU8::new(ErrorMode::Display as u8),
            last: Mutex::new(None),
            loaded: Event::manual(false),
            log,
        }
    }

    pub fn set_mode(&self, mode: ErrorMode, enabled: bool) {
        if enabled {
            self.mode.fetch_or(mode as u8, Ordering::AcqRel);
        } else {
            self.mode.fetch_and(!(mode as u8), Ordering::AcqRel);
        }
    }

    pub fn is_mode_enabled(&self, mode: ErrorMode) -> bool {
        self.mode.load(Ordering::Acquire) & (mode as u8) != 0
    }

    /// Applies the enabled modes to a failed result. With Throw disabled
    /// the error is swallowed and `fallback` returned.
    pub fn report<T>(&self, result: NetResult<T>, fallback: T) -> NetResult<T> {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if self.is_mode_enabled(ErrorMode::Display) {
            slog::error!(self.log, "operation failed";
                         "operation" => error.operation(),
                         "kind" => ?error.kind());
        }
        if self.is_mode_enabled(ErrorMode::Record) {
            *self.last.lock().unwrap() = Some(error.clone());
            self.loaded.set();
        }
        if self.is_mode_enabled(ErrorMode::Throw) {
            return Err(error);
        }
        Ok(fallback)
    }

    /// True when a recorded error is waiting to be collected.
    pub fn is_error_saved(&self) -> bool {
        self.loaded.is_set()
    }

    /// Takes the recorded error, clearing the slot.
    pub fn take_error(&self) -> Option<Error> {
        let error = self.last.lock().unwrap().take();
        self.loaded.reset();
        error
    }

    /// Waits until an error is recorded.
    pub fn wait_error(&self, timeout: Option<Duration>) -> bool {
        self.loaded.wait(timeout)
    }
}

/// Shared context for all instances in a process: completion core, logger,
/// error sink. Dropped last, after every instance, so in-flight completion
/// callbacks can still find their sockets during instance teardown.
pub struct Runtime {
    iocore: Arc<IoCore>,
    log: Logger,
    sink: ErrorSink,
    next_instance: AtomicUsize,
}

impl Runtime {
    /// Starts the completion core with `workers` threads.
    pub fn start<L: Into<Option<Logger>>>(workers: usize, log: L) -> NetResult<Arc<Runtime>> {
        let log = match log.into() {
            Some(log) => log,
            None => Logger::root(Discard, o!()),
        };

        let iocore = IoCore::start(workers, Some(&log))?;

        Ok(Arc::new(Runtime {
            iocore,
            sink: ErrorSink::new(log.new(o!("subsystem" => "errors"))),
            log,
            next_instance: AtomicUsize::new(1),
        }))
    }

    #[inline]
    pub(crate) fn iocore(&self) -> &Arc<IoCore> {
        &self.iocore
    }

    #[inline]
    pub fn logger(&self) -> &Logger {
        &self.log
    }

    #[inline]
    pub fn errors(&self) -> &ErrorSink {
        &self.sink
    }

    pub(crate) fn next_instance_id(&self) -> InstanceId {
        self.next_instance.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::{raise, ErrorKind};

    #[test]
    fn test_default_mode_is_display_only() {
        let runtime = Runtime::start(1, None).unwrap();
        let sink = runtime.errors();

        assert!(sink.is_mode_enabled(ErrorMode::Display));
        assert!(!sink.is_mode_enabled(ErrorMode::Record));
        assert!(!sink.is_mode_enabled(ErrorMode::Throw));
    }

    #[test]
    fn test_throw_mode_propagates() {
        let runtime = Runtime::start(1, None).unwrap();
        let sink = runtime.errors();
        sink.set_mode(ErrorMode::Throw, true);

        let result: NetResult<u32> =
            sink.report(raise(ErrorKind::Timeout, "testing the sink"), 7);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_swallowed_error_returns_fallback() {
        let runtime = Runtime::start(1, None).unwrap();
        let sink = runtime.errors();

        let result: NetResult<u32> =
            sink.report(raise(ErrorKind::Timeout, "testing the sink"), 7);
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_record_mode_saves_last_error() {
        let runtime = Runtime::start(1, None).unwrap();
        let sink = runtime.errors();
        sink.set_mode(ErrorMode::Record, true);

        assert!(!sink.is_error_saved());
        let _: NetResult<()> =
            sink.report(raise(ErrorKind::EndOfPacket, "testing the sink"), ());

        assert!(sink.is_error_saved());
        let error = sink.take_error().unwrap();
        assert_eq!(error.kind(), ErrorKind::EndOfPacket);
        assert!(!sink.is_error_saved());
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let runtime = Runtime::start(1, None).unwrap();
        let a = runtime.next_instance_id();
        let b = runtime.next_instance_id();
        assert_ne!(a, b);
    }
}
