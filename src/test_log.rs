//! The logger installed by unit tests.
//!
//! Everything is forwarded to `env_logger` as usual. On top of that, a test can
//! record the messages logged on its own thread with [`capture`].

use log::Log;
use std::{
    boxed::Box,
    cell::RefCell,
    string::{String, ToString},
    sync::Once,
    vec::Vec,
};

std::thread_local! {
    static CAPTURED: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

struct TestLogger {
    inner: env_logger::Logger,
}

impl Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        CAPTURED.with(|captured| {
            if let Some(lines) = captured.borrow_mut().as_mut() {
                lines.push(record.args().to_string());
            }
        });
        if self.inner.matches(record) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the test logger. Idempotent.
pub(crate) fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let inner = env_logger::Builder::from_default_env().is_test(true).build();
        let logger: &'static TestLogger = Box::leak(Box::new(TestLogger { inner }));
        if log::set_logger(logger).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
    });
}

/// Run `f` and return every message it logged on this thread, in order.
pub(crate) fn capture(f: impl FnOnce()) -> Vec<String> {
    init();
    CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
    f();
    CAPTURED
        .with(|captured| captured.borrow_mut().take())
        .unwrap_or_default()
}
