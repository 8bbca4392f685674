//! Fatal assertion path for allocator contract violations
//!
//! Double frees, wild frees, out-of-order stack frees, stale handles and
//! overcommitted buffers are programmer errors. They are reported through a
//! replaceable, thread-local handler that never returns. The default handler
//! prints the failing expression with its location and aborts the process.
//!
//! Tests install [`panicking_assert_handler`] so that a violation unwinds and
//! can be observed with `#[should_panic]` or `catch_unwind`.
//!
//! ```
//! use arenakit::assert::{panicking_assert_handler, scoped_assert_handler};
//!
//! let _guard = scoped_assert_handler(panicking_assert_handler);
//! let caught: std::thread::Result<()> = std::panic::catch_unwind(|| arenakit::mem_fatal!("boom"));
//! assert!(caught.is_err());
//! ```

use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;

#[cfg(feature = "logging")]
use tracing::error;

/// Description of a failed allocator assertion
#[derive(Debug)]
pub struct AssertionFailure<'a> {
    /// Source text of the failed condition
    pub expression: &'static str,
    /// Optional formatted context
    pub message: Option<fmt::Arguments<'a>>,
    pub file: &'static str,
    pub line: u32,
}

impl<'a> AssertionFailure<'a> {
    #[doc(hidden)]
    pub const fn new(
        expression: &'static str,
        message: Option<fmt::Arguments<'a>>,
        file: &'static str,
        line: u32,
    ) -> Self {
        Self {
            expression,
            message,
            file,
            line,
        }
    }
}

impl fmt::Display for AssertionFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocator assertion failed: `{}`", self.expression)?;
        if let Some(message) = self.message {
            write!(f, ": {message}")?;
        }
        write!(f, " at {}:{}", self.file, self.line)
    }
}

/// Handler invoked on a contract violation. It must not return.
pub type AssertHandler = fn(&AssertionFailure<'_>) -> !;

thread_local! {
    static HANDLER: Cell<AssertHandler> = const { Cell::new(default_assert_handler) };
}

/// Default handler: report on stderr and abort.
#[cold]
pub fn default_assert_handler(failure: &AssertionFailure<'_>) -> ! {
    #[cfg(feature = "logging")]
    error!(
        expression = failure.expression,
        file = failure.file,
        line = failure.line,
        "{failure}"
    );

    eprintln!("{failure}");
    std::process::abort()
}

/// Handler that turns a violation into a panic carrying the report.
#[cold]
pub fn panicking_assert_handler(failure: &AssertionFailure<'_>) -> ! {
    panic!("{failure}")
}

/// Install `handler` for the current thread, returning the previous one.
pub fn set_assert_handler(handler: AssertHandler) -> AssertHandler {
    HANDLER.with(|cell| cell.replace(handler))
}

/// Restore the aborting default handler for the current thread.
pub fn reset_assert_handler() {
    set_assert_handler(default_assert_handler);
}

/// Handler currently installed on this thread.
pub fn assert_handler() -> AssertHandler {
    HANDLER
        .try_with(Cell::get)
        .unwrap_or(default_assert_handler as AssertHandler)
}

/// Install `handler` until the returned guard is dropped.
pub fn scoped_assert_handler(handler: AssertHandler) -> AssertHandlerGuard {
    AssertHandlerGuard {
        previous: set_assert_handler(handler),
        _not_send: PhantomData,
    }
}

/// Restores the previously installed handler on drop.
///
/// The handler is per thread, so the guard cannot leave it.
#[must_use = "the previous handler is restored when the guard is dropped"]
pub struct AssertHandlerGuard {
    previous: AssertHandler,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for AssertHandlerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssertHandlerGuard").finish_non_exhaustive()
    }
}

impl Drop for AssertHandlerGuard {
    fn drop(&mut self) {
        // Thread-local may already be gone during thread teardown
        let _ = HANDLER.try_with(|cell| cell.set(self.previous));
    }
}

/// Dispatch a failure to the installed handler.
#[cold]
#[inline(never)]
pub fn fail(failure: &AssertionFailure<'_>) -> ! {
    let handler = assert_handler();
    handler(failure)
}

/// Checked in every build. Calls the thread's assert handler on failure.
#[macro_export]
macro_rules! mem_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::assert::fail(&$crate::assert::AssertionFailure::new(
                ::core::stringify!($cond),
                ::core::option::Option::None,
                ::core::file!(),
                ::core::line!(),
            ))
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::assert::fail(&$crate::assert::AssertionFailure::new(
                ::core::stringify!($cond),
                ::core::option::Option::Some(::core::format_args!($($arg)+)),
                ::core::file!(),
                ::core::line!(),
            ))
        }
    };
}

/// Like [`mem_assert!`] but only checked with `debug_assertions`.
#[macro_export]
macro_rules! mem_debug_assert {
    ($($arg:tt)+) => {
        if ::core::cfg!(debug_assertions) {
            $crate::mem_assert!($($arg)+);
        }
    };
}

/// Unconditional contract violation.
#[macro_export]
macro_rules! mem_fatal {
    ($($arg:tt)+) => {
        $crate::assert::fail(&$crate::assert::AssertionFailure::new(
            "fatal",
            ::core::option::Option::Some(::core::format_args!($($arg)+)),
            ::core::file!(),
            ::core::line!(),
        ))
    };
}

#[cfg(test)]
mod tests {
    use std::panic;

    use super::*;

    fn message_of(payload: &(dyn std::any::Any + Send)) -> String {
        payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(ToString::to_string))
            .unwrap_or_default()
    }

    #[test]
    fn test_passing_assert_is_silent() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        mem_assert!(1 + 1 == 2);
        mem_assert!(true, "never formatted {}", 42);
    }

    #[test]
    fn test_failure_reports_expression_and_message() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let value = 7;
        let err = panic::catch_unwind(|| mem_assert!(value < 3, "value was {value}")).unwrap_err();
        let message = message_of(err.as_ref());
        assert!(message.contains("value < 3"), "{message}");
        assert!(message.contains("value was 7"), "{message}");
        assert!(message.contains("assert.rs"), "{message}");
    }

    #[test]
    fn test_guard_restores_previous_handler() {
        let before = assert_handler();
        {
            let _guard = scoped_assert_handler(panicking_assert_handler);
            assert!(core::ptr::fn_addr_eq(
                assert_handler(),
                panicking_assert_handler as AssertHandler
            ));
        }
        assert!(core::ptr::fn_addr_eq(assert_handler(), before));
    }

    #[test]
    fn test_handler_is_per_thread() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        std::thread::spawn(|| {
            assert!(core::ptr::fn_addr_eq(
                assert_handler(),
                default_assert_handler as AssertHandler
            ));
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_fatal_always_fires() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        mem_fatal!("double free of {:#x}", 0x1000);
    }
}
