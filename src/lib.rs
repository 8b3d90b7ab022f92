//! Multi-threaded reactor-pattern TCP server framework built on epoll,
//! designed for learning purposes.
//!
//! One event loop runs per thread: a base loop accepts connections and a
//! small pool of worker loops carries their I/O. All state owned by a loop is
//! mutated only on that loop's thread; other threads hand work over through a
//! mutex-guarded pending-task queue paired with an `eventfd` wake-up.
//!
//! Not suitable for production use.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!(
    "This crate is only compatible with Linux systems that support epoll, eventfd, and timerfd."
);

pub mod error;
pub mod log;

pub mod buffer;
pub mod net;
pub mod pool;
pub mod reactor;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use net::{Connection, ConnectionState, TcpServer};

/// Creates an [Error::Io] with a message prefixed to the `errno` value.
#[macro_export]
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);

        let msg = format!("{prefix}: {errno}");

        $crate::Error::Io(::std::io::Error::new(errno.kind(), msg))
    }};
}
