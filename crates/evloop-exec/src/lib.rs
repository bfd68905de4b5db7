//! Event loop implementations behind the `evloop-core` timer facade.
//!
//! - [`EmbeddedEventLoop`]: virtual time, advanced synchronously by the caller.
//! - [`AsyncTestingEventLoop`]: virtual time on its own thread, advanced with `async` calls.
//! - [`ThreadedEventLoop`] / [`MultiThreadedEventLoopGroup`]: real OS threads and the real clock.

mod config;
pub use config::LoopGroupConfig;

mod queue;

pub mod embedded;
pub use embedded::EmbeddedEventLoop;

pub mod async_testing;
pub use async_testing::AsyncTestingEventLoop;

pub mod threaded;
pub use threaded::{MultiThreadedEventLoopGroup, ThreadedEventLoop};

pub mod prelude {
    pub use crate::{
        AsyncTestingEventLoop, EmbeddedEventLoop, LoopGroupConfig, MultiThreadedEventLoopGroup,
        ThreadedEventLoop,
    };
    pub use evloop_core::prelude::*;
}
