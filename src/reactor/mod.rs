//! The reactor core: readiness dispatch, deferred cross-thread execution,
//! and lazy timers.

mod channel;
mod event_loop;
mod loop_pool;
mod poller;
mod timer;

pub use channel::{Channel, EventCallback};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use loop_pool::{LoopThread, LoopThreadPool};
pub use poller::Poller;
pub use timer::{TimerAction, TimerTask, TimerWheel, WHEEL_SIZE};
