//! # sleuth
//!
//! A deterministic, inspectable promise engine with causal-tree timing
//! diagnostics.
//!
//! A [`Promise`] is an asynchronous value that settles exactly once, either
//! resolved or rejected. Continuations are never invoked synchronously:
//! every callback is deferred through the owning [`Engine`]'s scheduler, and
//! [`Engine::run`] drains the queue (and a virtual-time timer wheel) to
//! completion, which makes every test deterministic.
//!
//! Beyond settlement, the engine tracks *why* promises exist: each derived
//! promise records its causal parent, forming a tree that powers timing
//! snapshots ([`Promise::track_as`] + collectors) and reconstructed traces on
//! unhandled rejections.
//!
//! ```
//! use sleuth::{Engine, Resolution, Value};
//!
//! let engine = Engine::new();
//! let greeting = engine
//!     .delay(50, Value::from("hello"))
//!     .then(|v| Resolution::Value(Value::from(format!("{} world", v))));
//! engine.run();
//! assert_eq!(greeting.payload(), Value::from("hello world"));
//! ```

pub mod combinator;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod promise;
pub mod scheduler;
pub mod timing;
pub mod value;

pub use diagnostics::{RejectionEvent, UncaughtRejection};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, Result};
pub use promise::{Deferred, Promise, Resolution, Settlement, State, Thenable};
pub use scheduler::{RunResult, Scheduler, Task, TimerWheel};
pub use timing::{Collector, MemoryCollector, TimingSnapshot};
pub use value::{Fault, Value};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
