//! # Encore - Durable Execution for Async Rust
//!
//! Encore runs long-lived async functions ("replayables") that survive
//! pauses, restarts and partial failures. A replayable is an ordinary async
//! function built from:
//! - **Steps**: idempotent units of work whose outcomes are recorded
//! - **Hooks**: signals delivered from outside the run
//!
//! Every time a run is played, its body runs again from the top. Steps and
//! hooks that already settled return their recorded outcome instead of running
//! again, so progress is never lost and side effects happen once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use encore_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::new(ReplayContext::in_memory());
//!
//!     let greet = engine.replayable("greet", |ctx: RunContext, name: String| async move {
//!         let greeting: String = ctx
//!             .step(move || {
//!                 let name = name.clone();
//!                 async move { Ok(format!("Hello, {}!", name)) }
//!             })
//!             .await?;
//!         let approved: bool = ctx.hook::<bool>(Some("approve")).once().await?;
//!         Ok(if approved { greeting } else { "Bye".to_string() })
//!     });
//!
//!     let run = greet.start("Ada".to_string())?;
//!     engine.trigger(HookIdentifier::id("approve"), true).await?;
//!     println!("{:?}", run.await);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Event log** ([`log`]): append-only record every state is derived from
//! - **Driver** ([`driver`]): plays, pauses, resumes and recovers runs
//! - **Sequencer** ([`sequencer`]): replays races with their original winner
//! - **Notifier** ([`notifier`]): tells waiters how runs ended

pub mod combinators;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod hook;
pub mod log;
pub mod notifier;
pub mod registry;
pub mod retry;
pub mod sequencer;
pub mod step;

pub use combinators::{all, race};
pub use driver::Engine;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::combinators::{all, race};
    pub use crate::config::{ConfigBuilder, EncoreConfig, LogConfig};
    pub use crate::context::{ReplayContext, RunContext, StepContext};
    pub use crate::driver::{Engine, EngineBuilder, Replayable, RunHandle};
    pub use crate::error::{
        EncoreError, Failure, FailureKind, Fatal, Halt, Outcome, PendingSignal, Result,
        RetryAfter, Settled, StepError,
    };
    pub use crate::hook::{Hook, HookIdentifier, hook_token};
    pub use crate::log::{
        EventLog, FileLog, MemoryLog, ReplayEvent, ResumptionSource, RunState, RunStatus,
        StepState, StepStatus,
    };
    pub use crate::notifier::{LocalNotifier, Notifier, Subscription};
    pub use crate::retry::RetryPolicy;
    pub use crate::step::StepOptions;
}
