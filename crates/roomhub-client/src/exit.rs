//! Process termination hook used by the exit-on-disconnect policy.

use tracing::info;

/// Ends the process (or whatever "exit" means to the embedder).
pub trait ExitHook: Send + Sync {
    fn exit(&self, code: i32);
}

/// Calls [`std::process::exit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl ExitHook for ProcessExit {
    fn exit(&self, code: i32) {
        info!(code, "exiting");
        std::process::exit(code);
    }
}
