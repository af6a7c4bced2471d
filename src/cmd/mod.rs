//! CLI command implementations.
//!
//! | Module      | Commands handled                  |
//! |-------------|-----------------------------------|
//! | `run`       | `Run`                             |
//! | `task`      | `Status`, `Cancel`, `Reset`       |
//! | `workspace` | `Workspace List`, `Workspace Cleanup` |

pub mod run;
pub mod task;
pub mod workspace;

pub use run::cmd_run;
pub use task::{cmd_cancel, cmd_reset, cmd_status};
pub use workspace::{cmd_workspace_cleanup, cmd_workspace_list};
