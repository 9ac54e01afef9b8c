//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `update`  | `Update`         |
//! | `history` | `History`        |
//! | `init`    | `Init`           |
//! | `config`  | `Config`         |

pub mod config;
pub mod history;
pub mod init;
pub mod serve;
pub mod update;

pub use config::cmd_config;
pub use history::cmd_history;
pub use init::cmd_init;
pub use serve::cmd_serve;
pub use update::cmd_update;
