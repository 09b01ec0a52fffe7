//! RAGO State - Persistence for workflow definitions and execution records
//!
//! Two backends implement [`StateStore`]:
//!
//! - **MemoryStateStore**: DashMap-backed, cleared on restart (default)
//! - **FileStateStore**: one JSON file per entity under a root directory;
//!   executions left running by a previous process are flagged `interrupted`
//!   when the store is reopened
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rago_state::{open_store, StateBackendKind};
//!
//! # async fn example() -> rago_core::RagoResult<()> {
//! let store = open_store(StateBackendKind::File, Some("./.rago/state".as_ref())).await?;
//! for execution in store.list_executions().await? {
//!     println!("{} {}", execution.id, execution.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;

pub use backend::file::FileStateStore;
pub use backend::memory::MemoryStateStore;
pub use backend::{open_store, StateBackendKind, StateStore};
