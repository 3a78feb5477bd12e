//! An asynchronous task-dataflow runtime built around event-driven tasks.
//!
//! Programs are dynamic graphs: nodes are short non-blocking tasks, edges
//! are dependences carried by events and data-blocks. A task runs exactly
//! once, after every one of its input slots has been satisfied and every
//! block on its sorted frontier has been acquired. Execution spans one or
//! more *policy domains*, each owning workers, a scheduler, a guid provider
//! and a transport endpoint; domains exchange a single uniform message type
//! for every operation, including the distributed metadata protocol that
//! replicates, satisfies, deletes and moves objects across domains.
//!
//! Quick tour:
//! - [`runtime::Runtime`] boots the platform and tears it down;
//! - [`pd::PolicyDomain`] carries the operation surface (`edt_create`,
//!   `event_satisfy`, `add_dependence`, ...) and the message router;
//! - [`event`] implements the seven event kinds;
//! - [`task`] implements the task lifecycle and dependence frontier.

pub mod api;
pub mod comm;
pub mod config;
pub mod datablock;
pub mod deferred;
pub mod errors;
pub mod event;
pub mod guid;
pub mod guid_provider;
pub mod hint;
pub mod metadata;
pub mod msg;
pub mod pd;
pub mod runlevel;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod trace;
pub mod worker;

pub use api::EdtCreate;
pub use config::RuntimeConfig;
pub use datablock::{DataBlock, DbProps};
pub use errors::{Result, ReturnCode, RuntimeError};
pub use event::{CollectiveParams, EventKind, EventParams, RedOp};
pub use guid::{DbAccessMode, Guid, GuidKind, Location, NULL_GUID, UNINITIALIZED_GUID};
pub use hint::{Hint, HintKind, HintProp};
pub use pd::PolicyDomain;
pub use runtime::Runtime;
pub use task::{EdtContext, EdtProps};
