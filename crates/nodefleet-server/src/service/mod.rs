//! RPC surfaces served by the nodefleet processes.
//!
//! | API | process | service |
//! |---|---|---|
//! | `db` | db | [`DbService`] |
//! | `blocking` | blocking | [`BlockingService`] |
//! | `cs` | main | [`ClientService`] |
//! | `ns` | main | [`NodeService`] |
//! | `cs`, `ns` | hub | [`ForwardService`], relaying to main |

mod blocking;
mod cs;
mod db;
mod forward;
mod ns;

pub use blocking::BlockingService;
pub use cs::{ClientService, CommandArgs, ImageArgs, RegisterReply, CS_API};
pub use db::DbService;
pub use forward::{ClientApi, ForwardService, ForwardedApi, NodeApi};
pub use ns::{HeartbeatArgs, NodeImage, NodeService, NS_API};
