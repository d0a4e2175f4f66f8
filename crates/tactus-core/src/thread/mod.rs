//! Thread tree and tic scheduling.

mod gate;
mod node;
mod scheduler;
mod state;

pub use gate::TicGate;
pub(crate) use node::panic_message;
pub use node::{idle_work, NodeFault, NodeId, ThreadNode, ThreadWork, TicContext, TickEnv};
pub use scheduler::{SafeWindow, ThreadTree, TicScheduler};
pub use state::{NodeKind, NodeState};
