mod error;
mod netmap;
mod policy;

pub use error::{CompileError, EvalError, ObjectKind};
pub use netmap::{Attribute, ContainerId, NetworkMap, NodeInfo, NodeState, CONTAINER_ID_LEN};
pub use policy::{Clause, Filter, Operation, PlacementPolicy, Replica, Selector, MATCH_ALL};

pub type Epoch = u64;
pub type SubnetId = u32;
