mod entity_address;
mod entity_id;
mod entity_type;
mod machine_id;
mod runner_address;
mod shard_id;

pub use entity_address::EntityAddress;
pub use entity_id::EntityId;
pub use entity_type::EntityType;
pub use machine_id::{MachineId, MachineIdError, MAX_MACHINE_ID};
pub use runner_address::{ParseRunnerAddressError, RunnerAddress};
pub use shard_id::{ParseShardIdError, ShardId};
