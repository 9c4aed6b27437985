pub mod memory;
pub mod traits;
pub mod virsh;

pub use memory::{CallCounts, SimulatedMachine};
pub use traits::{validate_checkpoint_name, CheckpointStore, MachineControl};
pub use virsh::VirshMachine;
