pub mod heartbeat;
pub mod history;
pub mod intent;
pub mod state_machine;

pub use heartbeat::{HeartbeatRecord, HeartbeatTracker};
pub use history::{StateLog, StateTransition};
pub use intent::ManualIntentTracker;
pub use state_machine::{ControllerEvent, ControllerStateMachine, StateInputs};
