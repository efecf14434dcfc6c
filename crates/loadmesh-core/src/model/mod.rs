pub mod execution;
pub mod slave;
pub mod task;

pub use execution::{ExecutionError, ExecutionState, ExecutionStatus, SlaveExecutionState};
pub use slave::{Slave, SlaveInfo, SlaveResources, SlaveStatus, SlaveType, Status};
pub use task::{ExecutionMode, Segment, Stage, Task, TaskOptions};
