mod task;

pub use task::{ConvertAccepted, CreateTaskParams, StatusResponse, Task, TaskStatus};
