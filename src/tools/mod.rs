//! 能力层：注册表、参数 Schema、资源许可、执行器与内置能力

pub mod clock;
pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod reminder;
pub mod resources;
pub mod schema;

pub use clock::CurrentTimeTool;
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs, FILESYSTEM_RESOURCE};
pub use registry::{
    new_invocation_id, Capability, CapabilityDescriptor, CapabilityError, RegistryError,
    ToolInvocationRequest, ToolRegistry, ToolResult,
};
pub use reminder::{CancelReminderTool, ListRemindersTool, SetReminderTool};
pub use resources::{ResourcePermit, ResourcePool};
pub use schema::{tool_call_schema_json, ParamKind, ParamSpec, ParameterSchema, Violation};
