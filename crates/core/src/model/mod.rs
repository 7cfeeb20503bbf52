pub mod function;
pub mod sample;

pub use function::{Function, FunctionDebugInfo, FunctionTable};
pub use sample::{FrameInfo, ProfileContext, ProfileSample, ResolvedStack, StackSample, ThreadId};
