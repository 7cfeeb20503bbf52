use std::time::Duration;

use crate::call_tree::NodeKind;
use crate::model::{Function, FunctionDebugInfo};
use crate::shared_str::SharedStr;

pub type ThreadId = u32;

/// One observation from the sampler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSample {
    /// Instruction pointer of the innermost frame.
    pub ip: u64,
    /// Time of the sample relative to trace start.
    pub time: Duration,
    pub weight: Duration,
    pub is_kernel_code: bool,
    pub context_id: u32,
}

impl ProfileSample {
    pub fn with_weight(weight: Duration) -> Self {
        Self {
            weight,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProfileContext {
    pub process_id: u32,
    pub thread_id: ThreadId,
}

/// A single resolved stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub function: Function,
    /// Return address of the frame, relative to its module.
    pub frame_offset: u64,
    pub debug_info: Option<FunctionDebugInfo>,
    pub module_name: SharedStr,
    pub is_kernel_code: bool,
    pub is_managed_code: bool,
}

impl FrameInfo {
    pub fn new(function: Function, frame_offset: u64) -> Self {
        let module_name = function.module().clone();
        Self {
            function,
            frame_offset,
            debug_info: None,
            module_name,
            is_kernel_code: false,
            is_managed_code: false,
        }
    }

    pub fn with_debug_info(mut self, debug_info: FunctionDebugInfo) -> Self {
        self.debug_info = Some(debug_info);
        self
    }

    pub fn kernel(mut self) -> Self {
        self.is_kernel_code = true;
        self
    }

    pub fn managed(mut self) -> Self {
        self.is_managed_code = true;
        self
    }

    /// Frames with neither an address nor debug info carry no identity.
    pub fn is_usable(&self) -> bool {
        self.frame_offset != 0 || self.debug_info.is_some()
    }

    /// Kernel takes precedence over managed; everything else is native user code.
    pub fn node_kind(&self) -> NodeKind {
        if self.is_kernel_code {
            NodeKind::NativeKernel
        } else if self.is_managed_code {
            NodeKind::Managed
        } else {
            NodeKind::NativeUser
        }
    }
}

/// A sample's frames resolved to functions, ordered leaf → root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedStack {
    pub frames: Vec<FrameInfo>,
    pub context: ProfileContext,
}

impl ResolvedStack {
    pub fn new(frames: Vec<FrameInfo>, context: ProfileContext) -> Self {
        Self { frames, context }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Innermost frame that would receive exclusive time.
    pub fn leaf_frame(&self) -> Option<&FrameInfo> {
        self.frames.iter().find(|f| f.is_usable())
    }
}

/// A sample paired with its resolved stack, ready for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSample {
    pub sample: ProfileSample,
    pub stack: ResolvedStack,
}
