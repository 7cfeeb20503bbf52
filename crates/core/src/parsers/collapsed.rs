use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::model::{
    FrameInfo, FunctionTable, ProfileContext, ProfileSample, ResolvedStack, StackSample,
};

#[derive(Debug, Error)]
pub enum CollapsedParseError {
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("no valid stack lines found")]
    Empty,
}

/// Settings for turning folded-stack counts into weighted samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollapsedOptions {
    /// Time represented by one count.
    pub sample_interval: Duration,
    pub thread_id: u32,
    pub process_id: u32,
}

impl Default for CollapsedOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(1),
            thread_id: 0,
            process_id: 0,
        }
    }
}

const UNKNOWN_MODULE: &str = "unknown";
const KERNEL_SUFFIX: &str = "_[k]";
const MANAGED_SUFFIX: &str = "_[j]";

/// Parse Brendan Gregg's collapsed/folded stack format.
///
/// Each line has the format: `frame;frame;... count`, outermost frame
/// first. A frame is `module!function` or a bare function name.
///
/// Used by: `perf script | stackcollapse-perf.pl`, dtrace, FlameGraph tools.
pub fn parse_collapsed(
    data: &[u8],
    functions: &FunctionTable,
    options: &CollapsedOptions,
) -> Result<Vec<StackSample>, CollapsedParseError> {
    let text = std::str::from_utf8(data)?;
    let context = ProfileContext {
        process_id: options.process_id,
        thread_id: options.thread_id,
    };
    let mut samples = Vec::new();
    let mut elapsed = Duration::ZERO;
    let mut skipped = 0usize;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Split into stack and count: "a;b;c 42"
        let Some((stack_str, count)) = line
            .rsplit_once(char::is_whitespace)
            .and_then(|(stack, count)| Some((stack.trim(), count.parse::<u32>().ok()?)))
        else {
            skipped += 1;
            continue;
        };

        // Root first in the file, leaf first in a resolved stack.
        let mut frames: Vec<FrameInfo> = stack_str
            .split(';')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .enumerate()
            .map(|(depth, token)| parse_frame(token, depth, functions))
            .collect();
        if frames.is_empty() {
            skipped += 1;
            continue;
        }
        frames.reverse();

        let weight = options.sample_interval * count;
        samples.push(StackSample {
            sample: ProfileSample {
                time: elapsed,
                weight,
                is_kernel_code: frames[0].is_kernel_code,
                ..ProfileSample::default()
            },
            stack: ResolvedStack::new(frames, context),
        });
        elapsed += weight;
    }

    if skipped > 0 {
        debug!("collapsed: skipped {skipped} lines without a stack or count");
    }
    if samples.is_empty() {
        return Err(CollapsedParseError::Empty);
    }
    debug!("collapsed: parsed {} samples", samples.len());
    Ok(samples)
}

fn parse_frame(token: &str, depth: usize, functions: &FunctionTable) -> FrameInfo {
    let (token, kernel, managed) = if let Some(name) = token.strip_suffix(KERNEL_SUFFIX) {
        (name, true, false)
    } else if let Some(name) = token.strip_suffix(MANAGED_SUFFIX) {
        (name, false, true)
    } else {
        (token, false, false)
    };

    let (module, name) = token.split_once('!').unwrap_or((UNKNOWN_MODULE, token));

    // Folded stacks carry no addresses; depth stands in so no frame is skipped.
    let mut frame = FrameInfo::new(functions.function(name, module), depth as u64 + 1);
    frame.is_kernel_code = kernel;
    frame.is_managed_code = managed;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_tree::NodeKind;

    fn parse(input: &[u8]) -> Result<Vec<StackSample>, CollapsedParseError> {
        parse_collapsed(input, &FunctionTable::new(), &CollapsedOptions::default())
    }

    #[test]
    fn parse_basic_collapsed() {
        let input = b"main;foo;bar 10\nmain;foo;baz 20\nmain;qux 5\n";
        let samples = parse(input).unwrap();
        assert_eq!(samples.len(), 3);

        let first = &samples[0];
        assert_eq!(first.sample.weight, Duration::from_millis(10));
        assert_eq!(first.stack.frame_count(), 3);
        // Leaf first.
        assert_eq!(first.stack.frames[0].function.name(), "bar");
        assert_eq!(first.stack.frames[2].function.name(), "main");
        assert_eq!(first.stack.frames[2].function.module(), "unknown");

        assert_eq!(samples[2].sample.time, Duration::from_millis(30));
    }

    #[test]
    fn module_prefix_and_suffixes() {
        let input = b"app.exe!main;ntoskrnl.exe!KiSwap_[k];Jit!Lambda_[j] 2\n";
        let options = CollapsedOptions {
            sample_interval: Duration::from_micros(250),
            thread_id: 7,
            process_id: 3,
        };
        let samples = parse_collapsed(input, &FunctionTable::new(), &options).unwrap();
        let stack = &samples[0].stack;
        assert_eq!(stack.context.thread_id, 7);
        assert_eq!(samples[0].sample.weight, Duration::from_micros(500));

        let leaf = &stack.frames[0];
        assert_eq!(leaf.function.name(), "Lambda");
        assert_eq!(leaf.node_kind(), NodeKind::Managed);
        assert_eq!(stack.frames[1].function.module(), "ntoskrnl.exe");
        assert_eq!(stack.frames[1].node_kind(), NodeKind::NativeKernel);
        assert!(stack.frames.iter().all(FrameInfo::is_usable));
    }

    #[test]
    fn skips_comments_and_lines_without_count() {
        let input = b"# comment\n\nmain;foo 5\nmain;broken\nmain;bad x\n";
        let samples = parse(input).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].stack.frame_count(), 2);
    }

    #[test]
    fn empty_input_errors() {
        assert!(matches!(parse(b""), Err(CollapsedParseError::Empty)));
        assert!(matches!(parse(b"\xff\xfe 1"), Err(CollapsedParseError::Utf8(_))));
    }
}
