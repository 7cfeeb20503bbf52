pub mod collapsed;

use thiserror::Error;

pub use collapsed::{CollapsedOptions, CollapsedParseError, parse_collapsed};

use crate::model::{FunctionTable, StackSample};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("collapsed: {0}")]
    Collapsed(#[from] collapsed::CollapsedParseError),
    #[error("unable to detect format")]
    UnknownFormat,
}

/// Detect the input format and parse it into samples.
///
/// Only folded stacks are understood today; JSON input is rejected up front
/// rather than misread as a single bogus stack.
pub fn parse_auto(
    data: &[u8],
    functions: &FunctionTable,
    options: &CollapsedOptions,
) -> Result<Vec<StackSample>, ParseError> {
    if looks_like_json(data) {
        return Err(ParseError::UnknownFormat);
    }
    Ok(parse_collapsed(data, functions, options)?)
}

fn looks_like_json(data: &[u8]) -> bool {
    matches!(
        data.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{' | b'[')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_not_mistaken_for_folded_stacks() {
        let result = parse_auto(
            b"  {\"traceEvents\": []} 1",
            &FunctionTable::new(),
            &CollapsedOptions::default(),
        );
        assert!(matches!(result, Err(ParseError::UnknownFormat)));
    }

    #[test]
    fn folded_stacks_are_detected() {
        let samples = parse_auto(
            b"main;work 3\n",
            &FunctionTable::new(),
            &CollapsedOptions::default(),
        )
        .unwrap();
        assert_eq!(samples.len(), 1);
    }
}
