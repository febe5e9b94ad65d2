//! Rebuilds complete tool calls from out-of-order streaming fragments.
//!
//! Chat-completions streams deliver tool calls as sparse deltas, each tagged
//! by `index` and carrying a piece of `id`, `name`, or a substring of the
//! JSON-encoded arguments. Parsing the accumulated argument string is
//! deferred to dispatch time so a half-streamed payload never aborts a turn.

use crate::types::ToolCallFragment;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AccumulatorError {
    #[error("malformed stream: conflicting '{field}' for tool call index {index}")]
    MalformedStream { index: u32, field: &'static str },
}

/// A tool call as accumulated off the wire. Arguments stay a raw string
/// until dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl RawToolCall {
    /// Parse the accumulated argument string. An empty string parses as an
    /// empty object, matching models that stream no argument deltas for
    /// zero-parameter tools.
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    kind: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates streaming tool-call fragments into complete calls, grouped by
/// fragment index. Out-of-order fragments are tolerated; duplicate scalar
/// fragments are accepted only when consistent.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Fold one fragment into the accumulated state.
    pub fn add(&mut self, fragment: &ToolCallFragment) -> Result<(), AccumulatorError> {
        let index = fragment.index;
        let entry = self.calls.entry(index).or_default();

        if let Some(id) = &fragment.id {
            fill_scalar(&mut entry.id, id, index, "id")?;
        }
        if let Some(kind) = &fragment.kind {
            fill_scalar(&mut entry.kind, kind, index, "type")?;
        }
        if let Some(name) = &fragment.name {
            fill_scalar(&mut entry.name, name, index, "name")?;
        }
        if let Some(arguments) = &fragment.arguments {
            entry.arguments.push_str(arguments);
        }
        Ok(())
    }

    pub fn add_all(&mut self, fragments: &[ToolCallFragment]) -> Result<(), AccumulatorError> {
        for fragment in fragments {
            self.add(fragment)?;
        }
        Ok(())
    }

    /// Emit the calls that accumulated both an id and a name, in index order.
    pub fn completed(&self) -> Vec<RawToolCall> {
        self.calls
            .values()
            .filter_map(|partial| {
                let id = partial.id.clone()?;
                let name = partial.name.clone()?;
                Some(RawToolCall {
                    id,
                    name,
                    arguments: partial.arguments.clone(),
                })
            })
            .collect()
    }
}

fn fill_scalar(
    slot: &mut Option<String>,
    value: &str,
    index: u32,
    field: &'static str,
) -> Result<(), AccumulatorError> {
    match slot {
        None => {
            *slot = Some(value.to_string());
            Ok(())
        }
        Some(existing) if existing == value => Ok(()),
        Some(_) => Err(AccumulatorError::MalformedStream { index, field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(index: u32) -> ToolCallFragment {
        ToolCallFragment {
            index,
            ..Default::default()
        }
    }

    #[test]
    fn assembles_fragmented_arguments() {
        let mut acc = ToolCallAccumulator::new();
        acc.add(&ToolCallFragment {
            id: Some("c1".into()),
            name: Some("write_file".into()),
            ..frag(0)
        })
        .unwrap();
        acc.add(&ToolCallFragment {
            arguments: Some("{\"path\":\"".into()),
            ..frag(0)
        })
        .unwrap();
        acc.add(&ToolCallFragment {
            arguments: Some("a.txt\",\"content\":\"hi\"}".into()),
            ..frag(0)
        })
        .unwrap();

        let calls = acc.completed();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].name, "write_file");
        let args = calls[0].parse_arguments().unwrap();
        assert_eq!(args["path"], "a.txt");
        assert_eq!(args["content"], "hi");
    }

    #[test]
    fn incomplete_calls_are_withheld() {
        let mut acc = ToolCallAccumulator::new();
        acc.add(&ToolCallFragment {
            arguments: Some("{}".into()),
            ..frag(0)
        })
        .unwrap();
        assert!(acc.completed().is_empty());

        acc.add(&ToolCallFragment {
            id: Some("c1".into()),
            ..frag(0)
        })
        .unwrap();
        assert!(acc.completed().is_empty());

        acc.add(&ToolCallFragment {
            name: Some("list_directory".into()),
            ..frag(0)
        })
        .unwrap();
        assert_eq!(acc.completed().len(), 1);
    }

    #[test]
    fn out_of_order_indices_emit_in_index_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.add(&ToolCallFragment {
            id: Some("c2".into()),
            name: Some("second".into()),
            ..frag(1)
        })
        .unwrap();
        acc.add(&ToolCallFragment {
            id: Some("c1".into()),
            name: Some("first".into()),
            ..frag(0)
        })
        .unwrap();

        let calls = acc.completed();
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].name, "second");
    }

    #[test]
    fn consistent_duplicate_scalars_are_accepted() {
        let mut acc = ToolCallAccumulator::new();
        let fragment = ToolCallFragment {
            id: Some("c1".into()),
            name: Some("read_file".into()),
            ..frag(0)
        };
        acc.add(&fragment).unwrap();
        acc.add(&fragment).unwrap();
        assert_eq!(acc.completed().len(), 1);
    }

    #[test]
    fn conflicting_duplicate_scalar_is_malformed() {
        let mut acc = ToolCallAccumulator::new();
        acc.add(&ToolCallFragment {
            id: Some("c1".into()),
            ..frag(0)
        })
        .unwrap();
        let err = acc
            .add(&ToolCallFragment {
                id: Some("c9".into()),
                ..frag(0)
            })
            .unwrap_err();
        assert_eq!(
            err,
            AccumulatorError::MalformedStream {
                index: 0,
                field: "id"
            }
        );
    }

    #[test]
    fn empty_arguments_parse_as_empty_object() {
        let call = RawToolCall {
            id: "c1".into(),
            name: "check_mail".into(),
            arguments: String::new(),
        };
        assert_eq!(call.parse_arguments().unwrap(), serde_json::json!({}));
    }

    #[test]
    fn random_split_round_trips() {
        // Splitting a valid call into arbitrary argument fragments must
        // reassemble the original.
        let args = r#"{"path":"src/main.rs","offset":10,"limit":25}"#;
        for split in [1usize, 3, 7, args.len()] {
            let mut acc = ToolCallAccumulator::new();
            acc.add(&ToolCallFragment {
                id: Some("c1".into()),
                name: Some("read_file".into()),
                ..frag(0)
            })
            .unwrap();
            for chunk in args.as_bytes().chunks(split) {
                acc.add(&ToolCallFragment {
                    arguments: Some(String::from_utf8(chunk.to_vec()).unwrap()),
                    ..frag(0)
                })
                .unwrap();
            }
            let calls = acc.completed();
            assert_eq!(calls[0].arguments, args);
            assert!(calls[0].parse_arguments().is_ok());
        }
    }
}
