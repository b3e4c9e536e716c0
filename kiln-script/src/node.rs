//! Raw parse-tree contract between the external script parser and kiln.
//!
//! The parser is free to implement whatever grammar it likes; kiln only
//! requires that each instruction line arrives as a [`Node`] carrying the
//! command keyword, the original source text, any `--key=value` flag tokens,
//! the pre-resolved argument tokens, and heredoc payloads.

/// A heredoc body attached to an instruction line.
///
/// `RUN <<EOF … EOF` and `COPY <<robots.txt /dest` both surface here; the
/// engine decides whether the payload is executed or materialized as a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heredoc {
    /// The delimiter / file name after `<<` (without the marker).
    pub name: String,
    /// The body, exactly as written, including the trailing newline.
    pub content: String,
}

/// One instruction line as produced by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Command keyword (`FROM`, `run`, …); matched case-insensitively.
    pub value: String,
    /// The full original source text of the line.
    pub original: String,
    /// `--key=value` flag tokens, in source order.
    pub flags: Vec<String>,
    /// Pre-resolved argument tokens (flags excluded).
    pub children: Vec<String>,
    /// Heredoc payloads attached to this line, in source order.
    pub heredocs: Vec<Heredoc>,
}

impl Node {
    /// Convenience constructor for a bare line with no flags or heredocs.
    pub fn new(value: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            original: original.into(),
            ..Self::default()
        }
    }
}

/// A parsed script: an ordered list of instruction lines.
///
/// Multiple script bodies concatenated in order (e.g. a base script plus an
/// appended override) are merged with [`Script::append_children`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    /// Instruction lines, in source order.
    pub children: Vec<Node>,
}

impl Script {
    /// Creates a script from a list of instruction lines.
    pub fn new(children: Vec<Node>) -> Self {
        Self { children }
    }

    /// Appends another script body's lines after this one's.
    pub fn append_children(&mut self, other: Script) {
        self.children.extend(other.children);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_order() {
        let mut a = Script::new(vec![Node::new("FROM", "FROM alpine")]);
        let b = Script::new(vec![Node::new("RUN", "RUN true")]);
        a.append_children(b);
        assert_eq!(a.children.len(), 2);
        assert_eq!(a.children[1].value, "RUN");
    }
}
