//! Shell-style word expansion for build-arg substitution.
//!
//! Used when resolving `FROM` / `--from=` targets and RUN argument scopes.
//! Supports `$NAME`, `${NAME}`, `${NAME:-default}`, `${NAME-default}`,
//! `${NAME:+alternate}`, and `${NAME+alternate}`; `\$` escapes a literal
//! dollar sign. Unset variables expand to the empty string, as build args do.

use crate::{Error, Result};

/// Expands `$`-substitutions in `input` using `lookup` for variable values.
pub fn expand(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' => match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut body = String::new();
                    let mut depth = 1usize;
                    for inner in chars.by_ref() {
                        match inner {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        body.push(inner);
                    }
                    if depth != 0 {
                        return Err(Error::BadSubstitution(input.to_owned()));
                    }
                    out.push_str(&braced(&body, input, lookup)?);
                }
                Some(c2) if is_name_start(*c2) => {
                    let mut name = String::new();
                    while let Some(c2) = chars.peek() {
                        if is_name_char(*c2) {
                            name.push(*c2);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(&lookup(&name).unwrap_or_default());
                }
                _ => out.push('$'),
            },
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// Evaluates the body of a `${…}` substitution.
fn braced(body: &str, input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    // Find the operator, if any; the name must be non-empty and well-formed.
    let op_at = body.find(|c: char| !is_name_char(c));
    let (name, rest) = match op_at {
        Some(at) => body.split_at(at),
        None => (body, ""),
    };
    if name.is_empty() || !name.chars().next().is_some_and(is_name_start) {
        return Err(Error::BadSubstitution(input.to_owned()));
    }
    let value = lookup(name);
    if rest.is_empty() {
        return Ok(value.unwrap_or_default());
    }

    let (op, word) = if let Some(word) = rest.strip_prefix(":-") {
        (":-", word)
    } else if let Some(word) = rest.strip_prefix(":+") {
        (":+", word)
    } else if let Some(word) = rest.strip_prefix('-') {
        ("-", word)
    } else if let Some(word) = rest.strip_prefix('+') {
        ("+", word)
    } else {
        return Err(Error::BadSubstitution(input.to_owned()));
    };

    let expanded_word = || expand(word, lookup);
    match op {
        ":-" => match value {
            Some(v) if !v.is_empty() => Ok(v),
            _ => expanded_word(),
        },
        "-" => match value {
            Some(v) => Ok(v),
            None => expanded_word(),
        },
        ":+" => match value {
            Some(v) if !v.is_empty() => expanded_word(),
            _ => Ok(String::new()),
        },
        _ => match value {
            Some(_) => expanded_word(),
            None => Ok(String::new()),
        },
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn run(input: &str, pairs: &[(&str, &str)]) -> Result<String> {
        let map = env(pairs);
        expand(input, &|name| map.get(name).cloned())
    }

    #[test]
    fn plain_and_braced() {
        assert_eq!(run("$A/$B", &[("A", "x"), ("B", "y")]).unwrap(), "x/y");
        assert_eq!(run("${A}lpine", &[("A", "a")]).unwrap(), "alpine");
    }

    #[test]
    fn unset_is_empty() {
        assert_eq!(run("img:$TAG", &[]).unwrap(), "img:");
    }

    #[test]
    fn defaults_and_alternates() {
        assert_eq!(run("${A:-def}", &[]).unwrap(), "def");
        assert_eq!(run("${A:-def}", &[("A", "")]).unwrap(), "def");
        assert_eq!(run("${A-def}", &[("A", "")]).unwrap(), "");
        assert_eq!(run("${A:+alt}", &[("A", "v")]).unwrap(), "alt");
        assert_eq!(run("${A:+alt}", &[]).unwrap(), "");
        assert_eq!(run("${A:-$B}", &[("B", "nested")]).unwrap(), "nested");
    }

    #[test]
    fn escapes_and_literals() {
        assert_eq!(run(r"\$A", &[("A", "x")]).unwrap(), "$A");
        assert_eq!(run("a$-b", &[]).unwrap(), "a$-b");
    }

    #[test]
    fn unclosed_brace_is_an_error() {
        assert!(matches!(run("${A", &[]), Err(Error::BadSubstitution(_))));
        assert!(matches!(run("${:-x}", &[]), Err(Error::BadSubstitution(_))));
    }
}
