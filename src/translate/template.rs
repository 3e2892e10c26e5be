//! Prefix templates.
//!
//! A template is literal text with `{token}` placeholders. A numeric suffix
//! truncates the value: `{display5}` renders at most five characters of
//! `display`. `{{` and `}}` produce literal braces.
//!
//! Rendered prefixes can be matched back against a message to recover the
//! token values and the text that follows the prefix.

use crate::error::{Error, Result};

/// Largest accepted truncation width.
pub const MAX_TOKEN_WIDTH: usize = 20;

/// Tokens available in mesh-bound prefixes (chat user to radio).
pub const MESH_TOKENS: &[&str] = &["display", "user", "username", "server"];

/// Tokens available in chat-bound prefixes (radio or remote meshnet to chat).
pub const CHAT_TOKENS: &[&str] = &["long", "short", "mesh"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Token { name: String, width: Option<usize> },
}

/// A parsed prefix template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

/// Result of matching a template against text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateMatch<'a> {
    /// Captured token values, in template order.
    pub values: Vec<(String, &'a str)>,
    /// Text following the prefix.
    pub body: &'a str,
}

impl TemplateMatch<'_> {
    /// Returns the captured value of a token.
    #[must_use]
    pub fn get(&self, token: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == token)
            .map(|(_, value)| *value)
    }
}

impl Template {
    /// Parses a template, accepting only the given token names.
    pub fn parse(source: &str, tokens: &[&str]) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidTemplate {
            template: source.to_string(),
            reason,
        };

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("unmatched '}'".into())),
                '{' => {
                    let mut raw = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(invalid("unclosed '{'".into())),
                            Some(c) => raw.push(c),
                        }
                    }
                    let (name, width) = split_width(&raw).map_err(invalid)?;
                    if !tokens.contains(&name) {
                        return Err(invalid(format!("unknown token {{{name}}}")));
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Token {
                        name: name.to_string(),
                        width,
                    });
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// The template as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns true if the template renders nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Renders the template. Tokens without a value render empty.
    #[must_use]
    pub fn render(&self, values: &[(&str, &str)]) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Token { name, width } => {
                    let value = values
                        .iter()
                        .find(|(key, _)| key == name)
                        .map_or("", |(_, value)| *value);
                    match width {
                        Some(n) => out.extend(value.chars().take(*n)),
                        None => out.push_str(value),
                    }
                }
            }
        }
        out
    }

    /// Matches the template against the start of `text`.
    ///
    /// A token ends at the first occurrence of the literal that follows it.
    /// A trailing token takes exactly its width, or everything up to the
    /// first whitespace when it has none.
    #[must_use]
    pub fn strip<'a>(&self, text: &'a str) -> Option<TemplateMatch<'a>> {
        let mut rest = text;
        let mut values = Vec::new();
        let mut parts = self.parts.iter().peekable();

        while let Some(part) = parts.next() {
            match part {
                Part::Literal(literal) => rest = rest.strip_prefix(literal.as_str())?,
                Part::Token { name, width } => {
                    let end = match parts.peek() {
                        Some(Part::Literal(next)) => rest.find(next.as_str())?,
                        _ => match width {
                            Some(n) => rest.char_indices().nth(*n).map_or(rest.len(), |(i, _)| i),
                            None => rest.find(char::is_whitespace).unwrap_or(rest.len()),
                        },
                    };
                    let value = &rest[..end];
                    if width.is_some_and(|n| value.chars().count() > n) {
                        return None;
                    }
                    values.push((name.clone(), value));
                    rest = &rest[end..];
                }
            }
        }

        Some(TemplateMatch { values, body: rest })
    }
}

/// Splits `name12` into `("name", Some(12))`.
fn split_width(raw: &str) -> std::result::Result<(&str, Option<usize>), String> {
    let digits = raw.len() - raw.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return Ok((raw, None));
    }
    let (name, width) = raw.split_at(raw.len() - digits);
    let width: usize = width
        .parse()
        .map_err(|_| format!("bad width in {{{raw}}}"))?;
    if width == 0 || width > MAX_TOKEN_WIDTH {
        return Err(format!(
            "width {width} in {{{raw}}} outside 1..={MAX_TOKEN_WIDTH}"
        ));
    }
    Ok((name, Some(width)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_width() {
        let t = Template::parse("{display5}[M]: ", MESH_TOKENS).unwrap();
        assert_eq!(t.render(&[("display", "Alexander")]), "Alexa[M]: ");
        assert_eq!(t.render(&[("display", "Al")]), "Al[M]: ");
    }

    #[test]
    fn test_escapes_and_missing_values() {
        let t = Template::parse("{{{long}}} ", CHAT_TOKENS).unwrap();
        assert_eq!(t.render(&[("long", "x")]), "{x} ");
        assert_eq!(t.render(&[]), "{} ");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Template::parse("{nope}", CHAT_TOKENS).is_err());
        assert!(Template::parse("{long", CHAT_TOKENS).is_err());
        assert!(Template::parse("long}", CHAT_TOKENS).is_err());
        assert!(Template::parse("{long0}", CHAT_TOKENS).is_err());
        assert!(Template::parse("{long21}", CHAT_TOKENS).is_err());
        assert!(Template::parse("{long20}", CHAT_TOKENS).is_ok());
    }

    #[test]
    fn test_empty_template() {
        let t = Template::parse("", CHAT_TOKENS).unwrap();
        assert!(t.is_empty());
        assert_eq!(t.render(&[("long", "x")]), "");
        assert_eq!(t.strip("hello").unwrap().body, "hello");
    }

    #[test]
    fn test_strip_recovers_values() {
        let t = Template::parse("[{long}/{mesh}]: ", CHAT_TOKENS).unwrap();
        let text = format!("{}hello there", t.render(&[("long", "Base"), ("mesh", "north")]));

        let m = t.strip(&text).unwrap();
        assert_eq!(m.get("long"), Some("Base"));
        assert_eq!(m.get("mesh"), Some("north"));
        assert_eq!(m.body, "hello there");

        assert!(t.strip("no prefix here").is_none());
    }

    #[test]
    fn test_strip_trailing_token() {
        let t = Template::parse("<{short3}>", CHAT_TOKENS).unwrap();
        let m = t.strip("<ab>rest").unwrap();
        assert_eq!(m.get("short"), Some("ab"));

        let t = Template::parse("{short2}", CHAT_TOKENS).unwrap();
        let m = t.strip("abcdef").unwrap();
        assert_eq!(m.get("short"), Some("ab"));
        assert_eq!(m.body, "cdef");
    }
}
