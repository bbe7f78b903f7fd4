//! Option-group templates such as `{Welcome to|Serving} {{suburb}} with {pride|care}`.
//!
//! `{a|b}` is a group of alternatives and may nest; `{{name}}` is a literal
//! placeholder left for the renderer.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Group(Vec<Vec<Node>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariationError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for VariationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.position)
    }
}

impl std::error::Error for VariationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariationTemplate {
    nodes: Vec<Node>,
}

impl VariationTemplate {
    pub fn parse(template: &str) -> Result<Self, VariationError> {
        let mut parser = Parser {
            chars: template.char_indices().collect(),
            pos: 0,
        };
        let (nodes, terminator) = parser.sequence(false)?;
        if let Some((position, ch)) = terminator {
            return Err(VariationError {
                position,
                message: format!("unexpected '{ch}'"),
            });
        }
        Ok(Self { nodes })
    }

    /// Number of distinct renderings; saturates at `u64::MAX`.
    pub fn count(&self) -> u64 {
        count_sequence(&self.nodes)
    }

    /// Picks one rendering by index (wrapping), mixed-radix over the groups
    /// in reading order.
    pub fn render(&self, index: u64) -> String {
        let mut out = String::new();
        let total = self.count().max(1);
        render_sequence(&self.nodes, index % total, &mut out);
        out
    }
}

/// Convenience wrapper over [`VariationTemplate::parse`] + `count`.
pub fn count_variations(template: &str) -> Result<u64, VariationError> {
    Ok(VariationTemplate::parse(template)?.count())
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    /// Parses until end of input, or until `|`/`}` when inside a group.
    fn sequence(&mut self, in_group: bool) -> Result<(Vec<Node>, Option<(usize, char)>), VariationError> {
        let mut nodes = Vec::new();
        let mut text = String::new();
        while let Some(&(offset, ch)) = self.chars.get(self.pos) {
            match ch {
                '{' if self.peek_is(1, '{') => {
                    let end = self.placeholder_end().ok_or(VariationError {
                        position: offset,
                        message: "unclosed placeholder".to_string(),
                    })?;
                    for idx in self.pos..end {
                        text.push(self.chars[idx].1);
                    }
                    self.pos = end;
                }
                '{' => {
                    self.pos += 1;
                    if !text.is_empty() {
                        nodes.push(Node::Text(std::mem::take(&mut text)));
                    }
                    nodes.push(self.group(offset)?);
                }
                '|' | '}' if in_group => {
                    self.pos += 1;
                    if !text.is_empty() {
                        nodes.push(Node::Text(text));
                    }
                    return Ok((nodes, Some((offset, ch))));
                }
                '}' => {
                    return Err(VariationError {
                        position: offset,
                        message: "unbalanced '}'".to_string(),
                    })
                }
                _ => {
                    text.push(ch);
                    self.pos += 1;
                }
            }
        }
        if !text.is_empty() {
            nodes.push(Node::Text(text));
        }
        Ok((nodes, None))
    }

    fn group(&mut self, open: usize) -> Result<Node, VariationError> {
        let mut options = Vec::new();
        loop {
            let (option, terminator) = self.sequence(true)?;
            options.push(option);
            match terminator {
                Some((_, '|')) => continue,
                Some((_, '}')) => return Ok(Node::Group(options)),
                _ => {
                    return Err(VariationError {
                        position: open,
                        message: "unclosed option group".to_string(),
                    })
                }
            }
        }
    }

    fn peek_is(&self, ahead: usize, expected: char) -> bool {
        self.chars
            .get(self.pos + ahead)
            .map(|(_, ch)| *ch == expected)
            .unwrap_or(false)
    }

    /// Index just past the `}}` closing the placeholder at `self.pos`.
    fn placeholder_end(&self) -> Option<usize> {
        let mut idx = self.pos + 2;
        while idx + 1 < self.chars.len() {
            if self.chars[idx].1 == '}' && self.chars[idx + 1].1 == '}' {
                return Some(idx + 2);
            }
            idx += 1;
        }
        None
    }
}

fn count_sequence(nodes: &[Node]) -> u64 {
    nodes.iter().fold(1u64, |acc, node| match node {
        Node::Text(_) => acc,
        Node::Group(options) => acc.saturating_mul(
            options
                .iter()
                .fold(0u64, |sum, option| sum.saturating_add(count_sequence(option))),
        ),
    })
}

fn render_sequence(nodes: &[Node], mut index: u64, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Group(options) => {
                let group_total = count_sequence(std::slice::from_ref(node)).max(1);
                let mut local = index % group_total;
                index /= group_total;
                for option in options {
                    let option_total = count_sequence(option);
                    if local < option_total {
                        render_sequence(option, local, out);
                        break;
                    }
                    local -= option_total;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{count_variations, VariationTemplate};

    #[test]
    fn three_by_two_by_three_is_eighteen() -> anyhow::Result<()> {
        let template = "{Fast|Friendly|Local} {roof|gutter} cleaning {today|this week|on demand}";
        assert_eq!(count_variations(template)?, 18);
        Ok(())
    }

    #[test]
    fn placeholders_are_literal() -> anyhow::Result<()> {
        let parsed = VariationTemplate::parse("{Welcome to|Serving} {{suburb}}!")?;
        assert_eq!(parsed.count(), 2);
        assert_eq!(parsed.render(0), "Welcome to {{suburb}}!");
        assert_eq!(parsed.render(1), "Serving {{suburb}}!");
        Ok(())
    }

    #[test]
    fn nested_groups_add_within_and_multiply_across() -> anyhow::Result<()> {
        assert_eq!(count_variations("{a|b {c|d}} {e|f}")?, 6);
        assert_eq!(count_variations("no groups here")?, 1);
        Ok(())
    }

    #[test]
    fn every_index_renders_a_distinct_variant() -> anyhow::Result<()> {
        let parsed = VariationTemplate::parse("{a|b|c}-{x|y}")?;
        let rendered: BTreeSet<String> = (0..parsed.count()).map(|idx| parsed.render(idx)).collect();
        assert_eq!(rendered.len(), 6);
        assert!(rendered.contains("c-y"));
        Ok(())
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(count_variations("{a|b").is_err());
        assert!(count_variations("a}b").is_err());
        assert!(count_variations("{{open").is_err());
    }
}
