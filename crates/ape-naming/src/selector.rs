//! Tree selectors
//!
//! A small XPath subset sufficient for namelet expressions and the selectors
//! generated from names:
//!
//! ```text
//! path      := step+
//! step      := ("//" | "/") "*" predicate*
//! predicate := "[" or "]"
//! or        := and ("or" and)*
//! and       := cmp ("and" cmp)*
//! cmp       := "@" attr ("=" | "!=") value
//! value     := 'single' | "double with \" escapes" | integer
//! ```
//!
//! A leading `/*` selects the root, a leading `//*` any node.

use std::collections::BTreeSet;
use std::fmt;

use ape_common::{NamingError, NodeId, Result, UiNode, UiTree};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Cmp { attr: String, negated: bool, value: String },
}

impl Expr {
    fn matches(&self, node: &UiNode) -> bool {
        match self {
            Expr::Or(items) => items.iter().any(|e| e.matches(node)),
            Expr::And(items) => items.iter().all(|e| e.matches(node)),
            Expr::Cmp {
                attr,
                negated,
                value,
            } => {
                let equal = node.attribute(attr).as_deref() == Some(value.as_str());
                equal != *negated
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    predicates: Vec<Expr>,
}

impl Step {
    fn matches(&self, node: &UiNode) -> bool {
        self.predicates.iter().all(|p| p.matches(node))
    }
}

/// A compiled selector; serializes as its source text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    expr: String,
    steps: Vec<Step>,
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Eq for Selector {}

impl std::hash::Hash for Selector {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.expr.hash(state);
    }
}

impl Selector {
    pub fn parse(expr: &str) -> Result<Self> {
        let steps = Parser::new(expr).parse_path()?;
        Ok(Self {
            expr: expr.to_string(),
            steps,
        })
    }

    /// Selector matching every node
    pub fn any() -> Self {
        Self {
            expr: "//*".to_string(),
            steps: vec![Step {
                axis: Axis::Descendant,
                predicates: Vec::new(),
            }],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Nodes selected in `tree`, in node order
    pub fn select(&self, tree: &UiTree) -> Vec<NodeId> {
        let mut context: Option<BTreeSet<NodeId>> = None;
        for step in &self.steps {
            let mut next = BTreeSet::new();
            match (&context, step.axis) {
                (None, Axis::Child) => {
                    if step.matches(tree.root()) {
                        next.insert(NodeId::ROOT);
                    }
                }
                (None, Axis::Descendant) => {
                    next.extend(tree.node_ids().filter(|id| step.matches(tree.node(*id))));
                }
                (Some(ctx), Axis::Child) => {
                    for id in ctx {
                        next.extend(
                            tree.children(*id)
                                .iter()
                                .copied()
                                .filter(|c| step.matches(tree.node(*c))),
                        );
                    }
                }
                (Some(ctx), Axis::Descendant) => {
                    for id in ctx {
                        let mut stack: Vec<NodeId> = tree.children(*id).to_vec();
                        while let Some(d) = stack.pop() {
                            if step.matches(tree.node(d)) {
                                next.insert(d);
                            }
                            stack.extend(tree.children(d).iter().copied());
                        }
                    }
                }
            }
            if next.is_empty() {
                return Vec::new();
            }
            context = Some(next);
        }
        context.map(|c| c.into_iter().collect()).unwrap_or_default()
    }

    pub fn matches(&self, tree: &UiTree, node: NodeId) -> bool {
        self.select(tree).binary_search(&node).is_ok()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl TryFrom<String> for Selector {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Selector::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<Selector> for String {
    fn from(s: Selector) -> Self {
        s.expr
    }
}

struct Parser<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> ape_common::ApeError {
        NamingError::Selector {
            expr: self.src.to_string(),
            reason: format!("{} at {}", reason.into(), self.pos),
        }
        .into()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c)))
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        self.skip_ws();
        let end = self.pos + kw.len();
        if end > self.chars.len() {
            return false;
        }
        let word: String = self.chars[self.pos..end].iter().collect();
        let boundary = self
            .chars
            .get(end)
            .map(|c| c.is_whitespace() || *c == '@' || *c == '(')
            .unwrap_or(true);
        if word == kw && boundary {
            self.pos = end;
            true
        } else {
            false
        }
    }

    fn parse_path(&mut self) -> Result<Vec<Step>> {
        let mut steps = Vec::new();
        self.skip_ws();
        while self.pos < self.chars.len() {
            self.expect('/')?;
            let axis = if self.eat('/') {
                Axis::Descendant
            } else {
                Axis::Child
            };
            self.expect('*')?;
            let mut predicates = Vec::new();
            self.skip_ws();
            while self.eat('[') {
                predicates.push(self.parse_or()?);
                self.skip_ws();
                self.expect(']')?;
                self.skip_ws();
            }
            steps.push(Step { axis, predicates });
        }
        if steps.is_empty() {
            return Err(self.error("empty selector"));
        }
        Ok(steps)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut items = vec![self.parse_and()?];
        while self.eat_keyword("or") {
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut items = vec![self.parse_cmp()?];
        while self.eat_keyword("and") {
            items.push(self.parse_cmp()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        self.skip_ws();
        self.expect('@')?;
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '-' || c == '_') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected attribute name"));
        }
        let attr: String = self.chars[start..self.pos].iter().collect();
        self.skip_ws();
        let negated = self.eat('!');
        self.expect('=')?;
        self.skip_ws();
        let value = self.parse_value()?;
        Ok(Expr::Cmp {
            attr,
            negated,
            value,
        })
    }

    fn parse_value(&mut self) -> Result<String> {
        match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.peek() {
                        None => return Err(self.error("unterminated string")),
                        Some('\\') if quote == '"' => {
                            self.pos += 1;
                            match self.peek() {
                                Some(c) => {
                                    out.push(c);
                                    self.pos += 1;
                                }
                                None => return Err(self.error("dangling escape")),
                            }
                        }
                        Some(c) if c == quote => {
                            self.pos += 1;
                            return Ok(out);
                        }
                        Some(c) => {
                            out.push(c);
                            self.pos += 1;
                        }
                    }
                }
            }
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let start = self.pos;
                self.pos += 1;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.pos += 1;
                }
                Ok(self.chars[start..self.pos].iter().collect())
            }
            _ => Err(self.error("expected value")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ape_common::{RawNode, RawSnapshot, Rect, TreeOptions};

    fn node(class: &str, text: &str, clickable: bool) -> RawNode {
        RawNode {
            class_name: class.into(),
            text: text.into(),
            clickable,
            enabled: true,
            bounds: Rect::new(0, 0, 10, 10),
            ..Default::default()
        }
    }

    fn tree() -> UiTree {
        let mut list = node("android.widget.ListView", "", false);
        list.children.push(node("android.widget.TextView", "a", false));
        list.children.push(node("android.widget.TextView", "say \"b\"", false));
        let mut root = node("android.widget.FrameLayout", "", false);
        root.children.push(list);
        root.children.push(node("android.widget.Button", "OK", true));
        let options = TreeOptions {
            patch_clickable_containers: false,
            ..TreeOptions::default()
        };
        UiTree::build(
            &RawSnapshot {
                activity: "A".into(),
                root,
            },
            &options,
        )
        .unwrap()
    }

    #[test]
    fn test_any_selects_all() {
        let tree = tree();
        assert_eq!(Selector::any().select(&tree).len(), tree.len());
        assert_eq!(Selector::parse("//*").unwrap().select(&tree).len(), tree.len());
    }

    #[test]
    fn test_root_step() {
        let tree = tree();
        let s = Selector::parse("/*[@class='android.widget.FrameLayout']").unwrap();
        assert_eq!(s.select(&tree), vec![NodeId::ROOT]);
        let s = Selector::parse("/*/*[@class='android.widget.Button']").unwrap();
        assert_eq!(s.select(&tree).len(), 1);
    }

    #[test]
    fn test_or_and_negation() {
        let tree = tree();
        let s = Selector::parse("//*[@clickable='true' or @class='android.widget.ListView']").unwrap();
        assert_eq!(s.select(&tree).len(), 2);
        let s = Selector::parse("//*[@clickable='false' and @class!='android.widget.ListView']").unwrap();
        assert_eq!(s.select(&tree).len(), 3);
    }

    #[test]
    fn test_child_step_after_filter() {
        let tree = tree();
        let s = Selector::parse("//*[@class='android.widget.ListView']/*").unwrap();
        assert_eq!(s.select(&tree).len(), 2);
        let s = Selector::parse("//*[@class='android.widget.ListView']/*[@index=1]").unwrap();
        assert_eq!(s.select(&tree).len(), 1);
    }

    #[test]
    fn test_escaped_string() {
        let tree = tree();
        let s = Selector::parse(r#"//*[@text="say \"b\""]"#).unwrap();
        assert_eq!(s.select(&tree).len(), 1);
    }

    #[test]
    fn test_invalid_selectors() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("//*[@text='x'").is_err());
        assert!(Selector::parse("//node").is_err());
        assert!(Selector::parse("//*[text='x']").is_err());
    }
}
