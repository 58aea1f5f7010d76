//! Pipeline sources in a small DOT dialect.
//!
//! ```text
//! digraph turnout {
//!     ds1       [type=bridge name=voter_turnout];
//!     ds1_parse [type=jsonparse path="data,result"];
//!     ds1 -> ds1_parse;
//! }
//! ```
//!
//! Attribute values are bare words, `"quoted strings"` or `<angle blocks>`;
//! angle blocks may span lines and nest, which suits inline JSON bodies.
//! When no node has `type=result`, an implicit [`IMPLICIT_RESULT_ID`] node is
//! appended whose predecessors are the graph's sinks. Sinks carrying an
//! `index` attribute come first, ordered by it; the rest follow in
//! declaration order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use rust_decimal::Decimal;

use super::graph::{GraphError, TaskGraph};
use crate::task::{
    BridgeConfig, HttpConfig, JsonParseConfig, MedianConfig, MultiplyConfig, TaskKind, TaskSpec,
};

/// DotID of the result node added when a source declares none.
pub const IMPLICIT_RESULT_ID: &str = "__result__";

impl TaskGraph {
    /// Parse a DOT pipeline source and build its graph.
    pub fn from_dot(source: &str) -> Result<TaskGraph, GraphError> {
        TaskGraph::build(parse_specs(source)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Quoted(String),
    Arrow,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Equals,
    Semi,
    Comma,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> GraphError {
        GraphError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, GraphError> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            let line = self.line;
            let token = match c {
                c if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                '/' => {
                    self.bump();
                    match self.bump() {
                        Some('/') => {
                            while let Some(c) = self.bump() {
                                if c == '\n' {
                                    break;
                                }
                            }
                            continue;
                        }
                        Some('*') => {
                            self.skip_block_comment()?;
                            continue;
                        }
                        _ => return Err(self.error("unexpected '/'")),
                    }
                }
                '#' if self.at_line_start(&tokens, line) => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                    continue;
                }
                '[' => self.single(Token::LBracket),
                ']' => self.single(Token::RBracket),
                '{' => self.single(Token::LBrace),
                '}' => self.single(Token::RBrace),
                '=' => self.single(Token::Equals),
                ';' => self.single(Token::Semi),
                ',' => self.single(Token::Comma),
                '-' => {
                    self.bump();
                    match self.chars.peek() {
                        Some('>') => {
                            self.bump();
                            Token::Arrow
                        }
                        _ => Token::Ident(format!("-{}", self.word())),
                    }
                }
                '"' => {
                    self.bump();
                    Token::Quoted(self.quoted()?)
                }
                '<' => {
                    self.bump();
                    Token::Quoted(self.angled()?)
                }
                c if is_word_char(c) => Token::Ident(self.word()),
                other => return Err(self.error(format!("unexpected character '{other}'"))),
            };
            tokens.push((token, line));
        }
        Ok(tokens)
    }

    fn at_line_start(&self, tokens: &[(Token, usize)], line: usize) -> bool {
        tokens.last().map_or(true, |(_, l)| *l < line)
    }

    fn single(&mut self, token: Token) -> Token {
        self.bump();
        token
    }

    fn word(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if !is_word_char(c) {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }

    fn quoted(&mut self) -> Result<String, GraphError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(self.error("unterminated string"))
    }

    fn angled(&mut self) -> Result<String, GraphError> {
        let mut out = String::new();
        let mut depth = 1;
        while let Some(c) = self.bump() {
            match c {
                '<' => depth += 1,
                '>' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out.trim().to_string());
                    }
                }
                _ => {}
            }
            out.push(c);
        }
        Err(self.error("unterminated '<' block"))
    }

    fn skip_block_comment(&mut self) -> Result<(), GraphError> {
        let mut prev = '\0';
        while let Some(c) = self.bump() {
            if prev == '*' && c == '/' {
                return Ok(());
            }
            prev = c;
        }
        Err(self.error("unterminated block comment"))
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '$')
}

#[derive(Debug, Default)]
struct ParsedNode {
    line: usize,
    attrs: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Document {
    order: Vec<String>,
    nodes: HashMap<String, ParsedNode>,
    edges: Vec<(String, String, usize)>,
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |(_, l)| *l)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> GraphError {
        GraphError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, GraphError> {
        match self.next() {
            Some(Token::Ident(s)) | Some(Token::Quoted(s)) => Ok(s),
            Some(other) => Err(self.error(format!("expected identifier, found {other:?}"))),
            None => Err(self.error("expected identifier, found end of input")),
        }
    }

    fn parse(mut self) -> Result<Document, GraphError> {
        let mut doc = Document::default();

        let wrapped = match self.peek() {
            Some(Token::Ident(kw)) if kw.eq_ignore_ascii_case("digraph") => {
                self.pos += 1;
                if matches!(self.peek(), Some(Token::Ident(_)) | Some(Token::Quoted(_))) {
                    self.pos += 1;
                }
                if !self.eat(&Token::LBrace) {
                    return Err(self.error("expected '{' after digraph header"));
                }
                true
            }
            _ => false,
        };

        loop {
            match self.peek() {
                None if wrapped => return Err(self.error("missing closing '}'")),
                None => break,
                Some(Token::RBrace) if wrapped => {
                    self.pos += 1;
                    if self.peek().is_some() {
                        return Err(self.error("unexpected input after closing '}'"));
                    }
                    break;
                }
                Some(Token::Semi) => {
                    self.pos += 1;
                }
                Some(_) => self.statement(&mut doc)?,
            }
        }

        Ok(doc)
    }

    fn statement(&mut self, doc: &mut Document) -> Result<(), GraphError> {
        let line = self.line();
        let first = self.ident()?;

        if self.peek() == Some(&Token::Arrow) {
            let mut chain = vec![first];
            while self.eat(&Token::Arrow) {
                chain.push(self.ident()?);
            }
            if self.peek() == Some(&Token::LBracket) {
                return Err(self.error("edge attributes are not supported"));
            }
            for pair in chain.windows(2) {
                doc.edges.push((pair[0].clone(), pair[1].clone(), line));
            }
        } else {
            let attrs = if self.peek() == Some(&Token::LBracket) {
                self.attributes()?
            } else {
                BTreeMap::new()
            };
            if doc.nodes.contains_key(&first) {
                return Err(GraphError::DuplicateNode(first));
            }
            doc.order.push(first.clone());
            doc.nodes.insert(first, ParsedNode { line, attrs });
        }

        self.eat(&Token::Semi);
        Ok(())
    }

    fn attributes(&mut self) -> Result<BTreeMap<String, String>, GraphError> {
        let mut attrs = BTreeMap::new();
        self.eat(&Token::LBracket);
        loop {
            match self.peek() {
                Some(Token::RBracket) => {
                    self.pos += 1;
                    return Ok(attrs);
                }
                Some(Token::Comma) | Some(Token::Semi) => {
                    self.pos += 1;
                }
                Some(_) => {
                    let key = self.ident()?;
                    if !self.eat(&Token::Equals) {
                        return Err(self.error(format!("expected '=' after attribute '{key}'")));
                    }
                    let value = self.ident()?;
                    attrs.insert(key, value);
                }
                None => return Err(self.error("unterminated attribute list")),
            }
        }
    }
}

fn parse_specs(source: &str) -> Result<Vec<TaskSpec>, GraphError> {
    let tokens = Lexer::new(source).tokenize()?;
    let doc = Parser { tokens, pos: 0 }.parse()?;

    let mut preds: HashMap<&str, Vec<String>> = HashMap::new();
    let mut has_successor: HashSet<&str> = HashSet::new();
    for (from, to, _) in &doc.edges {
        if !doc.nodes.contains_key(from) || !doc.nodes.contains_key(to) {
            return Err(GraphError::DanglingEdge {
                node: to.clone(),
                predecessor: from.clone(),
            });
        }
        preds.entry(to.as_str()).or_default().push(from.clone());
        has_successor.insert(from.as_str());
    }

    let mut specs = Vec::with_capacity(doc.order.len() + 1);
    let mut has_result = false;
    let mut sinks = Vec::new();

    for id in &doc.order {
        let node = &doc.nodes[id];
        let kind = task_kind(id, &node.attrs)?;
        has_result |= kind.is_result();
        if !has_successor.contains(id.as_str()) && !kind.is_result() {
            let index = match node.attrs.get("index") {
                Some(raw) => Some(raw.parse::<i64>().map_err(|_| GraphError::Parse {
                    line: node.line,
                    message: format!("index of '{id}' must be an integer"),
                })?),
                None => None,
            };
            sinks.push((index, specs.len(), id.clone()));
        }
        specs.push(TaskSpec {
            dot_id: id.clone(),
            kind,
            predecessors: preds.remove(id.as_str()).unwrap_or_default(),
        });
    }

    if !has_result && !specs.is_empty() {
        sinks.sort_by_key(|(index, pos, _)| (index.is_none(), *index, *pos));
        specs.push(TaskSpec {
            dot_id: IMPLICIT_RESULT_ID.to_string(),
            kind: TaskKind::Result,
            predecessors: sinks.into_iter().map(|(_, _, id)| id).collect(),
        });
    }

    Ok(specs)
}

fn task_kind(id: &str, attrs: &BTreeMap<String, String>) -> Result<TaskKind, GraphError> {
    let invalid = |reason: String| GraphError::InvalidTaskSpec {
        node: id.to_string(),
        reason,
    };
    let Some(ty) = attrs.get("type") else {
        return Err(invalid("missing 'type' attribute".to_string()));
    };

    let mut fields = Attrs {
        attrs,
        used: HashSet::from(["type", "index"]),
    };

    let kind = match ty.to_ascii_lowercase().as_str() {
        "http" => TaskKind::Http(HttpConfig {
            method: fields.optional(&["method"]).unwrap_or("GET").to_string(),
            url: fields.required(&["url"]).map_err(invalid)?.to_string(),
            body: fields.optional(&["body", "request_data", "requestData"]).map(str::to_string),
        }),
        "bridge" => TaskKind::Bridge(BridgeConfig {
            name: fields.required(&["name"]).map_err(invalid)?.to_string(),
            request_data: fields
                .optional(&["request_data", "requestData"])
                .map(str::to_string),
        }),
        "jsonparse" => TaskKind::JsonParse(JsonParseConfig {
            path: fields.required(&["path"]).map_err(invalid)?.to_string(),
            lax: fields.flag("lax").map_err(invalid)?,
        }),
        "multiply" => {
            let raw = fields.required(&["times"]).map_err(invalid)?;
            let times = Decimal::from_str(raw)
                .or_else(|_| Decimal::from_scientific(raw))
                .map_err(|_| invalid(format!("times '{raw}' is not a decimal")))?;
            TaskKind::Multiply(MultiplyConfig { times })
        }
        "median" => TaskKind::Median(MedianConfig {
            min_valid: fields.count(&["min_valid", "minValid"]).map_err(invalid)?,
            allowed_faults: fields
                .count(&["allowed_faults", "allowedFaults"])
                .map_err(invalid)?,
        }),
        "result" => TaskKind::Result,
        other => return Err(invalid(format!("unknown task type '{other}'"))),
    };

    if let Some(extra) = attrs.keys().find(|k| !fields.used.contains(k.as_str())) {
        return Err(invalid(format!("unknown attribute '{extra}' for {ty} task")));
    }
    Ok(kind)
}

struct Attrs<'a> {
    attrs: &'a BTreeMap<String, String>,
    used: HashSet<&'a str>,
}

impl<'a> Attrs<'a> {
    fn optional(&mut self, names: &[&'a str]) -> Option<&'a str> {
        let mut found = None;
        for name in names {
            if let Some((key, value)) = self.attrs.get_key_value(*name) {
                self.used.insert(key.as_str());
                found = found.or(Some(value.as_str()));
            }
        }
        found
    }

    fn required(&mut self, names: &[&'a str]) -> Result<&'a str, String> {
        self.optional(names)
            .ok_or_else(|| format!("missing '{}' attribute", names[0]))
    }

    fn flag(&mut self, name: &'a str) -> Result<bool, String> {
        match self.optional(&[name]) {
            None => Ok(false),
            Some(v) => v
                .parse::<bool>()
                .map_err(|_| format!("{name} must be true or false, got '{v}'")),
        }
    }

    fn count(&mut self, names: &[&'a str]) -> Result<Option<usize>, String> {
        self.optional(names)
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| format!("{} must be a non-negative integer, got '{v}'", names[0]))
            })
            .transpose()
    }
}
