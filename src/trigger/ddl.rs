//! Lightweight CREATE TABLE reader
//!
//! Understands just enough DDL to find a table's name and primary key:
//! statement boundaries, quoting in all four dialects, comments, and the
//! column / constraint list.

use std::fmt;

/// Why a DDL fragment produced no trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotCreateTable,
    Malformed(String),
    NoPrimaryKey,
    UnsupportedIdentifier(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotCreateTable => write!(f, "not a CREATE TABLE statement"),
            SkipReason::Malformed(detail) => write!(f, "malformed CREATE TABLE: {}", detail),
            SkipReason::NoPrimaryKey => write!(f, "no primary key"),
            SkipReason::UnsupportedIdentifier(name) => write!(f, "unsupported identifier: {}", name),
        }
    }
}

/// Table name and primary key columns, in key order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub primary_key: Vec<String>,
}

/// Split a script on `;`, ignoring semicolons inside quotes.
///
/// Comments are dropped from the returned statements; blank statements are
/// not returned.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(close) = quote {
            current.push(c);
            if c == close {
                if chars.peek() == Some(&close) {
                    // doubled quote is an escaped quote
                    current.push(close);
                    chars.next();
                } else {
                    quote = None;
                }
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '[' => {
                quote = Some(']');
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                while chars.next_if(|n| *n != '\n').is_some() {}
                current.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                current.push(' ');
            }
            ';' => flush(&mut statements, &mut current),
            _ => current.push(c),
        }
    }
    flush(&mut statements, &mut current);

    statements
}

fn flush(statements: &mut Vec<String>, current: &mut String) {
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    current.clear();
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Literal,
    Symbol(char),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn identifier(&self) -> Option<String> {
        match self {
            Token::Word(w) | Token::Quoted(w) => Some(w.clone()),
            _ => None,
        }
    }
}

fn tokenize(stmt: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = stmt.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '\'' => {
                read_quoted(&mut chars, '\'')?;
                tokens.push(Token::Literal);
            }
            '"' | '`' => tokens.push(Token::Quoted(read_quoted(&mut chars, c)?)),
            '[' => tokens.push(Token::Quoted(read_quoted(&mut chars, ']')?)),
            c if c.is_alphanumeric() || c == '_' || c == '$' => {
                let mut word = String::from(c);
                while let Some(n) = chars.next_if(|n| n.is_alphanumeric() || *n == '_' || *n == '$') {
                    word.push(n);
                }
                tokens.push(Token::Word(word));
            }
            other => tokens.push(Token::Symbol(other)),
        }
    }

    Ok(tokens)
}

fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, close: char) -> Result<String, String> {
    let mut text = String::new();
    loop {
        match chars.next() {
            Some(c) if c == close => {
                if chars.next_if_eq(&close).is_some() {
                    text.push(close);
                } else {
                    return Ok(text);
                }
            }
            Some(c) => text.push(c),
            None => return Err(format!("unterminated {} quote", close)),
        }
    }
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.tokens.get(self.pos).is_some_and(|t| t.is_keyword(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.tokens.get(self.pos) == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn identifier(&mut self) -> Option<String> {
        let name = self.tokens.get(self.pos)?.identifier()?;
        self.pos += 1;
        Some(name)
    }

    /// Comma-separated elements up to the `)` closing an already consumed `(`
    fn elements(&mut self) -> Result<Vec<&'a [Token]>, SkipReason> {
        let mut elements = Vec::new();
        let mut depth = 1;
        let mut start = self.pos;

        loop {
            let index = self.pos;
            match self.next() {
                None => return Err(SkipReason::Malformed("unbalanced parentheses".into())),
                Some(Token::Symbol('(')) => depth += 1,
                Some(Token::Symbol(')')) => {
                    depth -= 1;
                    if depth == 0 {
                        if index > start {
                            elements.push(&self.tokens[start..index]);
                        }
                        return Ok(elements);
                    }
                }
                Some(Token::Symbol(',')) if depth == 1 => {
                    if index > start {
                        elements.push(&self.tokens[start..index]);
                    }
                    start = index + 1;
                }
                Some(_) => {}
            }
        }
    }
}

const NON_COLUMN_KEYWORDS: [&str; 9] = [
    "UNIQUE", "KEY", "INDEX", "FOREIGN", "CHECK", "FULLTEXT", "SPATIAL", "EXCLUDE", "PERIOD",
];

enum Element {
    Column { name: String, primary_key: bool },
    PrimaryKey(Vec<String>),
    Other,
}

fn classify(tokens: &[Token]) -> Element {
    let mut tokens = tokens;
    if tokens.first().is_some_and(|t| t.is_keyword("CONSTRAINT")) {
        tokens = tokens.get(2..).unwrap_or_default();
    }

    let Some(first) = tokens.first() else {
        return Element::Other;
    };

    if first.is_keyword("PRIMARY") && tokens.get(1).is_some_and(|t| t.is_keyword("KEY")) {
        return Element::PrimaryKey(key_columns(&tokens[2..]));
    }
    if NON_COLUMN_KEYWORDS.iter().any(|kw| first.is_keyword(kw)) {
        return Element::Other;
    }

    let Some(name) = first.identifier() else {
        return Element::Other;
    };

    let mut depth = 0;
    let mut primary_key = false;
    for pair in tokens[1..].windows(2) {
        match &pair[0] {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => depth -= 1,
            t if depth == 0 && t.is_keyword("PRIMARY") && pair[1].is_keyword("KEY") => primary_key = true,
            _ => {}
        }
    }

    Element::Column { name, primary_key }
}

/// First identifier of each entry in `( a, b(10) ASC, ... )`
fn key_columns(tokens: &[Token]) -> Vec<String> {
    let Some(open) = tokens.iter().position(|t| *t == Token::Symbol('(')) else {
        return Vec::new();
    };

    let mut columns = Vec::new();
    let mut depth = 0;
    let mut expecting = true;
    for token in &tokens[open..] {
        match token {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Token::Symbol(',') if depth == 1 => expecting = true,
            t if depth == 1 && expecting => {
                if let Some(name) = t.identifier() {
                    columns.push(name);
                }
                expecting = false;
            }
            _ => {}
        }
    }
    columns
}

/// Read the table name and primary key of a CREATE TABLE statement
pub fn parse_create_table(stmt: &str) -> Result<TableDef, SkipReason> {
    let tokens = tokenize(stmt).map_err(SkipReason::Malformed)?;
    let mut cur = Cursor::new(&tokens);

    if !cur.eat_keyword("CREATE") {
        return Err(SkipReason::NotCreateTable);
    }
    if cur.eat_keyword("OR") && !cur.eat_keyword("REPLACE") {
        return Err(SkipReason::NotCreateTable);
    }
    let _ = cur.eat_keyword("GLOBAL") || cur.eat_keyword("LOCAL");
    let _ = cur.eat_keyword("TEMPORARY") || cur.eat_keyword("TEMP");
    if !cur.eat_keyword("TABLE") {
        return Err(SkipReason::NotCreateTable);
    }
    if cur.eat_keyword("IF") && !(cur.eat_keyword("NOT") && cur.eat_keyword("EXISTS")) {
        return Err(SkipReason::Malformed("incomplete IF NOT EXISTS".into()));
    }

    let mut name = cur
        .identifier()
        .ok_or_else(|| SkipReason::Malformed("missing table name".into()))?;
    while cur.eat_symbol('.') {
        name = cur
            .identifier()
            .ok_or_else(|| SkipReason::Malformed("missing name after '.'".into()))?;
    }

    if !cur.eat_symbol('(') {
        return Err(SkipReason::Malformed(format!("no column list for {}", name)));
    }

    let mut inline = None;
    let mut table_level = None;
    for element in cur.elements()? {
        match classify(element) {
            Element::Column { name, primary_key: true } if inline.is_none() => inline = Some(name),
            Element::PrimaryKey(columns) if table_level.is_none() && !columns.is_empty() => {
                table_level = Some(columns)
            }
            _ => {}
        }
    }

    let primary_key = match (inline, table_level) {
        (Some(column), _) => vec![column],
        (None, Some(columns)) => columns,
        (None, None) => Vec::new(),
    };

    Ok(TableDef { name, primary_key })
}
