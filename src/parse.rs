//! Statement classifier.
//!
//! The proxy only ever needs to recognize three query shapes: `SELECT` from
//! the virtual `system.local`/`system.peers` tables, `USE <keyspace>`, and
//! "everything else" (passed through raw). This is a hand-rolled tokenizer
//! plus a tiny recursive-descent selector parser, not a full CQL grammar.
//!
//! Contract: `classify(current_keyspace, query)` returns a handled flag, an
//! idempotency flag for pass-through routing, and a typed statement. A query
//! that targets a system table but fails to parse is reported as
//! `ErrorSelect` so the connection handler can surface the parse error
//! instead of forwarding a query the backend would also reject.

/// Classifier output. `handled` means the proxy answers the query locally;
/// `idempotent` only matters for pass-through statements (it gates retrying
/// on another host).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub handled: bool,
    pub idempotent: bool,
    pub statement: Statement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Select { table: String, selectors: Vec<Selector> },
    Use { keyspace: String },
    ErrorSelect { message: String },
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Star,
    Column(String),
    CountStar { display: String },
    Alias { inner: Box<Selector>, alias: String },
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Unquoted identifier or keyword, lowercased (CQL folds unquoted
    /// identifiers to lowercase).
    Ident(String),
    /// Double-quoted identifier, case preserved.
    QuotedIdent(String),
    /// Single-quoted string literal or a number; the classifier skips these.
    Literal,
    Star,
    Comma,
    Dot,
    LParen,
    RParen,
    Other(char),
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c.to_ascii_lowercase());
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c if c.is_ascii_digit() => {
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '.' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Literal);
            }
            '"' => {
                chars.next();
                let mut ident = String::new();
                for c in chars.by_ref() {
                    if c == '"' {
                        break;
                    }
                    ident.push(c);
                }
                tokens.push(Token::QuotedIdent(ident));
            }
            '\'' => {
                chars.next();
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                }
                tokens.push(Token::Literal);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ';' => {
                chars.next();
            }
            other => {
                chars.next();
                tokens.push(Token::Other(other));
            }
        }
    }

    tokens
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Identifier (quoted or not). Unquoted identifiers are already
    /// lowercased by the tokenizer.
    fn identifier(&mut self) -> Option<String> {
        match self.peek() {
            Some(Token::Ident(s)) => {
                let s = s.clone();
                self.pos += 1;
                Some(s)
            }
            Some(Token::QuotedIdent(s)) => {
                let s = s.clone();
                self.pos += 1;
                Some(s)
            }
            _ => None,
        }
    }
}

pub fn classify(keyspace: &str, query: &str) -> Classified {
    let tokens = tokenize(query);
    let mut p = Parser { tokens, pos: 0 };

    if p.keyword("use") {
        let statement = match p.identifier() {
            Some(ks) => Statement::Use { keyspace: ks },
            None => Statement::ErrorSelect {
                message: "expected keyspace name after USE".to_string(),
            },
        };
        return Classified {
            handled: true,
            idempotent: false,
            statement,
        };
    }

    if p.keyword("select") {
        return classify_select(p, keyspace);
    }

    Classified {
        handled: false,
        idempotent: false,
        statement: Statement::Passthrough,
    }
}

fn classify_select(mut p: Parser, keyspace: &str) -> Classified {
    // Decide system-ness from the FROM target before bothering with the
    // selector list: a parse error in a query headed for an ordinary table
    // is the backend's problem, not ours.
    let target = from_target(&p.tokens);
    let is_system = match &target {
        Some((Some(qualifier), _)) => qualifier == "system",
        Some((None, _)) => keyspace.eq_ignore_ascii_case("system"),
        None => false,
    };

    if !is_system {
        return Classified {
            handled: false,
            idempotent: true,
            statement: Statement::Passthrough,
        };
    }

    let table = target.map(|(_, t)| t).unwrap_or_default();
    let statement = match parse_selectors(&mut p) {
        Ok(selectors) => Statement::Select { table, selectors },
        Err(message) => Statement::ErrorSelect { message },
    };

    Classified {
        handled: true,
        idempotent: true,
        statement,
    }
}

/// Scan for the `FROM <qualifier.>table` target without parsing what comes
/// before it.
fn from_target(tokens: &[Token]) -> Option<(Option<String>, String)> {
    let mut i = 0;
    while i < tokens.len() {
        if matches!(&tokens[i], Token::Ident(s) if s == "from") {
            let first = ident_at(tokens, i + 1)?;
            if matches!(tokens.get(i + 2), Some(Token::Dot)) {
                let table = ident_at(tokens, i + 3)?;
                return Some((Some(first), table));
            }
            return Some((None, first));
        }
        i += 1;
    }
    None
}

fn ident_at(tokens: &[Token], i: usize) -> Option<String> {
    match tokens.get(i) {
        Some(Token::Ident(s)) => Some(s.clone()),
        Some(Token::QuotedIdent(s)) => Some(s.clone()),
        _ => None,
    }
}

fn parse_selectors(p: &mut Parser) -> Result<Vec<Selector>, String> {
    let mut selectors = Vec::new();
    loop {
        selectors.push(parse_selector(p)?);
        match p.peek() {
            Some(Token::Comma) => {
                p.pos += 1;
            }
            _ => break,
        }
    }
    if !p.keyword("from") {
        return Err("expected FROM after selectors".to_string());
    }
    Ok(selectors)
}

fn parse_selector(p: &mut Parser) -> Result<Selector, String> {
    let inner = match p.peek() {
        Some(Token::Star) => {
            p.pos += 1;
            Selector::Star
        }
        Some(Token::Ident(s)) if s == "count" && matches!(p.tokens.get(p.pos + 1), Some(Token::LParen)) => {
            p.pos += 2; // count (
            let arg = match p.next() {
                Some(Token::Star) => "*".to_string(),
                Some(Token::Ident(s)) => s.clone(),
                _ => return Err("expected column or * inside count()".to_string()),
            };
            if !matches!(p.next(), Some(Token::RParen)) {
                return Err("expected ) after count argument".to_string());
            }
            Selector::CountStar {
                display: format!("count({})", arg),
            }
        }
        Some(Token::Ident(_)) | Some(Token::QuotedIdent(_)) => {
            let name = p.identifier().unwrap_or_default();
            Selector::Column(name)
        }
        _ => return Err("unsupported selector".to_string()),
    };

    if p.keyword("as") {
        let alias = p
            .identifier()
            .ok_or_else(|| "expected alias after AS".to_string())?;
        return Ok(Selector::Alias {
            inner: Box::new(inner),
            alias,
        });
    }

    Ok(inner)
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(test)]
mod classify_props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // The classifier sits in front of every query a client sends; it
        // must never panic, whatever arrives.
        #[test]
        fn classify_never_panics(keyspace in ".{0,16}", query in ".{0,256}") {
            let _ = classify(&keyspace, &query);
        }

        #[test]
        fn non_select_non_use_is_never_handled(word in "[a-z]{1,10}") {
            prop_assume!(word != "use" && word != "select");
            let c = classify("", &format!("{} something", word));
            prop_assert!(!c.handled);
        }
    }
}
