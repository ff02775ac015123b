//! Tokenizer and parser for the s-expression language.
//!
//! ```text
//! expr        := atom | '(' head expr* ')'
//! atom        := symbol | number | string | placeholder
//! string      := "…" | '…'      (doubled-quote or backslash escape inside)
//! placeholder := '{' name ('.' attr)* '}' | '{}'
//! ```

use crate::error::{Error, Result};
use crate::expr::Expr;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Atom(Expr),
}

struct Scanner<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Scanner {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn error(&mut self, msg: impl Into<String>) -> Error {
        let pos = self.chars.peek().map(|(i, _)| *i).unwrap_or(self.src.len());
        Error::Parse(format!("{} at offset {pos} in {:?}", msg.into(), self.src))
    }

    fn tokens(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        while let Some(&(_, c)) = self.chars.peek() {
            match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '(' => {
                    self.chars.next();
                    out.push(Token::Open);
                }
                ')' => {
                    self.chars.next();
                    out.push(Token::Close);
                }
                '"' | '\'' => out.push(Token::Atom(Expr::Str(self.string(c)?))),
                '{' => out.push(Token::Atom(self.placeholder()?)),
                '}' => return Err(self.error("unmatched '}'")),
                _ => out.push(Token::Atom(self.word())),
            }
        }
        Ok(out)
    }

    fn string(&mut self, quote: char) -> Result<String> {
        self.chars.next(); // opening quote
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(self.error("unterminated string")),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, c)) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some((_, c)) if c == quote => {
                    // A doubled quote is an escaped quote, not the end.
                    if matches!(self.chars.peek(), Some(&(_, n)) if n == quote) {
                        self.chars.next();
                        out.push(quote);
                    } else {
                        return Ok(out);
                    }
                }
                Some((_, c)) => out.push(c),
            }
        }
    }

    fn placeholder(&mut self) -> Result<Expr> {
        self.chars.next(); // '{'
        let mut name = String::new();
        loop {
            match self.chars.next() {
                None => return Err(self.error("unterminated placeholder")),
                Some((_, '}')) => break,
                Some((_, c)) if c.is_whitespace() => {
                    return Err(self.error("whitespace in placeholder"))
                }
                Some((_, c)) => name.push(c),
            }
        }
        if name.is_empty() {
            return Ok(Expr::Placeholder(Vec::new()));
        }
        let path: Vec<String> = name.split('.').map(str::to_owned).collect();
        if path.iter().any(String::is_empty) {
            return Err(self.error(format!("malformed placeholder {{{name}}}")));
        }
        Ok(Expr::Placeholder(path))
    }

    fn word(&mut self) -> Expr {
        let mut word = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '{' | '}' | '"' | '\'') {
                break;
            }
            word.push(c);
            self.chars.next();
        }
        // Numbers are inlined as literals downstream; anything else is a
        // symbol (field path or head).
        if let Ok(i) = word.parse::<i64>() {
            Expr::Int(i)
        } else if let Ok(x) = word.parse::<f64>() {
            Expr::Float(x)
        } else {
            Expr::Sym(word)
        }
    }
}

/// Parse one expression; trailing tokens are an error.
pub fn parse(src: &str) -> Result<Expr> {
    let tokens = Scanner::new(src).tokens()?;
    let mut pos = 0;
    let expr = parse_at(src, &tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(Error::Parse(format!("trailing input in {src:?}")));
    }
    Ok(expr)
}

fn parse_at(src: &str, tokens: &[Token], pos: &mut usize) -> Result<Expr> {
    match tokens.get(*pos) {
        None => Err(Error::Parse(format!("empty expression in {src:?}"))),
        Some(Token::Close) => Err(Error::Parse(format!("unbalanced ')' in {src:?}"))),
        Some(Token::Atom(a)) => {
            *pos += 1;
            Ok(a.clone())
        }
        Some(Token::Open) => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    None => return Err(Error::Parse(format!("unbalanced '(' in {src:?}"))),
                    Some(Token::Close) => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => items.push(parse_at(src, tokens, pos)?),
                }
            }
            if items.is_empty() {
                return Err(Error::Parse(format!("empty form in {src:?}")));
            }
            if items[0].as_sym().is_none() {
                return Err(Error::Parse(format!("form head must be a symbol in {src:?}")));
            }
            Ok(Expr::List(items))
        }
    }
}
