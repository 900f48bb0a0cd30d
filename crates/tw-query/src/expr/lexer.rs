//! Tokenizer for run/metric expressions.

use super::ast::Pos;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    And,
    Or,
    Not,
    In,
    Is,
    True,
    False,
    None,
    EqEq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Eof,
}

impl Tok {
    pub fn describe(&self) -> String {
        match self {
            Tok::Name(n) => format!("name '{}'", n),
            Tok::Int(i) => format!("number {}", i),
            Tok::Float(f) => format!("number {}", f),
            Tok::Str(s) => format!("string {:?}", s),
            Tok::Eof => "end of input".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Tok::And => "and",
            Tok::Or => "or",
            Tok::Not => "not",
            Tok::In => "in",
            Tok::Is => "is",
            Tok::True => "True",
            Tok::False => "False",
            Tok::None => "None",
            Tok::EqEq => "==",
            Tok::NotEq => "!=",
            Tok::Lt => "<",
            Tok::LtE => "<=",
            Tok::Gt => ">",
            Tok::GtE => ">=",
            Tok::Minus => "-",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::Comma => ",",
            Tok::Dot => ".",
            _ => "?",
        }
    }
}

/// A lexing failure: message and where it happened.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub pos: Pos,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
        }
    }

    fn error(&self, pos: Pos, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            pos,
        }
    }

    fn number(&mut self, start: Pos) -> Result<Tok, LexError> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.bump();
                if c != '_' {
                    text.push(c);
                }
            } else if c == '.' && !is_float {
                // `1.5` is a float; `1.x` is not ours to handle.
                let mut ahead = self.chars.clone();
                ahead.next();
                if ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    is_float = true;
                    self.bump();
                    text.push('.');
                } else {
                    break;
                }
            } else if c == 'e' || c == 'E' {
                is_float = true;
                self.bump();
                text.push('e');
                if let Some(sign) = self.peek().filter(|s| *s == '+' || *s == '-') {
                    self.bump();
                    text.push(sign);
                }
            } else {
                break;
            }
        }
        if is_float {
            match text.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Tok::Float(f)),
                Ok(_) => Err(self.error(start, format!("number '{}' out of range", text))),
                Err(_) => Err(self.error(start, format!("invalid number '{}'", text))),
            }
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error(start, format!("integer '{}' out of range", text)))
        }
    }

    fn string(&mut self, quote: char, start: Pos) -> Result<Tok, LexError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(start, "unterminated string literal")),
                Some(c) if c == quote => return Ok(Tok::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => return Err(self.error(start, "unterminated string literal")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn name(&mut self, first: char) -> Tok {
        let mut text = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match text.as_str() {
            "and" => Tok::And,
            "or" => Tok::Or,
            "not" => Tok::Not,
            "in" => Tok::In,
            "is" => Tok::Is,
            "True" => Tok::True,
            "False" => Tok::False,
            "None" => Tok::None,
            _ => Tok::Name(text),
        }
    }
}

/// Split `text` into tokens, each tagged with its starting position.
/// The last token is always [`Tok::Eof`].
pub fn tokenize(text: &str) -> Result<Vec<(Tok, Pos)>, LexError> {
    let mut lx = Lexer {
        chars: text.chars().peekable(),
        line: 1,
        col: 1,
    };
    let mut out = Vec::new();

    loop {
        while lx.peek().is_some_and(char::is_whitespace) {
            lx.bump();
        }
        let start = lx.pos();
        let Some(c) = lx.peek() else {
            out.push((Tok::Eof, start));
            return Ok(out);
        };

        let tok = if c.is_ascii_digit() {
            lx.number(start)?
        } else if c == '.' {
            lx.bump();
            Tok::Dot
        } else if c == '\'' || c == '"' {
            lx.bump();
            lx.string(c, start)?
        } else if c.is_alphabetic() || c == '_' {
            lx.bump();
            lx.name(c)
        } else {
            lx.bump();
            match c {
                '(' => Tok::LParen,
                ')' => Tok::RParen,
                '[' => Tok::LBracket,
                ']' => Tok::RBracket,
                ',' => Tok::Comma,
                '-' => Tok::Minus,
                '=' if lx.peek() == Some('=') => {
                    lx.bump();
                    Tok::EqEq
                }
                '!' if lx.peek() == Some('=') => {
                    lx.bump();
                    Tok::NotEq
                }
                '<' if lx.peek() == Some('=') => {
                    lx.bump();
                    Tok::LtE
                }
                '>' if lx.peek() == Some('=') => {
                    lx.bump();
                    Tok::GtE
                }
                '<' => Tok::Lt,
                '>' => Tok::Gt,
                '=' => return Err(lx.error(start, "'=' is not a comparison, use '=='")),
                other => return Err(lx.error(start, format!("unexpected character '{}'", other))),
            }
        };
        out.push((tok, start));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(text: &str) -> Vec<Tok> {
        tokenize(text).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_operators_and_keywords() {
        assert_eq!(
            toks("a.b >= 1 and not c"),
            vec![
                Tok::Name("a".into()),
                Tok::Dot,
                Tok::Name("b".into()),
                Tok::GtE,
                Tok::Int(1),
                Tok::And,
                Tok::Not,
                Tok::Name("c".into()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            toks("1.5 2e3 10_000"),
            vec![
                Tok::Float(1.5),
                Tok::Float(2000.0),
                Tok::Int(10_000),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            toks(r#"'it\'s' "a\"b""#),
            vec![
                Tok::Str("it's".into()),
                Tok::Str("a\"b".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_positions_track_lines() {
        let t = tokenize("a\n  == b").unwrap();
        assert_eq!(t[1].1, Pos { line: 2, col: 3 });
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("run.name == 'abc").unwrap_err();
        assert_eq!(err.pos, Pos { line: 1, col: 13 });
    }

    #[test]
    fn test_single_equals_rejected() {
        let err = tokenize("a = 1").unwrap_err();
        assert!(err.message.contains("=="));
    }
}
