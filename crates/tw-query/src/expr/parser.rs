//! # Expression Parser
//!
//! Recursive descent over the token stream, producing an [`Expr`].
//!
//! ```text
//! expr       := or
//! or         := and ('or' and)*
//! and        := not ('and' not)*
//! not        := 'not' not | comparison
//! comparison := unary (cmp_op unary)*
//! cmp_op     := '==' | '!=' | '<' | '<=' | '>' | '>=' | 'in' | 'not' 'in' | 'is' | 'is' 'not'
//! unary      := '-' unary | postfix
//! postfix    := primary ('.' NAME | '(' args ')' | '[' expr ']')*
//! primary    := NAME | NUMBER | STRING+ | True | False | None
//!             | '[' [expr (',' expr)* [',']] ']' | '(' expr [',' ...] ')'
//! ```
//!
//! A parenthesised group containing a comma is a list literal, so
//! `run.status in ('A', 'B')` reads the same as the bracketed form.
//!
//! Nesting through brackets, parentheses, `not` and unary `-` is capped at
//! [`MAX_DEPTH`] levels; deeper input is a syntax error.

use super::ast::{BoolOp, CmpOp, Expr, ExprKind, Literal, Pos};
use super::lexer::{tokenize, Tok};
use crate::error::{Location, QueryError, Result};

pub const MAX_DEPTH: usize = 128;

/// Parse expression text into a syntax tree.
pub fn parse(text: &str) -> Result<Expr> {
    let tokens = tokenize(text).map_err(|e| syntax_error(text, e.pos, e.message))?;
    let mut parser = Parser {
        text,
        tokens,
        idx: 0,
        depth: 0,
    };
    let expr = parser.parse_expr()?;
    match parser.peek() {
        Tok::Eof => Ok(expr),
        other => {
            let msg = format!("unexpected {}", other.describe());
            Err(parser.error_here(msg))
        }
    }
}

fn syntax_error(text: &str, pos: Pos, message: impl Into<String>) -> QueryError {
    QueryError::Syntax {
        location: Location {
            statement: text.to_string(),
            line: pos.line,
            offset: pos.col,
        },
        message: message.into(),
    }
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(Tok, Pos)>,
    idx: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        // `tokenize` always ends with Eof, and we never advance past it.
        &self.tokens[self.idx.min(self.tokens.len() - 1)].0
    }

    fn peek_at(&self, n: usize) -> &Tok {
        &self.tokens[(self.idx + n).min(self.tokens.len() - 1)].0
    }

    fn pos(&self) -> Pos {
        self.tokens[self.idx.min(self.tokens.len() - 1)].1
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if !matches!(tok, Tok::Eof) {
            self.idx += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        if self.eat(&tok) {
            Ok(())
        } else {
            let msg = format!("expected {}, found {}", what, self.peek().describe());
            Err(self.error_here(msg))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> QueryError {
        syntax_error(self.text, self.pos(), message)
    }

    /// Run one nested production, failing once [`MAX_DEPTH`] is reached.
    fn nested<T>(&mut self, inner: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_DEPTH {
            let msg = format!("expression nested deeper than {} levels", MAX_DEPTH);
            return Err(self.error_here(msg));
        }
        self.depth += 1;
        let out = inner(self);
        self.depth -= 1;
        out
    }

    // ===== Boolean layers =====

    fn parse_expr(&mut self) -> Result<Expr> {
        self.nested(|p| p.parse_bool(BoolOp::Or))
    }

    fn parse_bool(&mut self, op: BoolOp) -> Result<Expr> {
        let (tok, next): (Tok, fn(&mut Self) -> Result<Expr>) = match op {
            BoolOp::Or => (Tok::Or, |p| p.parse_bool(BoolOp::And)),
            BoolOp::And => (Tok::And, Self::parse_not),
        };
        let first = next(self)?;
        if self.peek() != &tok {
            return Ok(first);
        }
        let pos = first.pos;
        let mut operands = vec![first];
        while self.eat(&tok) {
            operands.push(next(self)?);
        }
        Ok(Expr::new(ExprKind::BoolOp { op, operands }, pos))
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == &Tok::Not {
            let pos = self.pos();
            self.advance();
            let operand = self.nested(Self::parse_not)?;
            return Ok(Expr::new(ExprKind::UnaryNot(Box::new(operand)), pos));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_unary()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push(op);
            comparators.push(self.parse_unary()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let pos = left.pos;
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
                comparators,
            },
            pos,
        ))
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Tok::EqEq => CmpOp::Eq,
            Tok::NotEq => CmpOp::NotEq,
            Tok::Lt => CmpOp::Lt,
            Tok::LtE => CmpOp::LtE,
            Tok::Gt => CmpOp::Gt,
            Tok::GtE => CmpOp::GtE,
            Tok::In => CmpOp::In,
            Tok::Not if self.peek_at(1) == &Tok::In => {
                self.advance();
                CmpOp::NotIn
            }
            Tok::Is if self.peek_at(1) == &Tok::Not => {
                self.advance();
                CmpOp::IsNot
            }
            Tok::Is => CmpOp::Is,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    // ===== Operands =====

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() != &Tok::Minus {
            return self.parse_postfix();
        }
        let pos = self.pos();
        self.advance();
        let operand = self.nested(Self::parse_unary)?;
        let kind = match operand.kind {
            ExprKind::Literal(Literal::Int(i)) => match i.checked_neg() {
                Some(n) => ExprKind::Literal(Literal::Int(n)),
                None => return Err(syntax_error(self.text, pos, "integer out of range")),
            },
            ExprKind::Literal(Literal::Float(f)) => ExprKind::Literal(Literal::Float(-f)),
            _ => {
                return Err(syntax_error(
                    self.text,
                    pos,
                    "unary '-' only applies to numeric literals",
                ))
            }
        };
        Ok(Expr::new(kind, pos))
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let attr = match self.advance() {
                        Tok::Name(n) => n,
                        // Keywords are valid attribute names: `run.tags.is`.
                        Tok::In => "in".to_string(),
                        Tok::Is => "is".to_string(),
                        other => {
                            let msg =
                                format!("expected attribute name, found {}", other.describe());
                            return Err(self.error_here(msg));
                        }
                    };
                    let pos = expr.pos;
                    expr = Expr::new(
                        ExprKind::Attribute {
                            target: Box::new(expr),
                            attr,
                        },
                        pos,
                    );
                }
                Tok::LParen => {
                    self.advance();
                    let args = self.parse_sequence(Tok::RParen, ")")?;
                    let pos = expr.pos;
                    expr = Expr::new(
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                        },
                        pos,
                    );
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Tok::RBracket, "']'")?;
                    let pos = expr.pos;
                    expr = Expr::new(
                        ExprKind::Subscript {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                        pos,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Comma-separated expressions up to `close`, trailing comma allowed.
    fn parse_sequence(&mut self, close: Tok, what: &str) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if self.eat(&close) {
                return Ok(items);
            }
            items.push(self.parse_expr()?);
            if !self.eat(&Tok::Comma) {
                self.expect(close, &format!("',' or '{}'", what))?;
                return Ok(items);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let pos = self.pos();
        let kind = match self.advance() {
            Tok::Name(n) => ExprKind::Name(n),
            Tok::Int(i) => ExprKind::Literal(Literal::Int(i)),
            Tok::Float(f) => ExprKind::Literal(Literal::Float(f)),
            Tok::Str(s) => {
                // Adjacent string literals concatenate.
                let mut s = s;
                while let Tok::Str(next) = self.peek() {
                    s.push_str(next);
                    self.advance();
                }
                ExprKind::Literal(Literal::Str(s))
            }
            Tok::True => ExprKind::Literal(Literal::Bool(true)),
            Tok::False => ExprKind::Literal(Literal::Bool(false)),
            Tok::None => ExprKind::Literal(Literal::None),
            Tok::LBracket => ExprKind::ListLiteral(self.parse_sequence(Tok::RBracket, "]")?),
            Tok::LParen => {
                if self.eat(&Tok::RParen) {
                    ExprKind::ListLiteral(Vec::new())
                } else {
                    let first = self.parse_expr()?;
                    if self.eat(&Tok::RParen) {
                        return Ok(first);
                    }
                    self.expect(Tok::Comma, "',' or ')'")?;
                    let mut items = vec![first];
                    items.extend(self.parse_sequence(Tok::RParen, ")")?);
                    ExprKind::ListLiteral(items)
                }
            }
            Tok::Eof => return Err(syntax_error(self.text, pos, "unexpected end of input")),
            other => {
                return Err(syntax_error(
                    self.text,
                    pos,
                    format!("unexpected {}", other.describe()),
                ))
            }
        };
        Ok(Expr::new(kind, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_chained_comparison_shape() {
        let expr = parse("1 < run.duration <= 10").unwrap();
        match expr.kind {
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => {
                assert_eq!(left.kind, ExprKind::Literal(Literal::Int(1)));
                assert_eq!(ops, vec![CmpOp::Lt, CmpOp::LtE]);
                assert_eq!(comparators.len(), 2);
                assert_eq!(comparators[0].dotted_name().as_deref(), Some("run.duration"));
            }
            other => panic!("expected compare, got {:?}", other),
        }
    }

    #[test]
    fn test_bool_ops_are_n_ary_with_precedence() {
        let expr = parse("a == 1 and b == 2 and c == 3 or d == 4").unwrap();
        let ExprKind::BoolOp { op, operands } = expr.kind else {
            panic!("expected bool op");
        };
        assert_eq!(op, BoolOp::Or);
        assert_eq!(operands.len(), 2);
        match &operands[0].kind {
            ExprKind::BoolOp { op, operands } => {
                assert_eq!(*op, BoolOp::And);
                assert_eq!(operands.len(), 3);
            }
            other => panic!("expected and, got {:?}", other),
        }
    }

    #[test]
    fn test_not_in_and_is_not() {
        let expr = parse("'x' not in run.name").unwrap();
        let ExprKind::Compare { ops, .. } = expr.kind else {
            panic!("expected compare");
        };
        assert_eq!(ops, vec![CmpOp::NotIn]);

        let expr = parse("run.tags.team is not None").unwrap();
        let ExprKind::Compare { ops, .. } = expr.kind else {
            panic!("expected compare");
        };
        assert_eq!(ops, vec![CmpOp::IsNot]);
    }

    #[test]
    fn test_unary_not_binds_looser_than_comparison() {
        let expr = parse("not run.status == 'FAILED'").unwrap();
        let ExprKind::UnaryNot(inner) = expr.kind else {
            panic!("expected not");
        };
        assert!(matches!(inner.kind, ExprKind::Compare { .. }));
    }

    #[test]
    fn test_calls_subscripts_and_lists() {
        let expr = parse("run.metrics['loss'].last < datetime(2024, 1, 2)").unwrap();
        let ExprKind::Compare {
            left, comparators, ..
        } = expr.kind
        else {
            panic!("expected compare");
        };
        assert!(matches!(left.kind, ExprKind::Attribute { ref attr, .. } if attr == "last"));
        assert!(matches!(comparators[0].kind, ExprKind::Call { ref args, .. } if args.len() == 3));

        let expr = parse("run.status in ('A', 'B',)").unwrap();
        let ExprKind::Compare { comparators, .. } = expr.kind else {
            panic!("expected compare");
        };
        assert!(matches!(comparators[0].kind, ExprKind::ListLiteral(ref items) if items.len() == 2));
    }

    #[test]
    fn test_negative_literal_folds() {
        let expr = parse("-5").unwrap();
        assert_eq!(expr.kind, ExprKind::Literal(Literal::Int(-5)));
        let err = parse("-run.duration").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
    }

    #[test]
    fn test_syntax_error_location() {
        let err = parse("run.name == 'a' and").unwrap_err();
        let loc = err.location().unwrap();
        assert_eq!(loc.statement, "run.name == 'a' and");
        assert_eq!((loc.line, loc.offset), (1, 20));

        let err = parse("run.name == 'a')").unwrap_err();
        assert_eq!(err.location().unwrap().offset, 16);
    }

    #[test]
    fn test_parenthesised_expression_is_not_a_list() {
        let expr = parse("(run.active)").unwrap();
        assert!(matches!(expr.kind, ExprKind::Attribute { .. }));
    }

    #[test]
    fn test_nesting_depth_is_limited() {
        let deep = format!("{}run.hash == 'x'{}", "(".repeat(5_000), ")".repeat(5_000));
        let err = parse(&deep).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.to_string().contains("nested deeper than 128"));
        assert_eq!(err.location().unwrap().line, 1);

        for deep in [
            "not ".repeat(5_000),
            "[".repeat(5_000),
            format!("{}1", "-".repeat(5_000)),
        ] {
            assert_eq!(parse(&deep).unwrap_err().kind(), ErrorKind::Syntax);
        }

        let shallow = format!("{}run.hash == 'x'{}", "(".repeat(100), ")".repeat(100));
        assert!(parse(&shallow).is_ok());
    }
}
