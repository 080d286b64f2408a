//! Recursive-descent parser for the built-in script language.
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparisons, `+ -`,
//! `* / // %`, unary `-`, then calls, indexing and attribute access.

use super::lexer::{tokenize, Sym, Tok, Token};
use super::ScriptError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Value),
    Name(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Attr(Box<Expr>, String),
    Call(Box<Expr>, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Index(String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `op` is `None` for plain `=`, else the operator of `+=` / `-=`.
    Assign {
        target: Target,
        op: Option<BinOp>,
        value: Expr,
    },
    Del(Target),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

/// Parse a block of statements.
pub fn parse_program(src: &str) -> Result<Vec<Stmt>, ScriptError> {
    let mut parser = Parser::new(tokenize(src)?);
    let mut stmts = Vec::new();
    loop {
        parser.skip_ends();
        if parser.at(&Tok::Eof) {
            return Ok(stmts);
        }
        stmts.push(parser.statement()?);
        if !parser.at(&Tok::Eof) {
            parser.expect_end()?;
        }
    }
}

/// Parse a single expression, surrounding blank lines allowed.
pub fn parse_expression(src: &str) -> Result<Expr, ScriptError> {
    let mut parser = Parser::new(tokenize(src)?);
    parser.skip_ends();
    let expr = parser.expression()?;
    parser.skip_ends();
    if !parser.at(&Tok::Eof) {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

/// Deepest expression tree the parser builds. Evaluation recurses over the
/// tree on a blocking thread with a small stack.
const MAX_NESTING: usize = 200;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Go one level deeper in the tree being built.
    fn nest(&mut self) -> Result<(), ScriptError> {
        if self.depth >= MAX_NESTING {
            return Err(ScriptError::syntax("expression nested too deeply", self.line()));
        }
        self.depth += 1;
        Ok(())
    }

    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_sym(&self, sym: Sym) -> bool {
        matches!(self.peek(), Tok::Sym(s) if *s == sym)
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Tok::Ident(w) if w == word)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat_sym(&mut self, sym: Sym) -> bool {
        if self.at_sym(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: Sym) -> Result<(), ScriptError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_end(&mut self) -> Result<(), ScriptError> {
        if self.at(&Tok::End) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn skip_ends(&mut self) {
        while self.at(&Tok::End) {
            self.pos += 1;
        }
    }

    fn unexpected(&self) -> ScriptError {
        let what = match self.peek() {
            Tok::Eof => "end of input".to_string(),
            Tok::End => "end of statement".to_string(),
            Tok::Int(i) => i.to_string(),
            Tok::Float(f) => f.to_string(),
            Tok::Str(s) => format!("{:?}", s),
            Tok::Ident(w) => w.clone(),
            Tok::Sym(s) => format!("{:?}", s),
        };
        ScriptError::syntax(format!("unexpected {}", what), self.line())
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        if self.at_keyword("del") {
            self.advance();
            let target = self.expression()?;
            let target = to_target(target, line)?;
            return Ok(Stmt {
                kind: StmtKind::Del(target),
                line,
            });
        }

        let expr = self.expression()?;
        let op = match self.peek() {
            Tok::Sym(Sym::Assign) => Some(None),
            Tok::Sym(Sym::PlusAssign) => Some(Some(BinOp::Add)),
            Tok::Sym(Sym::MinusAssign) => Some(Some(BinOp::Sub)),
            _ => None,
        };
        let kind = match op {
            Some(op) => {
                self.advance();
                let target = to_target(expr, line)?;
                let value = self.expression()?;
                StmtKind::Assign { target, op, value }
            }
            None => StmtKind::Expr(expr),
        };
        Ok(Stmt { kind, line })
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and_expr()?;
        let mut chained = 0;
        while self.at_keyword("or") {
            self.advance();
            self.nest()?;
            chained += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.not_expr()?;
        let mut chained = 0;
        while self.at_keyword("and") {
            self.advance();
            self.nest()?;
            chained += 1;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ScriptError> {
        if self.at_keyword("not") {
            self.advance();
            self.nest()?;
            let inner = self.not_expr()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.additive()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Tok::Sym(Sym::Eq) => BinOp::Eq,
                Tok::Sym(Sym::Ne) => BinOp::Ne,
                Tok::Sym(Sym::Lt) => BinOp::Lt,
                Tok::Sym(Sym::Le) => BinOp::Le,
                Tok::Sym(Sym::Gt) => BinOp::Gt,
                Tok::Sym(Sym::Ge) => BinOp::Ge,
                _ => {
                    self.depth -= chained;
                    return Ok(left);
                }
            };
            self.advance();
            self.nest()?;
            chained += 1;
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.multiplicative()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Tok::Sym(Sym::Plus) => BinOp::Add,
                Tok::Sym(Sym::Minus) => BinOp::Sub,
                _ => {
                    self.depth -= chained;
                    return Ok(left);
                }
            };
            self.advance();
            self.nest()?;
            chained += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.unary()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Tok::Sym(Sym::Star) => BinOp::Mul,
                Tok::Sym(Sym::Slash) => BinOp::Div,
                Tok::Sym(Sym::SlashSlash) => BinOp::FloorDiv,
                Tok::Sym(Sym::Percent) => BinOp::Mod,
                _ => {
                    self.depth -= chained;
                    return Ok(left);
                }
            };
            self.advance();
            self.nest()?;
            chained += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_sym(Sym::Minus) {
            self.nest()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        if self.eat_sym(Sym::Plus) {
            self.nest()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(inner);
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.atom()?;
        let mut chained = 0;
        loop {
            if self.at_sym(Sym::LParen) || self.at_sym(Sym::LBracket) || self.at_sym(Sym::Dot) {
                self.nest()?;
                chained += 1;
            }
            if self.eat_sym(Sym::LParen) {
                let args = self.comma_list(Sym::RParen)?;
                expr = Expr::Call(Box::new(expr), args);
            } else if self.eat_sym(Sym::LBracket) {
                let index = self.expression()?;
                self.expect_sym(Sym::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_sym(Sym::Dot) {
                match self.advance() {
                    Tok::Ident(name) => expr = Expr::Attr(Box::new(expr), name),
                    _ => {
                        self.pos -= 1;
                        return Err(self.unexpected());
                    }
                }
            } else {
                self.depth -= chained;
                return Ok(expr);
            }
        }
    }

    fn comma_list(&mut self, close: Sym) -> Result<Vec<Expr>, ScriptError> {
        let mut items = Vec::new();
        while !self.eat_sym(close) {
            items.push(self.expression()?);
            if !self.eat_sym(Sym::Comma) {
                self.expect_sym(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn atom(&mut self) -> Result<Expr, ScriptError> {
        if self.at_sym(Sym::LParen) || self.at_sym(Sym::LBracket) || self.at_sym(Sym::LBrace) {
            self.nest()?;
            let expr = self.grouping()?;
            self.depth -= 1;
            return Ok(expr);
        }
        match self.advance() {
            Tok::Int(i) => Ok(Expr::Lit(Value::Int(i))),
            Tok::Float(f) => Ok(Expr::Lit(Value::Float(f))),
            Tok::Str(s) => Ok(Expr::Lit(Value::Str(s))),
            Tok::Ident(word) => Ok(match word.as_str() {
                "true" | "True" => Expr::Lit(Value::Bool(true)),
                "false" | "False" => Expr::Lit(Value::Bool(false)),
                "null" | "None" => Expr::Lit(Value::Null),
                "and" | "or" | "not" | "del" => {
                    self.pos -= 1;
                    return Err(self.unexpected());
                }
                _ => Expr::Name(word),
            }),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected())
            }
        }
    }

    /// `( expr )`, `[ list ]` or `{ map }`.
    fn grouping(&mut self) -> Result<Expr, ScriptError> {
        match self.advance() {
            Tok::Sym(Sym::LParen) => {
                let inner = self.expression()?;
                self.expect_sym(Sym::RParen)?;
                Ok(inner)
            }
            Tok::Sym(Sym::LBracket) => Ok(Expr::List(self.comma_list(Sym::RBracket)?)),
            Tok::Sym(Sym::LBrace) => {
                let mut entries = Vec::new();
                while !self.eat_sym(Sym::RBrace) {
                    let key = self.expression()?;
                    self.expect_sym(Sym::Colon)?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat_sym(Sym::Comma) {
                        self.expect_sym(Sym::RBrace)?;
                        break;
                    }
                }
                Ok(Expr::Map(entries))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected())
            }
        }
    }
}

fn to_target(expr: Expr, line: usize) -> Result<Target, ScriptError> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Index(base, index) => match *base {
            Expr::Name(name) => Ok(Target::Index(name, *index)),
            _ => Err(ScriptError::syntax("can only assign into a named container", line)),
        },
        _ => Err(ScriptError::syntax("cannot assign to expression", line)),
    }
}
