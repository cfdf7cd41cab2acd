use std::fmt;

use rust_decimal::Decimal;

use super::lexer::{Token, TokenKind};
use crate::error::FeeEngineError;
use crate::FeeEngineResult;

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }
}

/// Aggregate functions callable from a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Min,
    Max,
}

impl Function {
    fn lookup(name: &str) -> Option<Function> {
        match name.to_ascii_uppercase().as_str() {
            "MIN" => Some(Function::Min),
            "MAX" => Some(Function::Max),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Min => "MIN",
            Function::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Number(Decimal),
    Variable(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Collect every variable name referenced by the tree, in source order.
    pub fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => out.push(name),
            Expr::Neg(inner) => inner.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Variable(name) => f.write_str(name),
            Expr::Neg(inner) => match inner.as_ref() {
                Expr::Binary { .. } => write!(f, "-({inner})"),
                _ => write!(f, "-{inner}"),
            },
            Expr::Binary { op, lhs, rhs } => {
                write_operand(f, lhs)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, rhs)
            }
            Expr::Call { function, args } => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, operand: &Expr) -> fmt::Result {
    match operand {
        Expr::Binary { .. } => write!(f, "({operand})"),
        _ => write!(f, "{operand}"),
    }
}

// ---------------------------------------------------------------------------
// Recursive descent
// ---------------------------------------------------------------------------

/// Deepest syntax tree, and deepest bracket or sign nesting, a formula may
/// have. Evaluation and display recurse over the tree.
pub const MAX_DEPTH: usize = 256;

/// A parsed subtree with its height.
struct Node {
    expr: Expr,
    depth: usize,
}

impl Node {
    fn leaf(expr: Expr) -> Node {
        Node { expr, depth: 1 }
    }

    fn branch(expr: Expr, depth: usize, position: usize) -> FeeEngineResult<Node> {
        if depth > MAX_DEPTH {
            return Err(too_deep(position));
        }
        Ok(Node { expr, depth })
    }

    fn binary(op: BinaryOp, lhs: Node, rhs: Node, position: usize) -> FeeEngineResult<Node> {
        let depth = lhs.depth.max(rhs.depth) + 1;
        let expr = Expr::Binary {
            op,
            lhs: Box::new(lhs.expr),
            rhs: Box::new(rhs.expr),
        };
        Node::branch(expr, depth, position)
    }
}

/// expr    := term (('+' | '-') term)*
/// term    := unary (('*' | '/') unary)*
/// unary   := ('-' | '+') unary | primary
/// primary := NUMBER | IDENT | IDENT '(' expr (',' expr)+ ')' | '(' expr ')'
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            nesting: 0,
        }
    }

    pub fn parse_formula(mut self) -> FeeEngineResult<Expr> {
        if matches!(self.peek().kind, TokenKind::End) {
            return Err(syntax(0, "formula is empty"));
        }
        let node = self.parse_expr()?;
        let next = self.peek();
        match next.kind {
            TokenKind::End => Ok(node.expr),
            TokenKind::RParen => Err(syntax(next.position, "unbalanced ')'")),
            _ => Err(syntax(
                next.position,
                format!("unexpected {} after end of expression", describe(&next.kind)),
            )),
        }
    }

    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with End
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn descend(&mut self) -> FeeEngineResult<()> {
        self.nesting += 1;
        if self.nesting > MAX_DEPTH {
            return Err(too_deep(self.peek().position));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.nesting -= 1;
    }

    fn parse_expr(&mut self) -> FeeEngineResult<Node> {
        self.descend()?;
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let position = self.advance().position;
            let rhs = self.parse_term()?;
            lhs = Node::binary(op, lhs, rhs, position)?;
        }
        self.ascend();
        Ok(lhs)
    }

    fn parse_term(&mut self) -> FeeEngineResult<Node> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            let position = self.advance().position;
            let rhs = self.parse_unary()?;
            lhs = Node::binary(op, lhs, rhs, position)?;
        }
    }

    fn parse_unary(&mut self) -> FeeEngineResult<Node> {
        match self.peek().kind {
            TokenKind::Minus => {
                let position = self.advance().position;
                self.descend()?;
                let inner = self.parse_unary()?;
                self.ascend();
                Node::branch(Expr::Neg(Box::new(inner.expr)), inner.depth + 1, position)
            }
            TokenKind::Plus => {
                self.advance();
                self.descend()?;
                let inner = self.parse_unary()?;
                self.ascend();
                Ok(inner)
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> FeeEngineResult<Node> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(value) => Ok(Node::leaf(Expr::Number(value))),
            TokenKind::Ident(name) => {
                if matches!(self.peek().kind, TokenKind::LParen) {
                    self.parse_call(&name, token.position)
                } else {
                    Ok(Node::leaf(Expr::Variable(name)))
                }
            }
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                self.expect_rparen(token.position)?;
                Ok(inner)
            }
            TokenKind::End => Err(syntax(token.position, "unexpected end of formula")),
            other => Err(syntax(
                token.position,
                format!("expected a number, variable or '(' but found {}", describe(&other)),
            )),
        }
    }

    fn parse_call(&mut self, name: &str, position: usize) -> FeeEngineResult<Node> {
        let function = Function::lookup(name)
            .ok_or_else(|| syntax(position, format!("unknown function '{name}'")))?;
        let open = self.advance();

        let mut args = vec![self.parse_expr()?];
        while matches!(self.peek().kind, TokenKind::Comma) {
            self.advance();
            args.push(self.parse_expr()?);
        }
        self.expect_rparen(open.position)?;

        if args.len() < 2 {
            return Err(syntax(
                position,
                format!("{} takes at least two arguments", function.name()),
            ));
        }
        let depth = args.iter().map(|a| a.depth).max().unwrap_or(0) + 1;
        let args = args.into_iter().map(|a| a.expr).collect();
        Node::branch(Expr::Call { function, args }, depth, position)
    }

    fn expect_rparen(&mut self, open_position: usize) -> FeeEngineResult<()> {
        let token = self.advance();
        match token.kind {
            TokenKind::RParen => Ok(()),
            TokenKind::End => Err(syntax(
                open_position,
                "unbalanced '(' is never closed",
            )),
            other => Err(syntax(
                token.position,
                format!("expected ')' but found {}", describe(&other)),
            )),
        }
    }
}

fn too_deep(position: usize) -> FeeEngineError {
    syntax(position, format!("formula nested too deeply (limit {MAX_DEPTH})"))
}

fn syntax(position: usize, reason: impl Into<String>) -> FeeEngineError {
    FeeEngineError::FormulaSyntax {
        position,
        reason: reason.into(),
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Number(n) => format!("number {n}"),
        TokenKind::Ident(name) => format!("identifier '{name}'"),
        TokenKind::Plus => "'+'".into(),
        TokenKind::Minus => "'-'".into(),
        TokenKind::Star => "'*'".into(),
        TokenKind::Slash => "'/'".into(),
        TokenKind::LParen => "'('".into(),
        TokenKind::RParen => "')'".into(),
        TokenKind::Comma => "','".into(),
        TokenKind::End => "end of formula".into(),
    }
}
