//! Precedence-climbing expression parser over statement tokens.

use refit_core::ir::{BinaryOp, LiteralKind, UnaryOp};

use super::lexer::{TokKind, Token};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal { kind: LiteralKind, text: String },
    Name(String),
    /// `name(args)`: array element or function reference.
    Apply { name: String, args: Vec<Expr> },
    Range {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        stride: Option<Box<Expr>>,
    },
    Keyword { name: String, value: Box<Expr> },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Paren(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    /// Byte offset in the statement.
    pub offset: usize,
    pub message: String,
}

pub type SyntaxResult<T> = Result<T, SyntaxError>;

/// Position in a token slice.
pub struct Cursor<'t, 's> {
    tokens: &'t [Token<'s>],
    pos: usize,
    /// Length of the statement, reported for errors at the end.
    len: usize,
}

impl<'t, 's> Cursor<'t, 's> {
    pub fn new(tokens: &'t [Token<'s>], len: usize) -> Self {
        Cursor {
            tokens,
            pos: 0,
            len,
        }
    }

    pub fn peek(&self) -> Option<&Token<'s>> {
        self.tokens.get(self.pos)
    }

    pub fn peek_at(&self, ahead: usize) -> Option<&Token<'s>> {
        self.tokens.get(self.pos + ahead)
    }

    pub fn next(&mut self) -> Option<Token<'s>> {
        let tok = self.tokens.get(self.pos).copied();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn reset(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Byte offset of the next token (statement length at the end).
    pub fn offset(&self) -> usize {
        self.peek().map_or(self.len, |t| t.offset)
    }

    pub fn peek_op(&self, op: &str) -> bool {
        self.peek().is_some_and(|t| t.is_op(op))
    }

    pub fn peek_name(&self, word: &str) -> bool {
        self.peek().is_some_and(|t| t.is_name(word))
    }

    pub fn eat_op(&mut self, op: &str) -> bool {
        if self.peek_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn eat_name(&mut self, word: &str) -> bool {
        if self.peek_name(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            offset: self.offset(),
            message: message.into(),
        }
    }

    pub fn expect_op(&mut self, op: &str) -> SyntaxResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    pub fn expect_end(&self) -> SyntaxResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(self.error(format!("unexpected '{}'", tok.text))),
        }
    }

    /// Any name token.
    pub fn name(&mut self) -> SyntaxResult<String> {
        match self.peek() {
            Some(tok) if tok.kind == TokKind::Name => {
                let text = tok.text.to_string();
                self.pos += 1;
                Ok(text)
            }
            _ => Err(self.error("expected a name")),
        }
    }

    /// A name with `%` component selectors folded in: `a%b%c`.
    pub fn part_name(&mut self) -> SyntaxResult<String> {
        let mut name = self.name()?;
        while self.peek_op("%") {
            self.pos += 1;
            name.push('%');
            name.push_str(&self.name()?);
        }
        Ok(name)
    }
}

// ============================================================================
// Operators
// ============================================================================

fn binary_op(tok: &Token<'_>) -> Option<BinaryOp> {
    match tok.kind {
        TokKind::Op | TokKind::DotOp => BinaryOp::from_symbol(tok.text),
        _ => None,
    }
}

fn prefix_op(tok: &Token<'_>) -> Option<UnaryOp> {
    match tok.kind {
        TokKind::Op if tok.text == "-" => Some(UnaryOp::Neg),
        TokKind::Op if tok.text == "+" => Some(UnaryOp::Plus),
        TokKind::DotOp if tok.text.eq_ignore_ascii_case(".not.") => Some(UnaryOp::Not),
        _ => None,
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Parse one expression.
pub fn expression(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Expr> {
    binding(cur, 0)
}

fn binding(cur: &mut Cursor<'_, '_>, min: u8) -> SyntaxResult<Expr> {
    let mut lhs = match cur.peek().and_then(prefix_op) {
        Some(op) => {
            // A sign cannot follow a tighter operator (`a * -b`).
            if op.precedence() < min {
                return Err(cur.error(format!("unexpected '{}'", op.symbol())));
            }
            cur.next();
            let operand = binding(cur, op.precedence() + 1)?;
            Expr::Unary {
                op,
                operand: Box::new(operand),
            }
        }
        None => primary(cur)?,
    };
    while let Some(op) = cur.peek().and_then(binary_op) {
        let prec = op.precedence();
        if prec < min {
            break;
        }
        cur.next();
        let next_min = if op.is_right_assoc() { prec } else { prec + 1 };
        let rhs = binding(cur, next_min)?;
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
    }
    Ok(lhs)
}

fn primary(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Expr> {
    let Some(tok) = cur.peek().copied() else {
        return Err(cur.error("expected an expression"));
    };
    let literal = |kind| Expr::Literal {
        kind,
        text: tok.text.to_string(),
    };
    match tok.kind {
        TokKind::Int => {
            cur.next();
            Ok(literal(LiteralKind::Integer))
        }
        TokKind::Real => {
            cur.next();
            Ok(literal(LiteralKind::Real))
        }
        TokKind::Str => {
            cur.next();
            Ok(literal(LiteralKind::String))
        }
        TokKind::Logical => {
            cur.next();
            Ok(literal(LiteralKind::Logical))
        }
        TokKind::Name => designator(cur),
        TokKind::Op if tok.text == "(" => {
            cur.next();
            let inner = expression(cur)?;
            if cur.peek_op(",") {
                return Err(cur.error("complex literals are not supported"));
            }
            cur.expect_op(")")?;
            Ok(Expr::Paren(Box::new(inner)))
        }
        _ => Err(cur.error(format!("unexpected '{}'", tok.text))),
    }
}

/// Name or `name(args)`.
pub fn designator(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Expr> {
    let name = cur.part_name()?;
    if !cur.eat_op("(") {
        return Ok(Expr::Name(name));
    }
    let args = arguments(cur, false)?;
    if cur.peek_op("%") {
        return Err(cur.error("component of an array element is not supported"));
    }
    Ok(Expr::Apply { name, args })
}

/// Comma-separated arguments after an opening parenthesis, through `)`.
///
/// With `shape`, a lone `*` (assumed size) is accepted as an extent.
pub fn arguments(cur: &mut Cursor<'_, '_>, shape: bool) -> SyntaxResult<Vec<Expr>> {
    let mut args = Vec::new();
    if cur.eat_op(")") {
        return Ok(args);
    }
    loop {
        args.push(argument(cur, shape)?);
        if cur.eat_op(")") {
            return Ok(args);
        }
        cur.expect_op(",")?;
    }
}

fn is_argument_end(cur: &Cursor<'_, '_>) -> bool {
    cur.peek_op(",") || cur.peek_op(")") || cur.peek_op(":") || cur.at_end()
}

fn star(cur: &mut Cursor<'_, '_>) -> Option<Expr> {
    if cur.peek_op("*")
        && cur
            .peek_at(1)
            .is_some_and(|t| t.is_op(",") || t.is_op(")"))
    {
        cur.next();
        return Some(Expr::Literal {
            kind: LiteralKind::Integer,
            text: "*".to_string(),
        });
    }
    None
}

fn argument(cur: &mut Cursor<'_, '_>, shape: bool) -> SyntaxResult<Expr> {
    // Keyword argument: `name = value`
    if cur.peek().is_some_and(|t| t.kind == TokKind::Name)
        && cur.peek_at(1).is_some_and(|t| t.is_op("="))
    {
        let name = cur.name()?;
        cur.next();
        let value = expression(cur)?;
        return Ok(Expr::Keyword {
            name,
            value: Box::new(value),
        });
    }
    if shape {
        if let Some(extent) = star(cur) {
            return Ok(extent);
        }
    }
    let lower = if cur.peek_op(":") {
        None
    } else {
        Some(expression(cur)?)
    };
    if !cur.eat_op(":") {
        return lower.ok_or_else(|| cur.error("expected an expression"));
    }
    let upper = match shape.then(|| star(cur)).flatten() {
        Some(extent) => Some(extent),
        None if is_argument_end(cur) => None,
        None => Some(expression(cur)?),
    };
    let stride = if cur.eat_op(":") {
        Some(expression(cur)?)
    } else {
        None
    };
    Ok(Expr::Range {
        lower: lower.map(Box::new),
        upper: upper.map(Box::new),
        stride: stride.map(Box::new),
    })
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse(code: &str) -> Expr {
        let tokens = tokenize(code).unwrap();
        let mut cur = Cursor::new(&tokens, code.len());
        let expr = expression(&mut cur).unwrap();
        cur.expect_end().unwrap();
        expr
    }

    fn shape(expr: &Expr) -> String {
        match expr {
            Expr::Literal { text, .. } => text.clone(),
            Expr::Name(n) => n.clone(),
            Expr::Apply { name, args } => format!(
                "{}({})",
                name,
                args.iter().map(shape).collect::<Vec<_>>().join(",")
            ),
            Expr::Range { lower, upper, .. } => format!(
                "{}:{}",
                lower.as_deref().map(shape).unwrap_or_default(),
                upper.as_deref().map(shape).unwrap_or_default()
            ),
            Expr::Keyword { name, value } => format!("{}={}", name, shape(value)),
            Expr::Binary { op, lhs, rhs } => {
                format!("[{} {} {}]", shape(lhs), op.symbol(), shape(rhs))
            }
            Expr::Unary { op, operand } => format!("[{}{}]", op.symbol(), shape(operand)),
            Expr::Paren(inner) => format!("({})", shape(inner)),
        }
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(shape(&parse("a + b * c")), "[a + [b * c]]");
        assert_eq!(shape(&parse("a - b - c")), "[[a - b] - c]");
        assert_eq!(shape(&parse("a ** b ** c")), "[a ** [b ** c]]");
        assert_eq!(shape(&parse("-a ** 2")), "[-[a ** 2]]");
        assert_eq!(
            shape(&parse(".not. a .and. b")),
            "[[.not.a] .and. b]"
        );
        assert_eq!(shape(&parse("x .eq. 1 .or. y > 2")), "[[x == 1] .or. [y > 2]]");
    }

    #[test]
    fn sections_and_keywords() {
        assert_eq!(shape(&parse("a(1:n, :, i)")), "a(1:n,:,i)");
        assert_eq!(shape(&parse("f(x, dim=2)")), "f(x,dim=2)");
        assert_eq!(shape(&parse("t%a%b")), "t%a%b");
    }

    #[test]
    fn complex_literal_is_rejected() {
        let tokens = tokenize("(1.0, 2.0)").unwrap();
        let mut cur = Cursor::new(&tokens, 10);
        assert!(expression(&mut cur).is_err());
    }
}
