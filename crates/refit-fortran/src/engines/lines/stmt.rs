//! Statement classification.
//!
//! Every code line becomes one [`Stmt`]. Structural statements (unit headers,
//! `end`, block openers, `else`) must parse; anything else that does not fit
//! the IR falls back to [`Stmt::Verbatim`].

use refit_core::ir::{Attr, Intent, JumpKind, TypeSpec, UseItem};

use super::expr::{arguments, designator, expression, Cursor, Expr, SyntaxError, SyntaxResult};
use super::lexer::{tokenize, TokKind};
use crate::engines::{is_end_keyword, looks_structural, UNIT_PREFIXES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub name: String,
    pub shape: Vec<Expr>,
    pub init: Option<Expr>,
    pub pointer_init: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Module {
        name: String,
    },
    Program {
        name: String,
    },
    Subroutine {
        name: String,
        prefixes: Vec<String>,
        params: Vec<String>,
    },
    Function {
        name: String,
        prefixes: Vec<String>,
        params: Vec<String>,
        result: Option<String>,
        return_type: Option<TypeSpec>,
    },
    Contains,
    /// `end`, `end do`, `endif`, `end subroutine foo`, ...; `keyword` is
    /// lowercase and empty for a bare `end`.
    End {
        keyword: String,
    },
    Use {
        module: String,
        intrinsic: bool,
        only: Option<Vec<UseItem>>,
    },
    Implicit {
        spec: String,
    },
    Declaration {
        type_spec: TypeSpec,
        attrs: Vec<Attr>,
        /// Extents from a `dimension(...)` attribute.
        dimension: Option<Vec<Expr>>,
        entities: Vec<Entity>,
    },
    Include {
        path: String,
    },
    Assignment {
        target: Expr,
        value: Expr,
        pointer: bool,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Do {
        variable: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
    },
    DoWhile {
        condition: Option<Expr>,
    },
    IfThen {
        condition: Expr,
    },
    ElseIf {
        condition: Expr,
    },
    Else,
    /// `if (cond) stmt`; `text` is the source of the inner statement.
    InlineIf {
        condition: Expr,
        then: Box<Stmt>,
        text: String,
    },
    Block,
    Jump(JumpKind),
    Verbatim,
}

impl Stmt {
    /// Does this statement open or close structure?
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Stmt::Module { .. }
                | Stmt::Program { .. }
                | Stmt::Subroutine { .. }
                | Stmt::Function { .. }
                | Stmt::Contains
                | Stmt::End { .. }
                | Stmt::Do { .. }
                | Stmt::DoWhile { .. }
                | Stmt::IfThen { .. }
                | Stmt::ElseIf { .. }
                | Stmt::Else
                | Stmt::Block
        )
    }
}

/// Classify one statement (label already stripped).
///
/// Returns an error only for statements that look structural but do not
/// parse.
pub fn classify(code: &str) -> SyntaxResult<Stmt> {
    match parse_statement(code) {
        Ok(stmt) => Ok(stmt),
        Err(err) if looks_structural(code) => Err(err),
        Err(_) => Ok(Stmt::Verbatim),
    }
}

fn parse_statement(code: &str) -> SyntaxResult<Stmt> {
    let tokens = tokenize(code).map_err(|e| SyntaxError {
        offset: e.offset,
        message: e.message,
    })?;
    let mut cur = Cursor::new(&tokens, code.len());
    let Some(first) = cur.peek().copied() else {
        return Err(cur.error("empty statement"));
    };
    if first.kind != TokKind::Name {
        return Err(cur.error(format!("unexpected '{}'", first.text)));
    }
    let word = first.text.to_ascii_lowercase();
    let second_is_assignment = cur
        .peek_at(1)
        .is_some_and(|t| t.is_op("=") || t.is_op("=>") || t.is_op("(") || t.is_op("%"));

    // Statements introduced by a keyword. A keyword followed by `=` or `(`
    // may still be an assignment to a variable of that name.
    let keyword_stmt = match word.as_str() {
        "else" => Some(else_stmt(&mut cur)),
        "elseif" => Some(else_if(&mut cur, 1)),
        "if" => Some(if_stmt(&mut cur, code)),
        _ if second_is_assignment => None,
        "contains" => Some(simple(&mut cur, Stmt::Contains)),
        "block" => Some(simple(&mut cur, Stmt::Block)),
        "return" => Some(simple(&mut cur, Stmt::Jump(JumpKind::Return))),
        "exit" => Some(simple(&mut cur, Stmt::Jump(JumpKind::Exit))),
        "cycle" => Some(simple(&mut cur, Stmt::Jump(JumpKind::Cycle))),
        "module" => Some(module_like(&mut cur, code)),
        "program" => Some(named(&mut cur, |name| Stmt::Program { name })),
        "use" => Some(use_stmt(&mut cur)),
        "implicit" => Some(Ok(Stmt::Implicit {
            spec: code[first.offset + first.text.len()..].trim().to_string(),
        })),
        "include" => Some(include(&mut cur)),
        "call" => Some(call(&mut cur)),
        "do" => Some(do_stmt(&mut cur)),
        w if is_end_keyword(w) => Some(end(&mut cur)),
        _ => None,
    };
    if let Some(stmt) = keyword_stmt {
        return stmt;
    }

    if let Some(stmt) = subprogram(&mut cur)? {
        return Ok(stmt);
    }
    cur.reset(0);
    if let Some(stmt) = declaration(&mut cur, code)? {
        return Ok(stmt);
    }
    cur.reset(0);
    assignment(&mut cur)
}

fn simple(cur: &mut Cursor<'_, '_>, stmt: Stmt) -> SyntaxResult<Stmt> {
    cur.next();
    cur.expect_end()?;
    Ok(stmt)
}

fn named(cur: &mut Cursor<'_, '_>, make: impl FnOnce(String) -> Stmt) -> SyntaxResult<Stmt> {
    cur.next();
    let name = cur.name()?;
    cur.expect_end()?;
    Ok(make(name))
}

fn module_like(cur: &mut Cursor<'_, '_>, code: &str) -> SyntaxResult<Stmt> {
    // `module subroutine` / `module function` are prefixed subprograms
    if cur
        .peek_at(1)
        .is_some_and(|t| t.is_name("subroutine") || t.is_name("function"))
    {
        return subprogram(cur)?.ok_or_else(|| cur.error(format!("cannot parse '{}'", code)));
    }
    named(cur, |name| Stmt::Module { name })
}

fn end(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Stmt> {
    let word = cur.name()?.to_ascii_lowercase();
    let mut keyword = word.strip_prefix("end").unwrap_or("").to_string();
    if keyword.is_empty() {
        if let Some(tok) = cur.peek().copied() {
            if tok.kind == TokKind::Name {
                cur.next();
                keyword = tok.text.to_ascii_lowercase();
            }
        }
    }
    // Optional construct or unit name.
    if !keyword.is_empty() && cur.peek().is_some_and(|t| t.kind == TokKind::Name) {
        cur.next();
    }
    cur.expect_end()?;
    Ok(Stmt::End { keyword })
}

fn parenthesized(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Expr> {
    cur.expect_op("(")?;
    let condition = expression(cur)?;
    cur.expect_op(")")?;
    Ok(condition)
}

fn else_stmt(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Stmt> {
    if cur.peek_at(1).is_some_and(|t| t.is_name("if")) {
        return else_if(cur, 2);
    }
    simple(cur, Stmt::Else)
}

fn else_if(cur: &mut Cursor<'_, '_>, words: usize) -> SyntaxResult<Stmt> {
    for _ in 0..words {
        cur.next();
    }
    let condition = parenthesized(cur)?;
    if !cur.eat_name("then") {
        return Err(cur.error("expected 'then'"));
    }
    cur.expect_end()?;
    Ok(Stmt::ElseIf { condition })
}

fn if_stmt(cur: &mut Cursor<'_, '_>, code: &str) -> SyntaxResult<Stmt> {
    cur.next();
    let condition = parenthesized(cur)?;
    if cur.peek_name("then") && cur.peek_at(1).is_none() {
        cur.next();
        return Ok(Stmt::IfThen { condition });
    }
    let offset = cur.offset();
    if cur.at_end() {
        return Err(cur.error("expected a statement after the condition"));
    }
    let text = code[offset..].trim().to_string();
    let then = match parse_statement(&text) {
        Ok(
            stmt @ (Stmt::Assignment { .. } | Stmt::Call { .. } | Stmt::Jump(_) | Stmt::Verbatim),
        ) => stmt,
        _ => Stmt::Verbatim,
    };
    Ok(Stmt::InlineIf {
        condition,
        then: Box::new(then),
        text,
    })
}

fn do_stmt(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Stmt> {
    cur.next();
    if cur.at_end() {
        return Ok(Stmt::DoWhile { condition: None });
    }
    if cur.peek_name("while") && cur.peek_at(1).is_some_and(|t| t.is_op("(")) {
        cur.next();
        let condition = parenthesized(cur)?;
        cur.expect_end()?;
        return Ok(Stmt::DoWhile {
            condition: Some(condition),
        });
    }
    let variable = cur.name()?;
    cur.expect_op("=")?;
    let start = expression(cur)?;
    cur.expect_op(",")?;
    let end = expression(cur)?;
    let step = if cur.eat_op(",") {
        Some(expression(cur)?)
    } else {
        None
    };
    cur.expect_end()?;
    Ok(Stmt::Do {
        variable,
        start,
        end,
        step,
    })
}

fn call(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Stmt> {
    cur.next();
    let name = cur.part_name()?;
    let args = if cur.eat_op("(") {
        arguments(cur, false)?
    } else {
        Vec::new()
    };
    cur.expect_end()?;
    Ok(Stmt::Call { name, args })
}

fn include(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Stmt> {
    cur.next();
    let path = match cur.next() {
        Some(tok) if tok.kind == TokKind::Str && tok.text.len() >= 2 => {
            tok.text[1..tok.text.len() - 1].to_string()
        }
        _ => return Err(cur.error("expected a file name")),
    };
    cur.expect_end()?;
    Ok(Stmt::Include { path })
}

fn use_stmt(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Stmt> {
    cur.next();
    let mut intrinsic = false;
    if cur.eat_op(",") {
        let nature = cur.name()?.to_ascii_lowercase();
        match nature.as_str() {
            "intrinsic" => intrinsic = true,
            "non_intrinsic" => {}
            _ => return Err(cur.error("expected a module nature")),
        }
        cur.expect_op("::")?;
    } else {
        cur.eat_op("::");
    }
    let module = cur.name()?;
    if cur.at_end() {
        return Ok(Stmt::Use {
            module,
            intrinsic,
            only: None,
        });
    }
    cur.expect_op(",")?;
    if !cur.eat_name("only") {
        return Err(cur.error("renames without 'only' are not supported"));
    }
    cur.expect_op(":")?;
    let mut items = Vec::new();
    while !cur.at_end() {
        let local = cur.name()?;
        let item = if cur.eat_op("=>") {
            UseItem {
                name: cur.name()?,
                rename: Some(local),
            }
        } else {
            UseItem {
                name: local,
                rename: None,
            }
        };
        items.push(item);
        if !cur.at_end() {
            cur.expect_op(",")?;
        }
    }
    Ok(Stmt::Use {
        module,
        intrinsic,
        only: Some(items),
    })
}

fn prefixes(cur: &mut Cursor<'_, '_>, out: &mut Vec<String>) {
    while let Some(tok) = cur.peek().copied() {
        let lower = tok.text.to_ascii_lowercase();
        if tok.kind == TokKind::Name && UNIT_PREFIXES.contains(&lower.as_str()) {
            cur.next();
            out.push(lower);
        } else {
            break;
        }
    }
}

fn params(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Vec<String>> {
    let mut out = Vec::new();
    if !cur.eat_op("(") {
        return Ok(out);
    }
    if cur.eat_op(")") {
        return Ok(out);
    }
    loop {
        out.push(cur.name()?);
        if cur.eat_op(")") {
            return Ok(out);
        }
        cur.expect_op(",")?;
    }
}

/// Subroutine or function header, if the statement is one.
fn subprogram(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Option<Stmt>> {
    cur.reset(0);
    let mut prefix = Vec::new();
    prefixes(cur, &mut prefix);
    if cur.eat_name("subroutine") {
        let name = cur.name()?;
        let params = params(cur)?;
        cur.expect_end()?;
        return Ok(Some(Stmt::Subroutine {
            name,
            prefixes: prefix,
            params,
        }));
    }
    let return_type = if cur.peek_name("function") {
        None
    } else {
        let save = cur.position();
        match type_spec(cur)? {
            Some(ts) => Some(ts),
            None => {
                cur.reset(save);
                return Ok(None);
            }
        }
    };
    prefixes(cur, &mut prefix);
    if !cur.eat_name("function") {
        return Ok(None);
    }
    let name = cur.name()?;
    if !cur.peek_op("(") {
        return Err(cur.error("expected '('"));
    }
    let params = params(cur)?;
    let result = if cur.eat_name("result") {
        cur.expect_op("(")?;
        let r = cur.name()?;
        cur.expect_op(")")?;
        Some(r)
    } else {
        None
    };
    cur.expect_end()?;
    Ok(Some(Stmt::Function {
        name,
        prefixes: prefix,
        params,
        result,
        return_type,
    }))
}

/// Offsets of the parenthesis at the cursor and its match; the cursor ends
/// after the closing parenthesis.
fn balanced(cur: &mut Cursor<'_, '_>) -> SyntaxResult<(usize, usize)> {
    let open = cur
        .next()
        .filter(|t| t.is_op("("))
        .ok_or_else(|| cur.error("expected '('"))?;
    let mut depth = 1usize;
    while let Some(tok) = cur.next() {
        if tok.is_op("(") {
            depth += 1;
        } else if tok.is_op(")") {
            depth -= 1;
            if depth == 0 {
                return Ok((open.offset, tok.offset));
            }
        }
    }
    Err(cur.error("unbalanced parentheses"))
}

/// Type specifier at the cursor, if there is one.
fn type_spec(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Option<TypeSpec>> {
    let Some(tok) = cur.peek().copied() else {
        return Ok(None);
    };
    if tok.kind != TokKind::Name {
        return Ok(None);
    }
    let word = tok.text.to_ascii_lowercase();
    let base = match word.as_str() {
        "integer" | "real" | "complex" | "logical" | "character" => {
            cur.next();
            word
        }
        "doubleprecision" => {
            cur.next();
            "double precision".to_string()
        }
        "double" if cur.peek_at(1).is_some_and(|t| t.is_name("precision")) => {
            cur.next();
            cur.next();
            "double precision".to_string()
        }
        "type" | "class" if cur.peek_at(1).is_some_and(|t| t.is_op("(")) => {
            cur.next();
            let inner = selector_text(cur)?;
            return Ok(Some(TypeSpec::new(&format!("{}({})", word, inner), None)));
        }
        _ => return Ok(None),
    };
    let selector = if cur.peek_op("(") {
        Some(selector_text(cur)?)
    } else if cur.eat_op("*") {
        match cur.peek().copied() {
            Some(t) if t.kind == TokKind::Int => {
                cur.next();
                Some(t.text.to_string())
            }
            Some(t) if t.is_op("(") => Some(selector_text(cur)?),
            _ => return Err(cur.error("expected a length")),
        }
    } else {
        None
    };
    Ok(Some(TypeSpec::new(&base, selector.as_deref())))
}

/// Tokens inside the parentheses at the cursor, concatenated.
fn selector_text(cur: &mut Cursor<'_, '_>) -> SyntaxResult<String> {
    cur.expect_op("(")?;
    let mut depth = 1usize;
    let mut text = String::new();
    while let Some(tok) = cur.next() {
        if tok.is_op("(") {
            depth += 1;
        } else if tok.is_op(")") {
            depth -= 1;
            if depth == 0 {
                return Ok(text);
            }
        }
        text.push_str(tok.text);
    }
    Err(cur.error("unbalanced parentheses"))
}

fn declaration(cur: &mut Cursor<'_, '_>, code: &str) -> SyntaxResult<Option<Stmt>> {
    let Some(type_spec) = type_spec(cur)? else {
        return Ok(None);
    };
    // `real = 1` assigns to a variable called `real`
    if cur.peek_op("=") || cur.peek_op("=>") || cur.at_end() {
        return Ok(None);
    }
    let mut attrs = Vec::new();
    let mut dimension = None;
    while cur.eat_op(",") {
        let attr_tok = cur.peek().copied().ok_or_else(|| cur.error("expected an attribute"))?;
        let word = cur.name()?.to_ascii_lowercase();
        match word.as_str() {
            "intent" => {
                let (open, close) = balanced(cur)?;
                let intent = Intent::parse(&code[open + 1..close])
                    .ok_or_else(|| cur.error("invalid intent"))?;
                attrs.push(Attr::Intent(intent));
            }
            "dimension" => {
                cur.expect_op("(")?;
                dimension = Some(arguments(cur, true)?);
            }
            _ if cur.peek_op("(") => {
                let (_, close) = balanced(cur)?;
                attrs.push(Attr::from_keyword(&code[attr_tok.offset..=close]));
            }
            _ => attrs.push(Attr::from_keyword(&word)),
        }
    }
    let had_colons = cur.eat_op("::");
    if !had_colons && !attrs.is_empty() {
        return Err(cur.error("expected '::'"));
    }
    let mut entities = Vec::new();
    loop {
        let name = cur.name()?;
        let shape = if cur.eat_op("(") {
            arguments(cur, true)?
        } else {
            Vec::new()
        };
        if cur.peek_op("*") {
            return Err(cur.error("entity length selectors are not supported"));
        }
        let (init, pointer_init) = if cur.eat_op("=>") {
            (Some(expression(cur)?), true)
        } else if cur.eat_op("=") {
            (Some(expression(cur)?), false)
        } else {
            (None, false)
        };
        entities.push(Entity {
            name,
            shape,
            init,
            pointer_init,
        });
        if cur.at_end() {
            break;
        }
        cur.expect_op(",")?;
    }
    Ok(Some(Stmt::Declaration {
        type_spec,
        attrs,
        dimension,
        entities,
    }))
}

fn assignment(cur: &mut Cursor<'_, '_>) -> SyntaxResult<Stmt> {
    if !cur.peek().is_some_and(|t| t.kind == TokKind::Name) {
        return Err(cur.error("expected a statement"));
    }
    let target = designator(cur)?;
    let pointer = if cur.eat_op("=>") {
        true
    } else if cur.eat_op("=") {
        false
    } else {
        return Err(cur.error("expected '='"));
    };
    let value = expression(cur)?;
    cur.expect_end()?;
    Ok(Stmt::Assignment {
        target,
        value,
        pointer,
    })
}
