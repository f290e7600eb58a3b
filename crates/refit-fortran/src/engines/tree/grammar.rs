//! PEG grammar for single free-form statements.
//!
//! Input is one logical line with continuations joined, comments and the
//! statement label removed. Keywords are case-insensitive; every statement
//! rule must consume the whole line.

use refit_core::ir::{BinaryOp, Intent, TypeSpec, UnaryOp, UseItem};

use super::cst::{DeclAttr, EntityDecl, Expr, Initialization, LoopControl, Statement};
use crate::engines::{is_end_keyword, DOTTED_WORDS, UNIT_PREFIXES};

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
}

fn unary(op: UnaryOp, operand: Expr) -> Expr {
    Expr::Unary(op, Box::new(operand))
}

fn triplet(lower: Option<Expr>, upper: Option<Expr>, stride: Option<Expr>) -> Expr {
    Expr::Triplet {
        lower: lower.map(Box::new),
        upper: upper.map(Box::new),
        stride: stride.map(Box::new),
    }
}

fn relational(word: &str) -> Result<BinaryOp, &'static str> {
    match word.to_ascii_lowercase().as_str() {
        "eq" => Ok(BinaryOp::Eq),
        "ne" => Ok(BinaryOp::Ne),
        "lt" => Ok(BinaryOp::Lt),
        "le" => Ok(BinaryOp::Le),
        "gt" => Ok(BinaryOp::Gt),
        "ge" => Ok(BinaryOp::Ge),
        _ => Err("relational operator"),
    }
}

peg::parser! {
    pub grammar fortran() for str {
        // --------------------------------------------------------------------
        // Lexical
        // --------------------------------------------------------------------

        rule ws() = quiet!{[' ' | '\t']*}

        rule eos() = ws() ![_]

        rule sep() = ws() "," ws()

        rule word() -> &'input str
            = quiet!{ $(['a'..='z' | 'A'..='Z'] ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']*) }
            / expected!("name")

        rule kw(k: &'static str)
            = w:word() {? if w.eq_ignore_ascii_case(k) { Ok(()) } else { Err(k) } }

        rule name() -> String = w:word() { w.to_string() }

        rule part_name() -> String
            = first:word() rest:(ws() "%" ws() w:word() { w })* {
                let mut name = first.to_string();
                for part in rest {
                    name.push('%');
                    name.push_str(part);
                }
                name
            }

        rule letters() -> &'input str = $(['a'..='z' | 'A'..='Z']+)

        rule dotted(k: &'static str)
            = "." w:letters() "." {? if w.eq_ignore_ascii_case(k) { Ok(()) } else { Err(k) } }

        rule dotted_word()
            = "." w:letters() "." {?
                if DOTTED_WORDS.contains(&w.to_ascii_lowercase().as_str()) { Ok(()) } else { Err("operator") }
            }

        // --------------------------------------------------------------------
        // Literals
        // --------------------------------------------------------------------

        rule digits() = ['0'..='9']+

        rule kind_param() = "_" ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']+

        rule exponent() = ['e' | 'E' | 'd' | 'D'] ['+' | '-']? digits()

        rule real_literal() -> Expr
            = s:$(digits() !dotted_word() "." digits()? exponent()? kind_param()?) { Expr::RealLiteral(s.to_string()) }
            / s:$("." digits() exponent()? kind_param()?) { Expr::RealLiteral(s.to_string()) }
            / s:$(digits() exponent() kind_param()?) { Expr::RealLiteral(s.to_string()) }

        rule int_literal() -> Expr
            = s:$(digits() kind_param()?) { Expr::IntLiteral(s.to_string()) }

        rule char_literal() -> Expr
            = s:$("'" ([^ '\''] / "''")* "'") { Expr::CharLiteral(s.to_string()) }
            / s:$("\"" ([^ '"'] / "\"\"")* "\"") { Expr::CharLiteral(s.to_string()) }

        rule logical_literal() -> Expr
            = s:$("." (kw("true") / kw("false")) "." kind_param()?) { Expr::LogicalLiteral(s.to_string()) }

        // --------------------------------------------------------------------
        // Expressions
        // --------------------------------------------------------------------

        rule rel_op() -> BinaryOp
            = "==" { BinaryOp::Eq }
            / "/=" { BinaryOp::Ne }
            / "<=" { BinaryOp::Le }
            / ">=" { BinaryOp::Ge }
            / "<" { BinaryOp::Lt }
            / ">" { BinaryOp::Gt }
            / "." w:letters() "." {? relational(w) }

        rule equiv_op() -> BinaryOp
            = "." w:letters() "." {?
                match w.to_ascii_lowercase().as_str() {
                    "eqv" => Ok(BinaryOp::Eqv),
                    "neqv" => Ok(BinaryOp::Neqv),
                    _ => Err("equivalence operator"),
                }
            }

        pub rule expr() -> Expr = precedence!{
            x:(@) ws() op:equiv_op() ws() y:@ { binary(op, x, y) }
            --
            x:(@) ws() dotted("or") ws() y:@ { binary(BinaryOp::Or, x, y) }
            --
            x:(@) ws() dotted("and") ws() y:@ { binary(BinaryOp::And, x, y) }
            --
            dotted("not") ws() x:@ { unary(UnaryOp::Not, x) }
            --
            x:(@) ws() op:rel_op() ws() y:@ { binary(op, x, y) }
            --
            x:(@) ws() "//" ws() y:@ { binary(BinaryOp::Concat, x, y) }
            --
            x:(@) ws() "+" ws() y:@ { binary(BinaryOp::Add, x, y) }
            x:(@) ws() "-" ws() y:@ { binary(BinaryOp::Sub, x, y) }
            "-" ws() x:@ { unary(UnaryOp::Neg, x) }
            "+" ws() x:@ { unary(UnaryOp::Plus, x) }
            --
            x:(@) ws() "*" !"*" ws() y:@ { binary(BinaryOp::Mul, x, y) }
            x:(@) ws() "/" !['/' | '=' | ')'] ws() y:@ { binary(BinaryOp::Div, x, y) }
            --
            x:@ ws() "**" ws() y:(@) { binary(BinaryOp::Pow, x, y) }
            --
            p:primary() { p }
        }

        rule primary() -> Expr
            = logical_literal()
            / real_literal()
            / int_literal()
            / char_literal()
            / "(" ws() e:expr() ws() ")" { Expr::Parens(Box::new(e)) }
            / designator()

        pub rule designator() -> Expr
            = n:part_name() a:(ws() "(" ws() a:(arg() ** sep()) ws() ")" { a })? {
                match a {
                    Some(args) => Expr::Reference { name: n, args },
                    None => Expr::Name(n),
                }
            }

        rule arg() -> Expr
            = k:name() ws() "=" !['=' | '>'] ws() v:expr() { Expr::Keyword { name: k, value: Box::new(v) } }
            / subscript()

        rule stride() -> Expr = ws() ":" ws() s:expr() { s }

        rule subscript() -> Expr
            = lo:expr()? ws() ":" ws() hi:expr()? st:stride()? { triplet(lo, hi, st) }
            / expr()

        rule star() -> Expr = "*" &(ws() ("," / ")")) { Expr::Star }

        rule extent() -> Expr
            = star()
            / lo:expr()? ws() ":" ws() hi:(star() / expr())? st:stride()? { triplet(lo, hi, st) }
            / expr()

        // --------------------------------------------------------------------
        // Types and declarations
        // --------------------------------------------------------------------

        rule balanced() = ([^ '(' | ')'] / "(" balanced() ")")*

        rule selector() -> String
            = ws() "(" s:$(balanced()) ")" { s.to_string() }
            / ws() "*" ws() "(" s:$(balanced()) ")" { s.to_string() }
            / ws() "*" ws() n:$(digits()) { n.to_string() }

        rule intrinsic_type() -> String
            = w:word() {?
                let lower = w.to_ascii_lowercase();
                match lower.as_str() {
                    "integer" | "real" | "complex" | "logical" | "character" => Ok(lower),
                    _ => Err("type"),
                }
            }

        rule derived_type() -> String
            = w:word() {?
                let lower = w.to_ascii_lowercase();
                match lower.as_str() {
                    "type" | "class" => Ok(lower),
                    _ => Err("type"),
                }
            }

        rule type_spec() -> TypeSpec
            = kw("double") ws() kw("precision") s:selector()? { TypeSpec::new("double precision", s.as_deref()) }
            / kw("doubleprecision") s:selector()? { TypeSpec::new("double precision", s.as_deref()) }
            / k:derived_type() ws() "(" inner:$(balanced()) ")" { TypeSpec::new(&format!("{}({})", k, inner), None) }
            / k:intrinsic_type() s:selector()? { TypeSpec::new(&k, s.as_deref()) }

        rule attr_spec() -> DeclAttr
            = kw("intent") ws() "(" ws() i:$(word() (ws() word())?) ws() ")" {?
                Intent::parse(i).map(DeclAttr::Intent).ok_or("intent")
            }
            / kw("dimension") ws() "(" ws() e:(extent() ** sep()) ws() ")" { DeclAttr::Dimension(e) }
            / s:$(word() ws() "(" balanced() ")") { DeclAttr::Spec(s.to_string()) }
            / w:word() { DeclAttr::Spec(w.to_string()) }

        rule initialization() -> Initialization
            = "=>" ws() e:expr() { Initialization::Target(e) }
            / "=" !"=" ws() e:expr() { Initialization::Value(e) }

        rule entity_decl() -> EntityDecl
            = n:name() ws() s:("(" ws() s:(extent() ** sep()) ws() ")" { s })? ws() i:initialization()? {
                EntityDecl { name: n, array_spec: s, init: i }
            }

        rule type_declaration_stmt() -> Statement
            = t:type_spec() a:(sep() a:attr_spec() { a })* ws() c:"::"? ws() e:(entity_decl() ++ sep()) eos() {?
                if !a.is_empty() && c.is_none() {
                    Err("::")
                } else {
                    Ok(Statement::TypeDeclarationStmt { type_spec: t, attrs: a, entities: e })
                }
            }

        // --------------------------------------------------------------------
        // Program units
        // --------------------------------------------------------------------

        rule prefix() -> String
            = w:word() ws() {?
                let lower = w.to_ascii_lowercase();
                if UNIT_PREFIXES.contains(&lower.as_str()) { Ok(lower) } else { Err("prefix") }
            }

        rule dummy_list() -> Vec<String> = "(" ws() d:(name() ** sep()) ws() ")" { d }

        rule result_clause() -> String = kw("result") ws() "(" ws() r:name() ws() ")" { r }

        rule subprogram_stmt() -> Statement
            = p:prefix()* kw("subroutine") ws() n:name() ws() d:dummy_list()? eos() {
                Statement::SubroutineStmt { prefixes: p, name: n, dummies: d.unwrap_or_default() }
            }
            / p:prefix()* t:(t:type_spec() ws() { t })? q:prefix()* kw("function") ws() n:name() ws()
              d:dummy_list() ws() r:result_clause()? eos() {
                let mut prefixes = p;
                prefixes.extend(q);
                Statement::FunctionStmt { prefixes, type_spec: t, name: n, dummies: d, result: r }
            }

        rule module_stmt() -> Statement = kw("module") ws() n:name() eos() { Statement::ModuleStmt { name: n } }

        rule program_stmt() -> Statement = kw("program") ws() n:name() eos() { Statement::ProgramStmt { name: n } }

        rule contains_stmt() -> Statement = kw("contains") eos() { Statement::ContainsStmt }

        rule fused_end() -> String
            = w:word() {?
                let lower = w.to_ascii_lowercase();
                if lower != "end" && is_end_keyword(&lower) { Ok(lower[3..].to_string()) } else { Err("end") }
            }

        rule end_stmt() -> Statement
            = kw("end") ws() k:word()? ws() word()? eos() {
                Statement::EndStmt { keyword: k.map(|k| k.to_ascii_lowercase()).unwrap_or_default() }
            }
            / k:fused_end() ws() word()? eos() { Statement::EndStmt { keyword: k } }

        // --------------------------------------------------------------------
        // Specification statements
        // --------------------------------------------------------------------

        rule module_nature() -> bool
            = "," ws() w:word() ws() "::" {?
                match w.to_ascii_lowercase().as_str() {
                    "intrinsic" => Ok(true),
                    "non_intrinsic" => Ok(false),
                    _ => Err("module nature"),
                }
            }
            / "::" { false }

        rule use_item() -> UseItem
            = l:name() ws() "=>" ws() r:name() { UseItem { name: r, rename: Some(l) } }
            / n:name() { UseItem { name: n, rename: None } }

        rule only_list() -> Vec<UseItem>
            = "," ws() kw("only") ws() ":" ws() items:(use_item() ** sep()) { items }

        rule use_stmt() -> Statement
            = kw("use") ws() i:module_nature()? ws() m:name() ws() o:only_list()? eos() {
                Statement::UseStmt { intrinsic: i.unwrap_or(false), module: m, only: o }
            }

        rule implicit_stmt() -> Statement
            = kw("implicit") s:$([_]*) { Statement::ImplicitStmt { spec: s.trim().to_string() } }

        rule include_line() -> Statement
            = kw("include") ws() s:$(char_literal()) eos() {
                Statement::IncludeLine { path: s[1..s.len() - 1].to_string() }
            }

        // --------------------------------------------------------------------
        // Executable statements
        // --------------------------------------------------------------------

        rule loop_control() -> LoopControl
            = kw("while") ws() "(" ws() c:expr() ws() ")" { LoopControl::While(c) }
            / v:name() ws() "=" !"=" ws() a:expr() sep() b:expr() s:(sep() s:expr() { s })? {
                LoopControl::Counted { variable: v, start: a, end: b, step: s }
            }

        rule do_stmt() -> Statement
            = kw("do") ws() c:loop_control() eos() { Statement::DoStmt { control: Some(c) } }
            / kw("do") eos() { Statement::DoStmt { control: None } }

        rule condition() -> Expr = "(" ws() c:expr() ws() ")" { c }

        rule if_then_stmt() -> Statement
            = kw("if") ws() c:condition() ws() kw("then") eos() { Statement::IfThenStmt { condition: c } }

        rule else_if_stmt() -> Statement
            = kw("else") ws() kw("if") ws() c:condition() ws() kw("then") eos() { Statement::ElseIfStmt { condition: c } }
            / kw("elseif") ws() c:condition() ws() kw("then") eos() { Statement::ElseIfStmt { condition: c } }

        rule else_stmt() -> Statement = kw("else") eos() { Statement::ElseStmt }

        rule if_stmt() -> Statement
            = kw("if") ws() c:condition() ws() a:$([_]+) {
                Statement::IfStmt { condition: c, action: a.trim().to_string() }
            }

        rule block_stmt() -> Statement = kw("block") eos() { Statement::BlockStmt }

        rule jump_stmt() -> Statement
            = kw("return") eos() { Statement::ReturnStmt }
            / kw("exit") eos() { Statement::ExitStmt }
            / kw("cycle") eos() { Statement::CycleStmt }

        rule call_stmt() -> Statement
            = kw("call") ws() n:part_name() ws() a:("(" ws() a:(arg() ** sep()) ws() ")" { a })? eos() {
                Statement::CallStmt { name: n, args: a.unwrap_or_default() }
            }

        rule assignment_stmt() -> Statement
            = t:designator() ws() "=>" ws() v:expr() eos() { Statement::PointerAssignmentStmt { target: t, value: v } }
            / t:designator() ws() "=" !"=" ws() v:expr() eos() { Statement::AssignmentStmt { target: t, value: v } }

        // --------------------------------------------------------------------
        // Entry points
        // --------------------------------------------------------------------

        // Any statement the grammar knows.
        pub rule statement() -> Statement
            = ws() s:(
                end_stmt()
                / contains_stmt()
                / module_stmt()
                / program_stmt()
                / subprogram_stmt()
                / use_stmt()
                / implicit_stmt()
                / include_line()
                / do_stmt()
                / if_then_stmt()
                / else_if_stmt()
                / else_stmt()
                / if_stmt()
                / block_stmt()
                / jump_stmt()
                / call_stmt()
                / type_declaration_stmt()
                / assignment_stmt()
            ) { s }

        // Statements allowed as the action of a logical `if`.
        pub rule action_stmt() -> Statement
            = ws() s:(jump_stmt() / call_stmt() / assignment_stmt()) { s }
    }
}
