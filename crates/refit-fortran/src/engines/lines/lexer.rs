//! Statement tokenizer.

use winnow::ascii::multispace0;
use winnow::combinator::{alt, opt, preceded};
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;
use winnow::token::{one_of, take_till, take_while};
use winnow::ModalResult;

use crate::engines::DOTTED_WORDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokKind {
    Name,
    Int,
    Real,
    /// String literal, quotes included.
    Str,
    /// `.true.` / `.false.`, with optional kind.
    Logical,
    /// Dotted operator such as `.and.` or `.eq.`.
    DotOp,
    /// Punctuation and symbolic operators.
    Op,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'s> {
    pub kind: TokKind,
    pub text: &'s str,
    /// Byte offset in the statement.
    pub offset: usize,
}

impl Token<'_> {
    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokKind::Op && self.text == op
    }

    pub fn is_name(&self, word: &str) -> bool {
        self.kind == TokKind::Name && self.text.eq_ignore_ascii_case(word)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub offset: usize,
    pub message: String,
}

/// Symbolic operators, longest first.
const OPERATORS: &[&str] = &[
    "**", "//", "==", "/=", "<=", ">=", "=>", "::", "*", "/", "+", "-", "<", ">", "=", "%", ":",
    ",", "(", ")", "[", "]",
];

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Does `rest` start with a dotted operator or logical constant?
fn dot_word_ahead(rest: &str) -> bool {
    let Some(body) = rest.strip_prefix('.') else {
        return false;
    };
    let word: String = body.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    !word.is_empty()
        && body[word.len()..].starts_with('.')
        && DOTTED_WORDS.contains(&word.to_ascii_lowercase().as_str())
}

fn digits<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    take_while(1.., |c: char| c.is_ascii_digit()).parse_next(input)
}

fn exponent(input: &mut &str) -> ModalResult<()> {
    (one_of(['e', 'E', 'd', 'D']), opt(one_of(['+', '-'])), digits)
        .void()
        .parse_next(input)
}

fn kind_suffix(input: &mut &str) -> ModalResult<()> {
    preceded('_', take_while(1.., is_name_char))
        .void()
        .parse_next(input)
}

fn number<'s>(input: &mut &'s str) -> ModalResult<(TokKind, &'s str)> {
    let start = *input;
    let whole = opt(digits).parse_next(input)?;
    let mut real = false;
    if input.starts_with('.') && !dot_word_ahead(input) {
        let _ = '.'.parse_next(input)?;
        let fraction = opt(digits).parse_next(input)?;
        if whole.is_none() && fraction.is_none() {
            *input = start;
            return Err(ErrMode::from_input(input));
        }
        real = true;
    } else if whole.is_none() {
        return Err(ErrMode::from_input(input));
    }
    if opt(exponent).parse_next(input)?.is_some() {
        real = true;
    }
    opt(kind_suffix).parse_next(input)?;
    let len = start.len() - input.len();
    let kind = if real { TokKind::Real } else { TokKind::Int };
    Ok((kind, &start[..len]))
}

fn string<'s>(input: &mut &'s str) -> ModalResult<(TokKind, &'s str)> {
    let start = *input;
    let mut quote = one_of(['\'', '"']).parse_next(input)?;
    loop {
        let _ = take_till(0.., move |c: char| c == quote).parse_next(input)?;
        let _ = quote.parse_next(input)?;
        // A doubled quote is an escaped quote.
        if !input.starts_with(quote) {
            break;
        }
        let _ = quote.parse_next(input)?;
    }
    let len = start.len() - input.len();
    Ok((TokKind::Str, &start[..len]))
}

fn dotted<'s>(input: &mut &'s str) -> ModalResult<(TokKind, &'s str)> {
    let start = *input;
    let word: &str = preceded('.', take_while(1.., |c: char| c.is_ascii_alphabetic())).parse_next(input)?;
    let _ = '.'.parse_next(input)?;
    let lower = word.to_ascii_lowercase();
    let kind = if lower == "true" || lower == "false" {
        opt(kind_suffix).parse_next(input)?;
        TokKind::Logical
    } else {
        TokKind::DotOp
    };
    let len = start.len() - input.len();
    Ok((kind, &start[..len]))
}

fn name<'s>(input: &mut &'s str) -> ModalResult<(TokKind, &'s str)> {
    let start = *input;
    let _ = one_of(|c: char| c.is_ascii_alphabetic()).parse_next(input)?;
    let _ = take_while(0.., is_name_char).parse_next(input)?;
    let len = start.len() - input.len();
    Ok((TokKind::Name, &start[..len]))
}

fn operator<'s>(input: &mut &'s str) -> ModalResult<(TokKind, &'s str)> {
    for op in OPERATORS {
        if input.starts_with(op) {
            let (text, rest) = input.split_at(op.len());
            *input = rest;
            return Ok((TokKind::Op, text));
        }
    }
    Err(ErrMode::from_input(input))
}

fn token<'s>(input: &mut &'s str) -> ModalResult<(TokKind, &'s str)> {
    alt((string, dotted, number, name, operator)).parse_next(input)
}

/// Tokenize one statement.
pub fn tokenize(code: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut input = code;
    let mut tokens = Vec::new();
    loop {
        let _: ModalResult<&str> = multispace0.parse_next(&mut input);
        if input.is_empty() {
            break;
        }
        let offset = code.len() - input.len();
        let (kind, text) = token.parse_next(&mut input).map_err(|_| LexError {
            offset,
            message: format!(
                "unexpected character '{}'",
                input.chars().next().unwrap_or(' ')
            ),
        })?;
        tokens.push(Token { kind, text, offset });
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(code: &str) -> Vec<(TokKind, &str)> {
        tokenize(code)
            .unwrap()
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn numbers_and_dotted_operators() {
        assert_eq!(
            kinds("1.eq.2"),
            vec![
                (TokKind::Int, "1"),
                (TokKind::DotOp, ".eq."),
                (TokKind::Int, "2")
            ]
        );
        assert_eq!(kinds("1.5d-3_jprb")[0], (TokKind::Real, "1.5d-3_jprb"));
        assert_eq!(kinds(".5")[0], (TokKind::Real, ".5"));
        assert_eq!(kinds("1.e5")[0], (TokKind::Real, "1.e5"));
        assert_eq!(kinds(".TRUE._jplm")[0], (TokKind::Logical, ".TRUE._jplm"));
    }

    #[test]
    fn strings_with_doubled_quotes() {
        assert_eq!(kinds("'it''s' // \"x\""), vec![
            (TokKind::Str, "'it''s'"),
            (TokKind::Op, "//"),
            (TokKind::Str, "\"x\""),
        ]);
    }

    #[test]
    fn longest_operator_wins() {
        let toks = kinds("a**2 /= b => c :: d");
        let ops: Vec<&str> = toks
            .iter()
            .filter(|(k, _)| *k == TokKind::Op)
            .map(|(_, t)| *t)
            .collect();
        assert_eq!(ops, vec!["**", "/=", "=>", "::"]);
    }

    #[test]
    fn offsets_point_into_the_statement() {
        let toks = tokenize("call  foo(x)").unwrap();
        assert_eq!(toks[1].offset, 6);
        assert!(toks[0].is_name("CALL"));
    }

    #[test]
    fn unknown_character_is_an_error() {
        let err = tokenize("a = b ? c").unwrap_err();
        assert_eq!(err.offset, 6);
    }
}
