//! Syntax engines.
//!
//! Each engine turns source text into its own tree shape; the matching
//! adapter in [`crate::adapter`] maps that tree onto the IR.
//!
//! - [`lines`]: winnow tokenizer and precedence-climbing expressions over a
//!   flat stream of classified statements
//! - [`tree`]: peg statement grammar plus a recursive construct builder with
//!   wrapper nodes
//! - [`external`]: an external program printing a JSON tree

pub mod external;
pub mod lines;
pub mod tree;

use crate::reader::leading_word;

/// Where a statement belongs inside a program unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Specification part (declarations, `use`, `implicit`, ...).
    Spec,
    /// Execution part.
    Exec,
    /// Comments, directives and preprocessor lines: follow their neighbours.
    Neutral,
}

/// Role of a statement kept as opaque text, from its leading keyword.
pub fn keyword_role(keyword: &str) -> Role {
    match keyword {
        "integer" | "real" | "double" | "doubleprecision" | "complex" | "logical" | "character"
        | "type" | "class" | "interface" | "abstract" | "enum" | "parameter" | "data"
        | "common" | "equivalence" | "save" | "external" | "intrinsic" | "namelist"
        | "dimension" | "allocatable" | "pointer" | "target" | "optional" | "public"
        | "private" | "protected" | "sequence" | "import" | "procedure" | "generic"
        | "volatile" | "asynchronous" | "bind" | "value" | "contiguous" | "use" | "implicit"
        | "include" => Role::Spec,
        "format" | "" => Role::Neutral,
        _ => Role::Exec,
    }
}

/// Words of dotted operators and logical constants (`.eq.`, `.true.`).
pub const DOTTED_WORDS: &[&str] = &[
    "eq", "ne", "lt", "le", "gt", "ge", "and", "or", "not", "eqv", "neqv", "true", "false",
];

/// Prefixes allowed before `subroutine` / `function`.
pub const UNIT_PREFIXES: &[&str] = &["pure", "impure", "elemental", "recursive", "module"];

const END_KEYWORDS: &[&str] = &[
    "do",
    "if",
    "block",
    "subroutine",
    "function",
    "program",
    "module",
];

/// `end`, or `end` fused with a construct keyword (`enddo`, `endif`, ...).
pub fn is_end_keyword(word: &str) -> bool {
    word == "end"
        || word
            .strip_prefix("end")
            .is_some_and(|rest| END_KEYWORDS.contains(&rest))
}

/// Could this statement open or close structure? A statement that looks
/// structural but does not parse is a hard error; anything else that does
/// not parse is kept as opaque text.
pub fn looks_structural(code: &str) -> bool {
    let lower = code.trim_start().to_ascii_lowercase();
    let word = leading_word(&lower);
    let rest = lower[word.len()..].trim_start();
    if rest.starts_with("=>") || (rest.starts_with('=') && !rest.starts_with("==")) {
        return false;
    }
    match word.as_str() {
        "module" | "program" | "subroutine" | "function" | "contains" | "else" | "elseif"
        | "block" | "do" => !rest.starts_with('('),
        "if" => lower.trim_end().ends_with("then"),
        w if is_end_keyword(w) => true,
        w if UNIT_PREFIXES.contains(&w) => true,
        _ => false,
    }
}

/// Index splitting a statement list into specification and execution parts.
///
/// The specification part ends with the last specification statement before
/// the first executable one; comments after it go with the execution part.
pub fn split_point(roles: &[Role]) -> usize {
    let first_exec = roles
        .iter()
        .position(|r| *r == Role::Exec)
        .unwrap_or(roles.len());
    roles[..first_exec]
        .iter()
        .rposition(|r| *r == Role::Spec)
        .map_or(0, |last| last + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_comments_go_to_the_body() {
        use Role::*;
        assert_eq!(split_point(&[Neutral, Spec, Neutral, Spec, Neutral, Exec]), 4);
        assert_eq!(split_point(&[Exec, Spec]), 0);
        assert_eq!(split_point(&[Spec, Neutral]), 1);
        assert_eq!(split_point(&[]), 0);
    }

    #[test]
    fn structural_statements() {
        assert!(looks_structural("do i = "));
        assert!(looks_structural("END SUBROUTINE foo"));
        assert!(looks_structural("if (x) then"));
        assert!(!looks_structural("if (x) call y"));
        assert!(!looks_structural("do = 3"));
        assert!(!looks_structural("endpoint = 1"));
    }

    #[test]
    fn opaque_statements_by_keyword() {
        assert_eq!(keyword_role("common"), Role::Spec);
        assert_eq!(keyword_role("print"), Role::Exec);
        assert_eq!(keyword_role("format"), Role::Neutral);
    }
}
