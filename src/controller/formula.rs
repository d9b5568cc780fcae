//! `=LLM(...)` formulas
//!
//! `=LLM(prompt)` or `=LLM(prompt, system)`. Each argument is either a
//! double-quoted string literal (`""` escapes a quote) or an A1 reference
//! whose displayed value is read when the formula is submitted.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::controller::sheet::CellSurface;
use crate::types::{A1ParseError, CellAddress, ChatTurn};

static CALL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*=\s*LLM\s*\((.*)\)\s*$").expect("valid formula regex"));

/// Errors produced while parsing or resolving a formula
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
    #[error("Not an LLM formula")]
    NotLlm,

    #[error("LLM takes 1 or 2 arguments, got {0}")]
    Arity(usize),

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Invalid argument: {0}")]
    BadArgument(String),

    #[error("Invalid reference: {0}")]
    Reference(#[from] A1ParseError),

    #[error("Prompt is empty")]
    EmptyPrompt,
}

/// One formula argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Text(String),
    Reference(CellAddress),
}

impl Argument {
    fn resolve(&self, surface: &dyn CellSurface) -> String {
        match self {
            Argument::Text(text) => text.clone(),
            Argument::Reference(addr) => surface.get_value(*addr),
        }
    }
}

/// A parsed `=LLM(...)` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmCall {
    pub prompt: Argument,
    pub system: Option<Argument>,
}

impl LlmCall {
    /// Build the request turns, reading referenced cells from `surface`.
    ///
    /// `default_system` is used when the formula names no system prompt; an
    /// empty system prompt is omitted.
    pub fn resolve(
        &self,
        surface: &dyn CellSurface,
        default_system: &str,
    ) -> Result<Vec<ChatTurn>, FormulaError> {
        let prompt = self.prompt.resolve(surface);
        if prompt.trim().is_empty() {
            return Err(FormulaError::EmptyPrompt);
        }
        let system = match &self.system {
            Some(arg) => arg.resolve(surface),
            None => default_system.to_string(),
        };

        let mut turns = Vec::with_capacity(2);
        if !system.trim().is_empty() {
            turns.push(ChatTurn::system(system));
        }
        turns.push(ChatTurn::user(prompt));
        Ok(turns)
    }
}

/// Whether `text` looks like an `=LLM(...)` formula
pub fn is_llm_formula(text: &str) -> bool {
    CALL_PATTERN.is_match(text)
}

/// Parse an `=LLM(...)` formula.
pub fn parse(formula: &str) -> Result<LlmCall, FormulaError> {
    let caps = CALL_PATTERN
        .captures(formula)
        .ok_or(FormulaError::NotLlm)?;

    let mut args = split_arguments(&caps[1])?
        .into_iter()
        .map(|raw| parse_argument(&raw))
        .collect::<Result<Vec<_>, _>>()?;

    match args.len() {
        1 => Ok(LlmCall {
            prompt: args.remove(0),
            system: None,
        }),
        2 => {
            let system = args.pop();
            Ok(LlmCall {
                prompt: args.remove(0),
                system,
            })
        }
        n => Err(FormulaError::Arity(n)),
    }
}

/// Split on top-level commas, keeping string literals intact.
fn split_arguments(body: &str) -> Result<Vec<String>, FormulaError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    for c in body.chars() {
        match c {
            '"' => {
                // a doubled quote toggles twice and stays inside the literal
                in_string = !in_string;
                current.push(c);
            }
            ',' if !in_string => args.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if in_string {
        return Err(FormulaError::UnterminatedString);
    }
    args.push(current);
    Ok(args)
}

fn parse_argument(raw: &str) -> Result<Argument, FormulaError> {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| FormulaError::BadArgument(raw.to_string()))?;
        // an odd quote inside means text followed the closing quote
        if inner.replace("\"\"", "").contains('"') {
            return Err(FormulaError::BadArgument(raw.to_string()));
        }
        return Ok(Argument::Text(inner.replace("\"\"", "\"")));
    }
    if raw.is_empty() {
        return Err(FormulaError::BadArgument(raw.to_string()));
    }
    Ok(Argument::Reference(CellAddress::from_a1(raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::sheet::MemorySheet;

    #[test]
    fn test_parse_literal_prompt() {
        let call = parse(r#"=LLM("Say hello")"#).unwrap();
        assert_eq!(call.prompt, Argument::Text("Say hello".to_string()));
        assert_eq!(call.system, None);
    }

    #[test]
    fn test_parse_is_case_insensitive_and_tolerates_spaces() {
        let call = parse(r#"  = llm ( B2 , "be brief" ) "#).unwrap();
        assert_eq!(call.prompt, Argument::Reference(CellAddress::new(1, 1)));
        assert_eq!(call.system, Some(Argument::Text("be brief".to_string())));
    }

    #[test]
    fn test_commas_and_quotes_inside_literals() {
        let call = parse(r#"=LLM("a, b and ""c""")"#).unwrap();
        assert_eq!(call.prompt, Argument::Text(r#"a, b and "c""#.to_string()));
    }

    #[test]
    fn test_rejects_non_llm_and_bad_arity() {
        assert_eq!(parse("=SUM(A1:A3)"), Err(FormulaError::NotLlm));
        assert_eq!(parse("hello"), Err(FormulaError::NotLlm));
        assert_eq!(parse("=LLM()"), Err(FormulaError::Arity(0)));
        assert_eq!(parse(r#"=LLM("a","b","c")"#), Err(FormulaError::Arity(3)));
    }

    #[test]
    fn test_rejects_malformed_arguments() {
        assert_eq!(parse(r#"=LLM("open)"#), Err(FormulaError::UnterminatedString));
        assert!(matches!(
            parse(r#"=LLM("a"b)"#),
            Err(FormulaError::BadArgument(_))
        ));
        assert!(matches!(parse("=LLM(1+2)"), Err(FormulaError::Reference(_))));
        assert!(matches!(parse(r#"=LLM("a", )"#), Err(FormulaError::BadArgument(_))));
    }

    #[test]
    fn test_resolve_reads_referenced_cells() {
        let mut sheet = MemorySheet::new();
        sheet.set_value(CellAddress::new(0, 1), "What is Rust?");
        sheet.set_value(CellAddress::new(1, 1), "Answer in one word.");

        let call = parse("=LLM(B1, B2)").unwrap();
        let turns = call.resolve(&sheet, "default").unwrap();
        assert_eq!(
            turns,
            vec![
                ChatTurn::system("Answer in one word."),
                ChatTurn::user("What is Rust?"),
            ]
        );
    }

    #[test]
    fn test_resolve_uses_default_system_prompt() {
        let sheet = MemorySheet::new();
        let call = parse(r#"=LLM("hi")"#).unwrap();

        let turns = call.resolve(&sheet, "be nice").unwrap();
        assert_eq!(turns[0], ChatTurn::system("be nice"));

        let turns = call.resolve(&sheet, "").unwrap();
        assert_eq!(turns, vec![ChatTurn::user("hi")]);
    }

    #[test]
    fn test_resolve_blank_reference_is_empty_prompt() {
        let sheet = MemorySheet::new();
        let call = parse("=LLM(Z9)").unwrap();
        assert_eq!(call.resolve(&sheet, ""), Err(FormulaError::EmptyPrompt));
    }

    #[test]
    fn test_is_llm_formula() {
        assert!(is_llm_formula(r#"=LLM("x")"#));
        assert!(!is_llm_formula("=SUM(1)"));
    }
}
