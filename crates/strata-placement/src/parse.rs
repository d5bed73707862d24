//! Parser for the text form of a placement policy.
//!
//! ```text
//! REP 1 IN SPB
//! REP 2 IN Any
//! CBF 2
//! SELECT 1 IN SAME City FROM SPBNodes AS SPB
//! SELECT 2 FROM * AS Any
//! FILTER City EQ "Saint Petersburg" AND Rating GE 4 AS SPBNodes
//! ```
//!
//! The grammar lives in `policy.pest`. The output is an uncompiled
//! `PlacementPolicy`; `PlacementPolicy`'s `Display` writes the same form.

use pest::iterators::Pair;
use pest::Parser;
use strata_types::{Clause, Filter, Operation, PlacementPolicy, Replica, Selector, MATCH_ALL};

use grammar::{PolicyGrammar, Rule};

mod grammar {
    #[derive(pest_derive::Parser)]
    #[grammar = "policy.pest"]
    pub(super) struct PolicyGrammar;
}

/// Deepest parenthesis nesting accepted in filter expressions.
pub const MAX_NESTING: usize = 32;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("{line}:{column}: invalid number '{text}'")]
    InvalidNumber { line: usize, column: usize, text: String },
    #[error("{line}:{column}: expression nested deeper than {limit} levels")]
    TooDeep { line: usize, column: usize, limit: usize },
    #[error("policy has no REP statement")]
    NoReplicas,
}

pub fn parse_policy(text: &str) -> Result<PlacementPolicy, ParseError> {
    check_nesting(text)?;
    let pairs = PolicyGrammar::parse(Rule::policy, text).map_err(syntax_error)?;

    let mut policy = PlacementPolicy::default();
    for pair in pairs {
        if pair.as_rule() != Rule::policy {
            continue;
        }
        for statement in pair.into_inner() {
            match statement.as_rule() {
                Rule::rep => policy.replicas.push(replica(statement)?),
                Rule::cbf => policy.container_backup_factor = single_number(statement)?,
                Rule::subnet => policy.subnet_id = single_number(statement)?,
                Rule::select => policy.selectors.push(selector(statement)?),
                Rule::filter => policy.filters.push(filter_statement(statement)),
                _ => {}
            }
        }
    }

    if policy.replicas.is_empty() {
        return Err(ParseError::NoReplicas);
    }
    Ok(policy)
}

/// Rejects input whose parentheses nest past [`MAX_NESTING`] before the
/// grammar (and the expression builder) recurse into it.
fn check_nesting(text: &str) -> Result<(), ParseError> {
    let (mut line, mut column, mut depth) = (1usize, 1usize, 0usize);
    let (mut in_string, mut escaped) = (false, false);
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '(' => {
                    depth += 1;
                    if depth > MAX_NESTING {
                        return Err(ParseError::TooDeep { line, column, limit: MAX_NESTING });
                    }
                }
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    Ok(())
}

fn syntax_error(e: pest::error::Error<Rule>) -> ParseError {
    let e = e.renamed_rules(|rule| describe(rule).to_string());
    let (line, column) = match e.line_col {
        pest::error::LineColLocation::Pos((line, col)) => (line, col),
        pest::error::LineColLocation::Span((line, col), _) => (line, col),
    };
    ParseError::Syntax { line, column, message: e.variant.message().into_owned() }
}

fn describe(rule: &Rule) -> &'static str {
    match rule {
        Rule::rep | Rule::cbf | Rule::subnet | Rule::select | Rule::filter => {
            "REP, CBF, SUBNET, SELECT or FILTER"
        }
        Rule::kw_rep => "REP",
        Rule::kw_in => "IN",
        Rule::kw_as => "AS",
        Rule::kw_cbf => "CBF",
        Rule::kw_subnet => "SUBNET",
        Rule::kw_select => "SELECT",
        Rule::kw_from => "FROM",
        Rule::kw_filter => "FILTER",
        Rule::kw_and => "AND",
        Rule::kw_or => "OR",
        Rule::same => "SAME",
        Rule::distinct => "DISTINCT",
        Rule::number => "number",
        Rule::ident | Rule::bare | Rule::quoted => "name or value",
        Rule::source | Rule::star => "filter name or '*'",
        Rule::cmp_op => "comparison operator",
        Rule::reference => "'@' reference",
        Rule::comparison | Rule::or_expr | Rule::and_expr => "filter expression",
        Rule::EOI => "end of policy",
        _ => "token",
    }
}

fn number(pair: Pair<'_, Rule>) -> Result<u32, ParseError> {
    pair.as_str().parse().map_err(|_| {
        let (line, column) = pair.line_col();
        ParseError::InvalidNumber { line, column, text: pair.as_str().to_string() }
    })
}

fn single_number(pair: Pair<'_, Rule>) -> Result<u32, ParseError> {
    match pair.into_inner().find(|p| p.as_rule() == Rule::number) {
        Some(n) => number(n),
        None => Ok(0),
    }
}

fn ident(pair: Pair<'_, Rule>) -> String {
    match pair.into_inner().next() {
        Some(p) if p.as_rule() == Rule::quoted => {
            unescape(p.into_inner().next().map_or("", |inner| inner.as_str()))
        }
        Some(p) => p.as_str().to_string(),
        None => String::new(),
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

fn replica(pair: Pair<'_, Rule>) -> Result<Replica, ParseError> {
    let mut replica = Replica::default();
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::number => replica.count = number(p)?,
            Rule::ident => replica.selector = ident(p),
            _ => {}
        }
    }
    Ok(replica)
}

fn selector(pair: Pair<'_, Rule>) -> Result<Selector, ParseError> {
    let mut selector = Selector::default();
    let mut after_source = false;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::number => selector.count = number(p)?,
            Rule::same => selector.clause = Clause::Same,
            Rule::distinct => selector.clause = Clause::Distinct,
            Rule::ident if !after_source => selector.attribute = ident(p),
            Rule::source => {
                after_source = true;
                selector.filter = match p.into_inner().next() {
                    Some(name) if name.as_rule() == Rule::ident => ident(name),
                    _ => MATCH_ALL.to_string(),
                };
            }
            Rule::ident => selector.name = ident(p),
            _ => {}
        }
    }
    Ok(selector)
}

fn filter_statement(pair: Pair<'_, Rule>) -> Filter {
    let mut expr = Filter::default();
    let mut name = String::new();
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::or_expr => expr = expression(p),
            Rule::ident => name = ident(p),
            _ => {}
        }
    }
    // A definition needs an operation; a bare reference becomes AND(ref).
    if expr.is_reference() {
        Filter::and(name, vec![expr])
    } else {
        expr.name = name;
        expr
    }
}

/// Builds an `or_expr` or `and_expr`. A chain collapses into one composite
/// and a single operand is returned as is.
fn expression(pair: Pair<'_, Rule>) -> Filter {
    let rule = pair.as_rule();
    let children: Vec<Filter> = pair
        .into_inner()
        .filter_map(|p| match p.as_rule() {
            Rule::or_expr | Rule::and_expr => Some(expression(p)),
            Rule::reference => Some(reference(p)),
            Rule::comparison => Some(comparison(p)),
            _ => None,
        })
        .collect();

    let children = match <[Filter; 1]>::try_from(children) {
        Ok([only]) => return only,
        Err(children) => children,
    };
    match rule {
        Rule::and_expr => Filter::and("", children),
        _ => Filter::or("", children),
    }
}

fn reference(pair: Pair<'_, Rule>) -> Filter {
    match pair.into_inner().next() {
        Some(p) if p.as_rule() == Rule::ident => Filter::reference(ident(p)),
        _ => Filter::reference(MATCH_ALL),
    }
}

fn comparison(pair: Pair<'_, Rule>) -> Filter {
    let (mut key, mut value) = (String::new(), String::new());
    let mut op = Operation::Unspecified;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::ident if op == Operation::Unspecified => key = ident(p),
            Rule::cmp_op => op = operation(p.as_str()),
            Rule::ident => value = ident(p),
            _ => {}
        }
    }
    Filter::compare("", key, op, value)
}

fn operation(word: &str) -> Operation {
    match word.to_ascii_uppercase().as_str() {
        "EQ" => Operation::Eq,
        "NE" => Operation::Ne,
        "GT" => Operation::Gt,
        "GE" => Operation::Ge,
        "LT" => Operation::Lt,
        "LE" => Operation::Le,
        _ => Operation::Unspecified,
    }
}
