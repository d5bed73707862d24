use std::fmt;

use crate::SubnetId;

/// Filter name meaning "every node", usable wherever a filter name is expected.
pub const MATCH_ALL: &str = "*";

/// Filter operation as decoded from the policy message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Only valid on a nested filter, where it marks a reference by name.
    #[default]
    Unspecified,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Or,
    And,
}

impl Operation {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operation::Eq | Operation::Ne | Operation::Gt | Operation::Ge | Operation::Lt | Operation::Le
        )
    }

    pub fn is_composite(self) -> bool {
        matches!(self, Operation::Or | Operation::And)
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Operation::Unspecified => "UNSPECIFIED",
            Operation::Eq => "EQ",
            Operation::Ne => "NE",
            Operation::Gt => "GT",
            Operation::Ge => "GE",
            Operation::Lt => "LT",
            Operation::Le => "LE",
            Operation::Or => "OR",
            Operation::And => "AND",
        }
    }
}

/// Named filter, either a top-level definition or a nested child.
///
/// A nested child with `op == Unspecified` and a non-empty `name` is a
/// reference to the top-level filter of that name.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub op: Operation,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

impl Filter {
    pub fn compare(
        name: impl Into<String>,
        key: impl Into<String>,
        op: Operation,
        value: impl Into<String>,
    ) -> Self {
        Filter {
            name: name.into(),
            key: key.into(),
            op,
            value: value.into(),
            filters: Vec::new(),
        }
    }

    pub fn and(name: impl Into<String>, filters: Vec<Filter>) -> Self {
        Filter { name: name.into(), op: Operation::And, filters, ..Default::default() }
    }

    pub fn or(name: impl Into<String>, filters: Vec<Filter>) -> Self {
        Filter { name: name.into(), op: Operation::Or, filters, ..Default::default() }
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Filter { name: name.into(), ..Default::default() }
    }

    pub fn is_reference(&self) -> bool {
        self.op == Operation::Unspecified && !self.name.is_empty()
    }
}

/// How a selector draws nodes from attribute buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Clause {
    /// Whole filtered pool treated as one bucket.
    #[default]
    Unspecified,
    /// All chosen nodes share one attribute value.
    Same,
    /// At most one node per attribute value.
    Distinct,
}

/// Named rule drawing nodes from the buckets of `attribute`.
///
/// A replica placed through this selector sizes its group by the
/// replica's own `count` (times the backup factor) and takes nodes from the
/// selector's full ranking; the selector's `count` only bounds a standalone
/// run of the selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Selector {
    pub name: String,
    /// Nodes returned when the selector is run on its own.
    pub count: u32,
    #[serde(default)]
    pub clause: Clause,
    #[serde(default)]
    pub attribute: String,
    pub filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Replica {
    pub count: u32,
    /// Empty means the whole filtered network map.
    #[serde(default)]
    pub selector: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlacementPolicy {
    pub replicas: Vec<Replica>,
    #[serde(default)]
    pub container_backup_factor: u32,
    #[serde(default)]
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub subnet_id: SubnetId,
}

// ---------------------------------------------------------------------------
// Text form
// ---------------------------------------------------------------------------

const KEYWORDS: &[&str] = &[
    "REP", "IN", "AS", "CBF", "SUBNET", "SELECT", "FROM", "FILTER", "SAME", "DISTINCT", "AND",
    "OR", "EQ", "NE", "GT", "GE", "LT", "LE",
];

fn is_bare_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/')
}

/// Writes `s` bare when the policy lexer would read it back as one word,
/// quoted otherwise.
fn write_word(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let bare = !s.is_empty()
        && s.chars().all(is_bare_char)
        && !KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(s));
    if bare {
        return f.write_str(s);
    }
    f.write_str("\"")?;
    for c in s.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

fn write_filter_expr(f: &mut fmt::Formatter<'_>, filter: &Filter) -> fmt::Result {
    match filter.op {
        Operation::Unspecified => {
            f.write_str("@")?;
            write_word(f, &filter.name)
        }
        Operation::And | Operation::Or => {
            let sep = if filter.op == Operation::And { " AND " } else { " OR " };
            for (i, child) in filter.filters.iter().enumerate() {
                if i > 0 {
                    f.write_str(sep)?;
                }
                // AND binds tighter than OR, so only OR inside AND needs parens.
                let wrap = filter.op == Operation::And && child.op == Operation::Or;
                if wrap {
                    f.write_str("(")?;
                }
                write_filter_expr(f, child)?;
                if wrap {
                    f.write_str(")")?;
                }
            }
            Ok(())
        }
        op => {
            write_word(f, &filter.key)?;
            write!(f, " {} ", op.keyword())?;
            write_word(f, &filter.value)
        }
    }
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = 0usize;
        let mut newline = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            lines += 1;
            if lines > 1 {
                f.write_str("\n")?;
            }
            Ok(())
        };

        for r in &self.replicas {
            newline(f)?;
            write!(f, "REP {}", r.count)?;
            if !r.selector.is_empty() {
                f.write_str(" IN ")?;
                write_word(f, &r.selector)?;
            }
        }
        if self.container_backup_factor > 0 {
            newline(f)?;
            write!(f, "CBF {}", self.container_backup_factor)?;
        }
        if self.subnet_id > 0 {
            newline(f)?;
            write!(f, "SUBNET {}", self.subnet_id)?;
        }
        for s in &self.selectors {
            newline(f)?;
            write!(f, "SELECT {}", s.count)?;
            if !s.attribute.is_empty() {
                f.write_str(" IN ")?;
                match s.clause {
                    Clause::Same => f.write_str("SAME ")?,
                    Clause::Distinct => f.write_str("DISTINCT ")?,
                    Clause::Unspecified => {}
                }
                write_word(f, &s.attribute)?;
            }
            f.write_str(" FROM ")?;
            if s.filter == MATCH_ALL {
                f.write_str(MATCH_ALL)?;
            } else {
                write_word(f, &s.filter)?;
            }
            f.write_str(" AS ")?;
            write_word(f, &s.name)?;
        }
        for flt in &self.filters {
            newline(f)?;
            f.write_str("FILTER ")?;
            write_filter_expr(f, flt)?;
            f.write_str(" AS ")?;
            write_word(f, &flt.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_form() {
        let policy = PlacementPolicy {
            replicas: vec![
                Replica { count: 1, selector: "SPB".into() },
                Replica { count: 2, selector: String::new() },
            ],
            container_backup_factor: 3,
            selectors: vec![Selector {
                name: "SPB".into(),
                count: 1,
                clause: Clause::Same,
                attribute: "City".into(),
                filter: "SPBNodes".into(),
            }],
            filters: vec![Filter::and(
                "SPBNodes",
                vec![
                    Filter::compare("", "City", Operation::Eq, "Saint Petersburg"),
                    Filter::or(
                        "",
                        vec![
                            Filter::reference("Good"),
                            Filter::compare("", "Rating", Operation::Ge, "4"),
                        ],
                    ),
                ],
            )],
            subnet_id: 0,
        };

        let expected = "REP 1 IN SPB\n\
                        REP 2\n\
                        CBF 3\n\
                        SELECT 1 IN SAME City FROM SPBNodes AS SPB\n\
                        FILTER City EQ \"Saint Petersburg\" AND (@Good OR Rating GE 4) AS SPBNodes";
        assert_eq!(policy.to_string(), expected);
    }

    #[test]
    fn keywords_and_specials_are_quoted() {
        let policy = PlacementPolicy {
            replicas: vec![Replica { count: 1, selector: "in".into() }],
            selectors: vec![Selector {
                name: "in".into(),
                count: 1,
                filter: MATCH_ALL.into(),
                ..Default::default()
            }],
            filters: vec![Filter::compare("f", "Quote", Operation::Ne, "a\"b")],
            ..Default::default()
        };
        let text = policy.to_string();
        assert!(text.contains("REP 1 IN \"in\""));
        assert!(text.contains("FROM * AS \"in\""));
        assert!(text.contains("Quote NE \"a\\\"b\""));
    }

    #[test]
    fn policy_from_json_defaults() {
        let raw = r#"{
            "replicas": [{"count": 2, "selector": "s"}],
            "selectors": [{"name": "s", "count": 2, "clause": "DISTINCT",
                           "attribute": "City", "filter": "*"}]
        }"#;
        let policy: PlacementPolicy = serde_json::from_str(raw).unwrap();
        assert_eq!(policy.container_backup_factor, 0);
        assert_eq!(policy.subnet_id, 0);
        assert_eq!(policy.selectors[0].clause, Clause::Distinct);
        assert!(policy.filters.is_empty());
    }
}
