//! PromQL expressions.
//!
//! [`parse`] builds an [`Expr`] tree, [`Expr`]'s `Display` writes it back as
//! PromQL text, and [`enforce`] scopes every vector selector in a query to a
//! set of tenants.

mod parser;

use std::collections::BTreeSet;
use std::fmt;

use tracing::trace;

use crate::enforce::{ScopedExpr, scope_selectors};
use crate::error::EnforceError;
use crate::matcher::{Matcher, write_joined, write_matchers};
use crate::ops::{Binary, Grouping, UnaryOp};

pub use parser::parse;

/// Query substituted for an empty `query` parameter.
pub const DEFAULT_QUERY: &str = r#"{__name__=~".+"}"#;

/// A PromQL expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Number literal as written.
    Number(String),
    /// String literal, unescaped.
    String(String),
    /// Instant vector selector.
    Selector(VectorSelector),
    /// Range vector selector.
    Matrix(MatrixSelector),
    /// Subquery.
    Subquery(Subquery),
    /// Function call.
    Call(Call),
    /// Aggregation.
    Aggregate(Aggregate),
    /// Unary sign.
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation.
    Binary(Box<Binary<Expr>>),
    /// Parenthesised expression.
    Paren(Box<Expr>),
}

/// `@` modifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum At {
    /// `@ <timestamp>`
    Timestamp(String),
    /// `@ start()`
    Start,
    /// `@ end()`
    End,
}

/// `offset` and `@` modifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifiers {
    /// Offset duration, with a leading `-` when negative.
    pub offset: Option<String>,
    /// Evaluation time.
    pub at: Option<At>,
}

impl Modifiers {
    /// Returns true if neither modifier is set.
    pub fn is_empty(&self) -> bool {
        self.offset.is_none() && self.at.is_none()
    }
}

impl fmt::Display for Modifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.at {
            Some(At::Timestamp(ts)) => write!(f, " @ {ts}")?,
            Some(At::Start) => f.write_str(" @ start()")?,
            Some(At::End) => f.write_str(" @ end()")?,
            None => {}
        }
        if let Some(offset) = &self.offset {
            write!(f, " offset {offset}")?;
        }
        Ok(())
    }
}

/// `name{matchers}` with optional modifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorSelector {
    /// Metric name written before the braces.
    pub name: Option<String>,
    /// Label matchers inside the braces.
    pub matchers: Vec<Matcher>,
    /// Modifiers. For a matrix selector these follow the range.
    pub modifiers: Modifiers,
}

impl VectorSelector {
    fn fmt_base(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            f.write_str(name)?;
        }
        if self.name.is_none() || !self.matchers.is_empty() {
            write_matchers(f, &self.matchers)?;
        }
        Ok(())
    }
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_base(f)?;
        write!(f, "{}", self.modifiers)
    }
}

/// `selector[range]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSelector {
    /// The underlying selector.
    pub selector: VectorSelector,
    /// Range duration.
    pub range: String,
}

impl fmt::Display for MatrixSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.selector.fmt_base(f)?;
        write!(f, "[{}]{}", self.range, self.selector.modifiers)
    }
}

/// `expr[range:step]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subquery {
    /// Inner expression.
    pub expr: Box<Expr>,
    /// Range duration.
    pub range: String,
    /// Resolution step; defaults to the global evaluation interval.
    pub step: Option<String>,
    /// Modifiers.
    pub modifiers: Modifiers,
}

impl fmt::Display for Subquery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}:{}]{}",
            self.expr,
            self.range,
            self.step.as_deref().unwrap_or_default(),
            self.modifiers
        )
    }
}

/// `func(args...)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Function name.
    pub func: String,
    /// Arguments.
    pub args: Vec<Expr>,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.func)?;
        write_joined(f, &self.args, ", ")?;
        f.write_str(")")
    }
}

/// `op by (labels) ([param,] expr)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    /// Aggregation operator, lowercase.
    pub op: String,
    /// Grouping clause.
    pub grouping: Option<Grouping>,
    /// Parameter of `topk`, `quantile`, `count_values` and friends.
    pub param: Option<Box<Expr>>,
    /// Aggregated expression.
    pub expr: Box<Expr>,
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.op)?;
        if let Some(grouping) = &self.grouping {
            write!(f, " {grouping} ")?;
        }
        f.write_str("(")?;
        if let Some(param) = &self.param {
            write!(f, "{param}, ")?;
        }
        write!(f, "{})", self.expr)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => f.write_str(n),
            Expr::String(s) => write!(f, "{}", crate::matcher::Quoted(s)),
            Expr::Selector(s) => write!(f, "{s}"),
            Expr::Matrix(m) => write!(f, "{m}"),
            Expr::Subquery(s) => write!(f, "{s}"),
            Expr::Call(c) => write!(f, "{c}"),
            Expr::Aggregate(a) => write!(f, "{a}"),
            Expr::Unary(op, e) => write!(f, "{op}{e}"),
            Expr::Binary(b) => write!(f, "{b}"),
            Expr::Paren(e) => write!(f, "({e})"),
        }
    }
}

impl Expr {
    /// Returns every vector selector in the tree, including those inside
    /// matrix selectors and subqueries.
    pub fn selectors_mut(&mut self) -> Vec<&mut VectorSelector> {
        let mut out = Vec::new();
        self.collect_selectors(&mut out);
        out
    }

    fn collect_selectors<'a>(&'a mut self, out: &mut Vec<&'a mut VectorSelector>) {
        match self {
            Expr::Number(_) | Expr::String(_) => {}
            Expr::Selector(selector) => out.push(selector),
            Expr::Matrix(matrix) => out.push(&mut matrix.selector),
            Expr::Subquery(subquery) => subquery.expr.collect_selectors(out),
            Expr::Call(call) => {
                for arg in &mut call.args {
                    arg.collect_selectors(out);
                }
            }
            Expr::Aggregate(aggregate) => {
                if let Some(param) = &mut aggregate.param {
                    param.collect_selectors(out);
                }
                aggregate.expr.collect_selectors(out);
            }
            Expr::Unary(_, inner) | Expr::Paren(inner) => inner.collect_selectors(out),
            Expr::Binary(binary) => {
                binary.lhs.collect_selectors(out);
                binary.rhs.collect_selectors(out);
            }
        }
    }
}

impl ScopedExpr for Expr {
    fn matcher_sets(&mut self) -> Vec<&mut Vec<Matcher>> {
        self.selectors_mut()
            .into_iter()
            .map(|selector| &mut selector.matchers)
            .collect()
    }
}

/// Restricts `query` to `tenants` on `label` and returns the rewritten query.
///
/// An empty query is replaced by [`DEFAULT_QUERY`] first.
pub fn enforce(
    query: &str,
    tenants: &BTreeSet<String>,
    label: &str,
) -> Result<String, EnforceError> {
    if tenants.is_empty() {
        return Err(EnforceError::NoTenants);
    }
    let query = if query.trim().is_empty() {
        DEFAULT_QUERY
    } else {
        query
    };
    let mut expr = parse(query)?;
    scope_selectors(&mut expr, tenants, label)?;
    let rewritten = expr.to_string();
    trace!(query = %query, rewritten = %rewritten, "enforced promql query");
    Ok(rewritten)
}
