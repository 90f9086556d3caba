//! LogQL expressions: log queries with their pipelines, and the metric
//! queries built on top of them.

mod parser;

use std::collections::BTreeSet;
use std::fmt;

use tracing::trace;

use crate::enforce::{ScopedExpr, scope_selectors};
use crate::error::EnforceError;
use crate::matcher::{Matcher, Quoted, write_joined, write_matchers};
use crate::ops::{Binary, Grouping, UnaryOp};

pub use parser::parse;

/// Query substituted for an empty `query` parameter.
pub const DEFAULT_QUERY: &str = r#"{__name__=~".+"}"#;

/// A LogQL expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Log query returning lines.
    Log(LogQuery),
    /// Metric query returning samples.
    Metric(MetricExpr),
}

/// `{matchers}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSelector {
    /// Stream label matchers.
    pub matchers: Vec<Matcher>,
}

impl fmt::Display for StreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_matchers(f, &self.matchers)
    }
}

/// A stream selector followed by pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// Stream selector.
    pub selector: StreamSelector,
    /// Pipeline stages in order.
    pub pipeline: Vec<Stage>,
}

impl fmt::Display for LogQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.selector)?;
        for stage in &self.pipeline {
            write!(f, " {stage}")?;
        }
        Ok(())
    }
}

/// Pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// `|= "text"` and friends.
    LineFilter(LineFilter),
    /// `| json`, `| logfmt`, ...
    Parser(ParserStage),
    /// `| label > 5`
    LabelFilter(LabelFilter),
    /// `| line_format "template"`
    LineFormat(String),
    /// `| label_format a=b, c="template"`
    LabelFormat(Vec<LabelFormat>),
    /// `| drop a, b="x"`
    Drop(Vec<LabelSelection>),
    /// `| keep a, b="x"`
    Keep(Vec<LabelSelection>),
    /// `| decolorize`
    Decolorize,
    /// `| unwrap label`
    Unwrap(Unwrap),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::LineFilter(filter) => write!(f, "{filter}"),
            Stage::Parser(parser) => write!(f, "| {parser}"),
            Stage::LabelFilter(filter) => write!(f, "| {filter}"),
            Stage::LineFormat(template) => write!(f, "| line_format {}", Quoted(template)),
            Stage::LabelFormat(ops) => {
                f.write_str("| label_format ")?;
                write_joined(f, ops, ", ")
            }
            Stage::Drop(labels) => {
                f.write_str("| drop ")?;
                write_joined(f, labels, ", ")
            }
            Stage::Keep(labels) => {
                f.write_str("| keep ")?;
                write_joined(f, labels, ", ")
            }
            Stage::Decolorize => f.write_str("| decolorize"),
            Stage::Unwrap(unwrap) => write!(f, "| unwrap {unwrap}"),
        }
    }
}

/// Line filter operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineFilterOp {
    /// `|=`
    Contains,
    /// `!=`
    NotContains,
    /// `|~`
    Match,
    /// `!~`
    NotMatch,
    /// `|>`
    Pattern,
    /// `!>`
    NotPattern,
}

impl LineFilterOp {
    /// Returns the operator token.
    pub fn as_str(&self) -> &'static str {
        match self {
            LineFilterOp::Contains => "|=",
            LineFilterOp::NotContains => "!=",
            LineFilterOp::Match => "|~",
            LineFilterOp::NotMatch => "!~",
            LineFilterOp::Pattern => "|>",
            LineFilterOp::NotPattern => "!>",
        }
    }
}

/// Operand of a line filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    /// String, regex or pattern.
    Text(String),
    /// `ip("cidr")`
    Ip(String),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Text(text) => write!(f, "{}", Quoted(text)),
            FilterValue::Ip(range) => write!(f, "ip({})", Quoted(range)),
        }
    }
}

/// `op value (or value)*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFilter {
    /// Operator.
    pub op: LineFilterOp,
    /// Alternatives joined by `or`; never empty.
    pub values: Vec<FilterValue>,
}

impl fmt::Display for LineFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.op.as_str())?;
        write_joined(f, &self.values, " or ")
    }
}

/// `label` or `label="expression"` parameter of `json` and `logfmt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Target label.
    pub label: String,
    /// Extraction path; defaults to the label name.
    pub expr: Option<String>,
}

impl fmt::Display for Extraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)?;
        if let Some(expr) = &self.expr {
            write!(f, "={}", Quoted(expr))?;
        }
        Ok(())
    }
}

/// Parser stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserStage {
    /// `json [extractions]`
    Json(Vec<Extraction>),
    /// `logfmt [--flags] [extractions]`
    Logfmt {
        /// Flags such as `--strict`, including the dashes.
        flags: Vec<String>,
        /// Extractions.
        extractions: Vec<Extraction>,
    },
    /// `regexp "re"`
    Regexp(String),
    /// `pattern "<_> <field>"`
    Pattern(String),
    /// `unpack`
    Unpack,
}

fn write_extractions(f: &mut fmt::Formatter<'_>, extractions: &[Extraction]) -> fmt::Result {
    if !extractions.is_empty() {
        f.write_str(" ")?;
        write_joined(f, extractions, ", ")?;
    }
    Ok(())
}

impl fmt::Display for ParserStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserStage::Json(extractions) => {
                f.write_str("json")?;
                write_extractions(f, extractions)
            }
            ParserStage::Logfmt { flags, extractions } => {
                f.write_str("logfmt")?;
                for flag in flags {
                    write!(f, " {flag}")?;
                }
                write_extractions(f, extractions)
            }
            ParserStage::Regexp(re) => write!(f, "regexp {}", Quoted(re)),
            ParserStage::Pattern(pattern) => write!(f, "pattern {}", Quoted(pattern)),
            ParserStage::Unpack => f.write_str("unpack"),
        }
    }
}

/// Comparison operator of a numeric label filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `==` (also written `=`)
    Eq,
    /// `!=`
    Neq,
}

impl CompareOp {
    /// Returns the operator token.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Eq => "==",
            CompareOp::Neq => "!=",
        }
    }
}

/// Right-hand side of a numeric label filter, as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    /// `42`, `0.5`
    Number(String),
    /// `250ms`
    Duration(String),
    /// `20MB`
    Bytes(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(v) | Literal::Duration(v) | Literal::Bytes(v) => f.write_str(v),
        }
    }
}

/// Label filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFilter {
    /// `label op "value"`
    Matcher(Matcher),
    /// `label = ip("cidr")` or `label != ip("cidr")`
    Ip {
        /// Label name.
        name: String,
        /// True for `!=`.
        negated: bool,
        /// Address, range or CIDR.
        value: String,
    },
    /// `label > 5s`
    Compare {
        /// Label name.
        name: String,
        /// Operator.
        op: CompareOp,
        /// Value.
        value: Literal,
    },
    /// `a and b`, also written `a, b`.
    And(Box<LabelFilter>, Box<LabelFilter>),
    /// `a or b`
    Or(Box<LabelFilter>, Box<LabelFilter>),
    /// `(a)`
    Paren(Box<LabelFilter>),
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelFilter::Matcher(m) => write!(f, "{m}"),
            LabelFilter::Ip {
                name,
                negated,
                value,
            } => {
                let op = if *negated { "!=" } else { "=" };
                write!(f, "{name} {op} ip({})", Quoted(value))
            }
            LabelFilter::Compare { name, op, value } => {
                write!(f, "{name} {} {value}", op.as_str())
            }
            LabelFilter::And(lhs, rhs) => write!(f, "{lhs} and {rhs}"),
            LabelFilter::Or(lhs, rhs) => write!(f, "{lhs} or {rhs}"),
            LabelFilter::Paren(inner) => write!(f, "({inner})"),
        }
    }
}

/// One `label_format` assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFormat {
    /// `dst=src`
    Rename {
        /// New label.
        dst: String,
        /// Existing label.
        src: String,
    },
    /// `dst="{{ template }}"`
    Template {
        /// New label.
        dst: String,
        /// Template text.
        template: String,
    },
}

impl fmt::Display for LabelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelFormat::Rename { dst, src } => write!(f, "{dst}={src}"),
            LabelFormat::Template { dst, template } => write!(f, "{dst}={}", Quoted(template)),
        }
    }
}

/// Argument of `drop` and `keep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSelection {
    /// Bare label name.
    Name(String),
    /// Label matched by value.
    Matcher(Matcher),
}

impl fmt::Display for LabelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelSelection::Name(name) => f.write_str(name),
            LabelSelection::Matcher(m) => write!(f, "{m}"),
        }
    }
}

/// Conversion applied by `unwrap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conversion {
    /// `duration(label)`
    Duration,
    /// `duration_seconds(label)`
    DurationSeconds,
    /// `bytes(label)`
    Bytes,
}

/// `unwrap [conversion(]label[)]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrap {
    /// Label whose value becomes the sample.
    pub label: String,
    /// Optional conversion.
    pub conversion: Option<Conversion>,
}

impl fmt::Display for Unwrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.conversion {
            None => f.write_str(&self.label),
            Some(Conversion::Duration) => write!(f, "duration({})", self.label),
            Some(Conversion::DurationSeconds) => write!(f, "duration_seconds({})", self.label),
            Some(Conversion::Bytes) => write!(f, "bytes({})", self.label),
        }
    }
}

/// Log query over a time range: `{..} | ... [5m] offset 1h`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRange {
    /// Log query.
    pub query: LogQuery,
    /// Range duration.
    pub range: String,
    /// Offset duration, with a leading `-` when negative.
    pub offset: Option<String>,
}

impl fmt::Display for LogRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.query)?;
        if !self.query.pipeline.is_empty() {
            f.write_str(" ")?;
        }
        write!(f, "[{}]", self.range)?;
        if let Some(offset) = &self.offset {
            write!(f, " offset {offset}")?;
        }
        Ok(())
    }
}

/// `rate({..}[5m])`, `quantile_over_time(0.9, {..} | unwrap x [5m]) by (a)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeAggregation {
    /// Range operation, lowercase.
    pub op: String,
    /// Parameter of `quantile_over_time`.
    pub param: Option<String>,
    /// Aggregated range.
    pub range: LogRange,
    /// Grouping clause.
    pub grouping: Option<Grouping>,
}

impl fmt::Display for RangeAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.op)?;
        if let Some(param) = &self.param {
            write!(f, "{param}, ")?;
        }
        write!(f, "{})", self.range)?;
        if let Some(grouping) = &self.grouping {
            write!(f, " {grouping}")?;
        }
        Ok(())
    }
}

/// `sum by (a) (expr)`, `topk(5, expr)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorAggregation {
    /// Aggregation operator, lowercase.
    pub op: String,
    /// Grouping clause.
    pub grouping: Option<Grouping>,
    /// Numeric parameter of `topk`, `bottomk`, ...
    pub param: Option<String>,
    /// Aggregated expression.
    pub expr: Box<MetricExpr>,
}

impl fmt::Display for VectorAggregation {
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

/// `label_replace(expr, "dst", "replacement", "src", "regex")`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelReplace {
    /// Input expression.
    pub expr: Box<MetricExpr>,
    /// Destination label.
    pub dst: String,
    /// Replacement template.
    pub replacement: String,
    /// Source label.
    pub src: String,
    /// Regex applied to the source label.
    pub regex: String,
}

impl fmt::Display for LabelReplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "label_replace({}, {}, {}, {}, {})",
            self.expr,
            Quoted(&self.dst),
            Quoted(&self.replacement),
            Quoted(&self.src),
            Quoted(&self.regex)
        )
    }
}

/// Metric expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricExpr {
    /// Range aggregation over a log range.
    Range(RangeAggregation),
    /// Vector aggregation.
    Aggregate(VectorAggregation),
    /// `label_replace(...)`
    LabelReplace(LabelReplace),
    /// `vector(n)`
    Vector(String),
    /// Number literal.
    Number(String),
    /// Unary sign.
    Unary(UnaryOp, Box<MetricExpr>),
    /// Binary operation.
    Binary(Box<Binary<MetricExpr>>),
    /// Parenthesised expression.
    Paren(Box<MetricExpr>),
}

impl fmt::Display for MetricExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricExpr::Range(r) => write!(f, "{r}"),
            MetricExpr::Aggregate(a) => write!(f, "{a}"),
            MetricExpr::LabelReplace(l) => write!(f, "{l}"),
            MetricExpr::Vector(n) => write!(f, "vector({n})"),
            MetricExpr::Number(n) => f.write_str(n),
            MetricExpr::Unary(op, e) => write!(f, "{op}{e}"),
            MetricExpr::Binary(b) => write!(f, "{b}"),
            MetricExpr::Paren(e) => write!(f, "({e})"),
        }
    }
}

impl MetricExpr {
    fn collect_selectors<'a>(&'a mut self, out: &mut Vec<&'a mut StreamSelector>) {
        match self {
            MetricExpr::Range(range) => out.push(&mut range.range.query.selector),
            MetricExpr::Aggregate(aggregate) => aggregate.expr.collect_selectors(out),
            MetricExpr::LabelReplace(replace) => replace.expr.collect_selectors(out),
            MetricExpr::Vector(_) | MetricExpr::Number(_) => {}
            MetricExpr::Unary(_, inner) | MetricExpr::Paren(inner) => {
                inner.collect_selectors(out)
            }
            MetricExpr::Binary(binary) => {
                binary.lhs.collect_selectors(out);
                binary.rhs.collect_selectors(out);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Log(query) => write!(f, "{query}"),
            Expr::Metric(metric) => write!(f, "{metric}"),
        }
    }
}

impl Expr {
    /// Returns every stream selector in the tree.
    pub fn selectors_mut(&mut self) -> Vec<&mut StreamSelector> {
        let mut out = Vec::new();
        match self {
            Expr::Log(query) => out.push(&mut query.selector),
            Expr::Metric(metric) => metric.collect_selectors(&mut out),
        }
        out
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
    trace!(query = %query, rewritten = %rewritten, "enforced logql query");
    Ok(rewritten)
}
