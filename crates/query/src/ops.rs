//! Operators, grouping clauses and the precedence ladder shared by PromQL and
//! LogQL metric expressions.

use std::fmt;

use chumsky::Boxed;
use chumsky::prelude::*;

use crate::matcher::write_joined;
use crate::syntax::{Extra, keyword, label_list, word};

/// Binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `^`
    Pow,
    /// `atan2`
    Atan2,
    /// `==`
    Eql,
    /// `!=`
    Neq,
    /// `<=`
    Lte,
    /// `<`
    Lss,
    /// `>=`
    Gte,
    /// `>`
    Gtr,
    /// `and`
    And,
    /// `or`
    Or,
    /// `unless`
    Unless,
}

impl BinaryOp {
    /// Returns the operator token.
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::Eql => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Lte => "<=",
            BinaryOp::Lss => "<",
            BinaryOp::Gte => ">=",
            BinaryOp::Gtr => ">",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Unless => "unless",
        }
    }

    fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "and" => Some(BinaryOp::And),
            "or" => Some(BinaryOp::Or),
            "unless" => Some(BinaryOp::Unless),
            "atan2" => Some(BinaryOp::Atan2),
            _ => None,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unary sign operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `-`
    Neg,
    /// `+`
    Pos,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
        })
    }
}

/// `by` or `without`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupingKind {
    /// Keep only the listed labels.
    By,
    /// Drop the listed labels.
    Without,
}

/// Grouping clause of an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Grouping {
    /// `by` or `without`.
    pub kind: GroupingKind,
    /// Label names.
    pub labels: Vec<String>,
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.kind {
            GroupingKind::By => "by (",
            GroupingKind::Without => "without (",
        })?;
        write_joined(f, &self.labels, ", ")?;
        f.write_str(")")
    }
}

/// `on` or `ignoring`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchingKind {
    /// `on(...)`
    On,
    /// `ignoring(...)`
    Ignoring,
}

/// `group_left` or `group_right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupSide {
    /// Many-to-one.
    Left,
    /// One-to-many.
    Right,
}

/// Vector matching clause of a binary operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VectorMatching {
    /// `on` or `ignoring`.
    pub kind: MatchingKind,
    /// Matching labels.
    pub labels: Vec<String>,
    /// Optional `group_left` / `group_right` with extra labels.
    pub group: Option<(GroupSide, Vec<String>)>,
}

impl fmt::Display for VectorMatching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.kind {
            MatchingKind::On => "on (",
            MatchingKind::Ignoring => "ignoring (",
        })?;
        write_joined(f, &self.labels, ", ")?;
        f.write_str(")")?;
        if let Some((side, labels)) = &self.group {
            f.write_str(match side {
                GroupSide::Left => " group_left",
                GroupSide::Right => " group_right",
            })?;
            if !labels.is_empty() {
                f.write_str(" (")?;
                write_joined(f, labels, ", ")?;
                f.write_str(")")?;
            }
        }
        Ok(())
    }
}

/// A binary operator with its modifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operator {
    /// The operator.
    pub op: BinaryOp,
    /// `bool` modifier on comparisons.
    pub return_bool: bool,
    /// Vector matching clause.
    pub matching: Option<VectorMatching>,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if self.return_bool {
            f.write_str(" bool")?;
        }
        if let Some(matching) = &self.matching {
            write!(f, " {matching}")?;
        }
        Ok(())
    }
}

/// A binary expression over `T`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binary<T> {
    /// Left operand.
    pub lhs: T,
    /// Operator and modifiers.
    pub operator: Operator,
    /// Right operand.
    pub rhs: T,
}

impl<T: fmt::Display> fmt::Display for Binary<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.operator, self.rhs)
    }
}

const POW: &[BinaryOp] = &[BinaryOp::Pow];
const PRODUCT: &[BinaryOp] = &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod, BinaryOp::Atan2];
const SUM: &[BinaryOp] = &[BinaryOp::Add, BinaryOp::Sub];
const COMPARISON: &[BinaryOp] = &[
    BinaryOp::Eql,
    BinaryOp::Neq,
    BinaryOp::Lte,
    BinaryOp::Lss,
    BinaryOp::Gte,
    BinaryOp::Gtr,
];
const AND_UNLESS: &[BinaryOp] = &[BinaryOp::And, BinaryOp::Unless];
const OR: &[BinaryOp] = &[BinaryOp::Or];

/// `by (..)` or `without (..)`.
pub(crate) fn grouping<'src>() -> impl Parser<'src, &'src str, Grouping, Extra<'src>> + Clone {
    choice((
        keyword("by").to(GroupingKind::By),
        keyword("without").to(GroupingKind::Without),
    ))
    .padded()
    .then(label_list())
    .map(|(kind, labels)| Grouping { kind, labels })
    .padded()
}

fn vector_matching<'src>() -> impl Parser<'src, &'src str, VectorMatching, Extra<'src>> + Clone
{
    let side = choice((
        keyword("group_left").to(GroupSide::Left),
        keyword("group_right").to(GroupSide::Right),
    ))
    .padded();

    choice((
        keyword("on").to(MatchingKind::On),
        keyword("ignoring").to(MatchingKind::Ignoring),
    ))
    .padded()
    .then(label_list())
    .then(side.then(label_list().or_not()).or_not())
    .map(|((kind, labels), group)| VectorMatching {
        kind,
        labels,
        group: group.map(|(side, labels)| (side, labels.unwrap_or_default())),
    })
    .padded()
}

/// One operator out of `allowed`, with `bool` and vector matching modifiers.
fn operator<'src>(
    allowed: &'static [BinaryOp],
) -> impl Parser<'src, &'src str, Operator, Extra<'src>> + Clone {
    let token = choice((
        just("==").to(BinaryOp::Eql),
        just("!=").to(BinaryOp::Neq),
        just("<=").to(BinaryOp::Lte),
        just(">=").to(BinaryOp::Gte),
        just("<").to(BinaryOp::Lss),
        just(">").to(BinaryOp::Gtr),
        just("+").to(BinaryOp::Add),
        just("-").to(BinaryOp::Sub),
        just("*").to(BinaryOp::Mul),
        just("/").to(BinaryOp::Div),
        just("%").to(BinaryOp::Mod),
        just("^").to(BinaryOp::Pow),
        word().try_map(|w: &str, span| {
            BinaryOp::from_keyword(w).ok_or_else(|| Rich::custom(span, "expected operator"))
        }),
    ))
    .filter(move |op: &BinaryOp| allowed.contains(op))
    .padded();

    token
        .then(keyword("bool").padded().or_not().map(|b| b.is_some()))
        .then(vector_matching().or_not())
        .map(|((op, return_bool), matching)| Operator {
            op,
            return_bool,
            matching,
        })
}

fn unary_op<'src>() -> impl Parser<'src, &'src str, UnaryOp, Extra<'src>> + Clone {
    choice((just('-').to(UnaryOp::Neg), just('+').to(UnaryOp::Pos))).padded()
}

/// Builds the operator precedence ladder over `atom`, lowest to highest:
/// `or`, `and`/`unless`, comparisons, `+ -`, `* / % atan2`, unary sign, `^`.
/// `^` is right associative, everything else left associative.
pub(crate) fn precedence<'src, T, A>(
    atom: A,
    binary: fn(T, Operator, T) -> T,
    unary: fn(UnaryOp, T) -> T,
) -> impl Parser<'src, &'src str, T, Extra<'src>> + Clone
where
    T: 'src,
    A: Parser<'src, &'src str, T, Extra<'src>> + Clone + 'src,
{
    let signed = recursive(move |signed| {
        let power = atom
            .then(operator(POW).then(signed).or_not())
            .map(move |(lhs, rhs)| match rhs {
                Some((op, rhs)) => binary(lhs, op, rhs),
                None => lhs,
            });

        unary_op()
            .repeated()
            .collect::<Vec<_>>()
            .then(power)
            .map(move |(ops, expr)| ops.into_iter().rev().fold(expr, |e, op| unary(op, e)))
    });

    let level = move |operand: Boxed<'src, 'src, &'src str, T, Extra<'src>>,
                      allowed: &'static [BinaryOp]| {
        operand
            .clone()
            .foldl(operator(allowed).then(operand).repeated(), move |lhs, (op, rhs)| {
                binary(lhs, op, rhs)
            })
            .boxed()
    };

    let product = level(signed.boxed(), PRODUCT);
    let sum = level(product, SUM);
    let comparison = level(sum, COMPARISON);
    let and_unless = level(comparison, AND_UNLESS);
    level(and_unless, OR)
}
