use chumsky::prelude::*;

use super::{Aggregate, At, Call, Expr, MatrixSelector, Modifiers, Subquery, VectorSelector};
use crate::Dialect;
use crate::error::ParseError;
use crate::ops::{Binary, Operator, UnaryOp, grouping, precedence};
use crate::syntax::{
    Extra, duration, is_ident_continue, is_ident_start, keyword, matcher_list, number,
    signed_number, string_literal, word,
};

const AGGREGATE_OPS: &[&str] = &[
    "sum",
    "avg",
    "count",
    "min",
    "max",
    "group",
    "stddev",
    "stdvar",
    "topk",
    "bottomk",
    "count_values",
    "quantile",
    "limitk",
    "limit_ratio",
];

fn is_aggregate_op(word: &str) -> bool {
    AGGREGATE_OPS.iter().any(|op| op.eq_ignore_ascii_case(word))
}

/// Parses a PromQL expression.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    expr()
        .padded()
        .then_ignore(end())
        .parse(input)
        .into_result()
        .map_err(|errors| ParseError::from_rich(Dialect::Promql, errors))
}

fn binary(lhs: Expr, operator: Operator, rhs: Expr) -> Expr {
    Expr::Binary(Box::new(Binary { lhs, operator, rhs }))
}

fn unary(op: UnaryOp, expr: Expr) -> Expr {
    Expr::Unary(op, Box::new(expr))
}

fn metric_name<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| is_ident_start(c) || *c == ':')
        .then(
            any()
                .filter(|c: &char| is_ident_continue(c) || *c == ':')
                .repeated(),
        )
        .to_slice()
        .map(ToString::to_string)
}

fn selector<'src>() -> impl Parser<'src, &'src str, VectorSelector, Extra<'src>> + Clone {
    choice((
        metric_name()
            .then(matcher_list().padded().or_not())
            .map(|(name, matchers)| (Some(name), matchers.unwrap_or_default())),
        matcher_list().map(|matchers| (None, matchers)),
    ))
    .map(|(name, matchers)| VectorSelector {
        name,
        matchers,
        modifiers: Modifiers::default(),
    })
}

fn modifiers<'src>() -> impl Parser<'src, &'src str, Modifiers, Extra<'src>> + Clone {
    let offset = keyword("offset").padded().ignore_then(
        just('-')
            .or_not()
            .then(duration())
            .map(|(sign, d)| match sign {
                Some(_) => format!("-{d}"),
                None => d,
            })
            .padded(),
    );

    let at = just('@').padded().ignore_then(
        choice((
            keyword("start")
                .then(just('(').padded())
                .then(just(')'))
                .to(At::Start),
            keyword("end")
                .then(just('(').padded())
                .then(just(')'))
                .to(At::End),
            signed_number().map(At::Timestamp),
        ))
        .padded(),
    );

    choice((
        offset
            .clone()
            .then(at.clone().or_not())
            .map(|(offset, at)| Modifiers {
                offset: Some(offset),
                at,
            }),
        at.then(offset.or_not()).map(|(at, offset)| Modifiers {
            offset,
            at: Some(at),
        }),
    ))
    .or_not()
    .map(Option::unwrap_or_default)
}

/// `[range]` or `[range:step?]`. The inner option is `Some` for subqueries.
fn range_suffix<'src>()
-> impl Parser<'src, &'src str, (String, Option<Option<String>>), Extra<'src>> + Clone {
    duration()
        .padded()
        .then(
            just(':')
                .ignore_then(duration().padded().or_not())
                .or_not(),
        )
        .delimited_by(just('['), just(']'))
        .padded()
}

fn apply_postfix(
    expr: Expr,
    range: Option<(String, Option<Option<String>>)>,
    modifiers: Modifiers,
) -> Result<Expr, &'static str> {
    match (range, expr) {
        (None, expr) if modifiers.is_empty() => Ok(expr),
        (None, Expr::Selector(selector)) => Ok(Expr::Selector(VectorSelector {
            modifiers,
            ..selector
        })),
        (None, _) => Err("offset and @ modifiers apply only to selectors and subqueries"),
        (Some((range, None)), Expr::Selector(selector)) => Ok(Expr::Matrix(MatrixSelector {
            selector: VectorSelector {
                modifiers,
                ..selector
            },
            range,
        })),
        (Some((_, None)), _) => Err("range is only allowed after a vector selector"),
        (Some((range, Some(step))), expr) => Ok(Expr::Subquery(Subquery {
            expr: Box::new(expr),
            range,
            step,
            modifiers,
        })),
    }
}

fn expr<'src>() -> impl Parser<'src, &'src str, Expr, Extra<'src>> + Clone {
    recursive(|expr| {
        let args = expr
            .clone()
            .separated_by(just(','))
            .allow_trailing()
            .collect::<Vec<_>>()
            .padded()
            .delimited_by(just('('), just(')'));

        let aggregate = word()
            .filter(|w: &&str| is_aggregate_op(w))
            .map(str::to_ascii_lowercase)
            .padded()
            .then(grouping().or_not())
            .then(args.clone())
            .then(grouping().or_not())
            .try_map(|(((op, before), mut args), after), span| {
                let grouping = match (before, after) {
                    (Some(_), Some(_)) => {
                        return Err(Rich::custom(span, "duplicate grouping clause"));
                    }
                    (before, after) => before.or(after),
                };
                let expr = args
                    .pop()
                    .ok_or_else(|| Rich::custom(span, "aggregation needs an argument"))?;
                let param = match args.len() {
                    0 => None,
                    1 => args.pop().map(Box::new),
                    _ => return Err(Rich::custom(span, "too many aggregation arguments")),
                };
                Ok(Expr::Aggregate(Aggregate {
                    op,
                    grouping,
                    param,
                    expr: Box::new(expr),
                }))
            });

        let call = word()
            .filter(|w: &&str| !is_aggregate_op(w))
            .map(ToString::to_string)
            .then(args.padded())
            .map(|(func, args)| Expr::Call(Call { func, args }));

        let paren = expr
            .padded()
            .delimited_by(just('('), just(')'))
            .map(|e| Expr::Paren(Box::new(e)));

        let primary = choice((
            number().map(Expr::Number),
            string_literal().map(Expr::String),
            paren,
            aggregate,
            call,
            selector().map(Expr::Selector),
        ))
        .padded();

        let atom = primary
            .then(range_suffix().or_not())
            .then(modifiers())
            .try_map(|((expr, range), modifiers), span| {
                apply_postfix(expr, range, modifiers).map_err(|msg| Rich::custom(span, msg))
            })
            .padded();

        precedence(atom, binary, unary)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchOp;

    #[test]
    fn test_parse_selector_with_name() {
        let expr = parse(r#"up{job="api"}"#).unwrap();
        let Expr::Selector(selector) = expr else {
            panic!("expected selector");
        };
        assert_eq!(selector.name.as_deref(), Some("up"));
        assert_eq!(selector.matchers.len(), 1);
        assert_eq!(selector.matchers[0].op, MatchOp::Equal);
    }

    #[test]
    fn test_parse_matrix_and_subquery() {
        assert!(matches!(
            parse("rate(http_requests_total[5m])").unwrap(),
            Expr::Call(_)
        ));
        assert!(matches!(
            parse("max_over_time(rate(x[1m])[1h:5m])").unwrap(),
            Expr::Call(_)
        ));
        assert!(matches!(parse("x[5m:]").unwrap(), Expr::Subquery(_)));
    }

    #[test]
    fn test_parse_aggregation_grouping_positions() {
        let before = parse("sum by (job) (rate(x[5m]))").unwrap();
        let after = parse("sum(rate(x[5m])) by (job)").unwrap();
        assert_eq!(before, after);
        assert!(parse("sum by (a) (x) by (b)").is_err());
    }

    #[test]
    fn test_parse_precedence() {
        let Expr::Binary(b) = parse("a + b * c").unwrap() else {
            panic!("expected binary");
        };
        assert_eq!(b.operator.op, crate::ops::BinaryOp::Add);
        assert!(matches!(b.rhs, Expr::Binary(_)));

        let Expr::Binary(b) = parse("2 ^ 3 ^ 2").unwrap() else {
            panic!("expected binary");
        };
        assert!(matches!(b.lhs, Expr::Number(_)));
        assert!(matches!(b.rhs, Expr::Binary(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("up{").is_err());
        assert!(parse("sum(").is_err());
        assert!(parse("up or").is_err());
        assert!(parse("rate(x)[5m]").is_err());
        assert!(parse("(up) offset 5m").is_err());
    }
}
