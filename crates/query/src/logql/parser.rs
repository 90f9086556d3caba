use chumsky::prelude::*;

use super::{
    CompareOp, Conversion, Expr, Extraction, FilterValue, LabelFilter, LabelFormat, LabelReplace,
    LabelSelection, LineFilter, LineFilterOp, Literal, LogQuery, LogRange, MetricExpr,
    ParserStage, RangeAggregation, Stage, StreamSelector, Unwrap, VectorAggregation,
};
use crate::Dialect;
use crate::error::ParseError;
use crate::ops::{Binary, Operator, UnaryOp, grouping, precedence};
use crate::syntax::{
    Extra, bytes, duration, keyword, label_name, matcher, matcher_list, number, signed_number,
    string_literal, word,
};

const RANGE_OPS: &[&str] = &[
    "count_over_time",
    "rate",
    "rate_counter",
    "bytes_over_time",
    "bytes_rate",
    "avg_over_time",
    "sum_over_time",
    "min_over_time",
    "max_over_time",
    "stdvar_over_time",
    "stddev_over_time",
    "quantile_over_time",
    "first_over_time",
    "last_over_time",
    "absent_over_time",
];

const VECTOR_OPS: &[&str] = &[
    "sum",
    "avg",
    "count",
    "min",
    "max",
    "stddev",
    "stdvar",
    "topk",
    "bottomk",
    "sort",
    "sort_desc",
    "approx_topk",
];

/// Parses a LogQL log or metric query.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    choice((
        log_query().map(Expr::Log).padded().then_ignore(end()),
        metric_expr().map(Expr::Metric).padded().then_ignore(end()),
    ))
    .parse(input)
    .into_result()
    .map_err(|errors| ParseError::from_rich(Dialect::Logql, errors))
}

fn op_word<'src>(
    ops: &'static [&'static str],
) -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    word()
        .filter(move |w: &&str| ops.iter().any(|op| op.eq_ignore_ascii_case(w)))
        .map(str::to_ascii_lowercase)
}

/// `( "text" )`
fn call_arg<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    string_literal()
        .padded()
        .delimited_by(just('('), just(')'))
        .padded()
}

fn line_filter<'src>() -> impl Parser<'src, &'src str, LineFilter, Extra<'src>> + Clone {
    let op = choice((
        just("|=").to(LineFilterOp::Contains),
        just("!=").to(LineFilterOp::NotContains),
        just("|~").to(LineFilterOp::Match),
        just("!~").to(LineFilterOp::NotMatch),
        just("|>").to(LineFilterOp::Pattern),
        just("!>").to(LineFilterOp::NotPattern),
    ))
    .padded();

    let value = choice((
        keyword("ip").ignore_then(call_arg()).map(FilterValue::Ip),
        string_literal().map(FilterValue::Text),
    ))
    .padded();

    op.then(
        value
            .separated_by(keyword("or").padded())
            .at_least(1)
            .collect::<Vec<_>>(),
    )
    .map(|(op, values)| LineFilter { op, values })
}

fn extractions<'src>() -> impl Parser<'src, &'src str, Vec<Extraction>, Extra<'src>> + Clone {
    label_name()
        .padded()
        .then(just('=').padded().ignore_then(string_literal()).or_not())
        .padded()
        .map(|(label, expr)| Extraction { label, expr })
        .separated_by(just(','))
        .collect::<Vec<_>>()
}

fn logfmt_flags<'src>() -> impl Parser<'src, &'src str, Vec<String>, Extra<'src>> + Clone {
    just("--")
        .then(
            any()
                .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .repeated()
                .at_least(1),
        )
        .to_slice()
        .map(ToString::to_string)
        .padded()
        .repeated()
        .collect::<Vec<_>>()
}

fn label_formats<'src>() -> impl Parser<'src, &'src str, Vec<LabelFormat>, Extra<'src>> + Clone {
    label_name()
        .padded()
        .then_ignore(just('=').padded())
        .then(choice((
            string_literal().map(Result::<String, String>::Ok),
            label_name().map(Result::<String, String>::Err),
        )))
        .padded()
        .map(|(dst, value)| match value {
            Ok(template) => LabelFormat::Template { dst, template },
            Err(src) => LabelFormat::Rename { dst, src },
        })
        .separated_by(just(','))
        .at_least(1)
        .collect::<Vec<_>>()
}

fn label_selections<'src>()
-> impl Parser<'src, &'src str, Vec<LabelSelection>, Extra<'src>> + Clone {
    choice((
        matcher().map(LabelSelection::Matcher),
        label_name().padded().map(LabelSelection::Name),
    ))
    .separated_by(just(','))
    .at_least(1)
    .collect::<Vec<_>>()
}

fn unwrap<'src>() -> impl Parser<'src, &'src str, Unwrap, Extra<'src>> + Clone {
    let conversion = choice((
        keyword("duration_seconds").to(Conversion::DurationSeconds),
        keyword("duration").to(Conversion::Duration),
        keyword("bytes").to(Conversion::Bytes),
    ))
    .padded();

    choice((
        conversion
            .then(
                label_name()
                    .padded()
                    .delimited_by(just('('), just(')')),
            )
            .map(|(conversion, label)| Unwrap {
                label,
                conversion: Some(conversion),
            }),
        label_name().map(|label| Unwrap {
            label,
            conversion: None,
        }),
    ))
    .padded()
}

fn label_filter<'src>() -> impl Parser<'src, &'src str, LabelFilter, Extra<'src>> + Clone {
    recursive(|filter| {
        let compare_op = choice((
            just("==").to(CompareOp::Eq),
            just("!=").to(CompareOp::Neq),
            just(">=").to(CompareOp::Gte),
            just("<=").to(CompareOp::Lte),
            just(">").to(CompareOp::Gt),
            just("<").to(CompareOp::Lt),
            just("=").to(CompareOp::Eq),
        ))
        .padded();

        // Bytes before durations so `5mb` is not read as `5m` followed by `b`.
        let literal = choice((
            bytes().map(Literal::Bytes),
            duration().map(Literal::Duration),
            signed_number().map(Literal::Number),
        ))
        .padded();

        let ip = label_name()
            .padded()
            .then(choice((just("!=").to(true), just("=").to(false))).padded())
            .then_ignore(keyword("ip"))
            .then(call_arg())
            .map(|((name, negated), value)| LabelFilter::Ip {
                name,
                negated,
                value,
            });

        let compare = label_name()
            .padded()
            .then(compare_op)
            .then(literal)
            .map(|((name, op), value)| LabelFilter::Compare { name, op, value });

        let paren = filter
            .padded()
            .delimited_by(just('('), just(')'))
            .padded()
            .map(|inner| LabelFilter::Paren(Box::new(inner)));

        let atom = choice((paren, ip, compare, matcher().map(LabelFilter::Matcher)));

        let and = atom.clone().foldl(
            choice((keyword("and"), just(',').ignored()))
                .padded()
                .ignore_then(atom)
                .repeated(),
            |lhs, rhs| LabelFilter::And(Box::new(lhs), Box::new(rhs)),
        );

        and.clone().foldl(
            keyword("or").padded().ignore_then(and).repeated(),
            |lhs, rhs| LabelFilter::Or(Box::new(lhs), Box::new(rhs)),
        )
    })
}

fn stage<'src>() -> impl Parser<'src, &'src str, Stage, Extra<'src>> + Clone {
    let piped = choice((
        keyword("json")
            .ignore_then(extractions())
            .map(|e| Stage::Parser(ParserStage::Json(e))),
        keyword("logfmt")
            .ignore_then(logfmt_flags().padded())
            .then(extractions())
            .map(|(flags, extractions)| Stage::Parser(ParserStage::Logfmt { flags, extractions })),
        keyword("regexp")
            .ignore_then(string_literal().padded())
            .map(|re| Stage::Parser(ParserStage::Regexp(re))),
        keyword("pattern")
            .ignore_then(string_literal().padded())
            .map(|p| Stage::Parser(ParserStage::Pattern(p))),
        keyword("unpack").to(Stage::Parser(ParserStage::Unpack)),
        keyword("line_format")
            .ignore_then(string_literal().padded())
            .map(Stage::LineFormat),
        keyword("label_format")
            .ignore_then(label_formats())
            .map(Stage::LabelFormat),
        keyword("drop")
            .ignore_then(label_selections())
            .map(Stage::Drop),
        keyword("keep")
            .ignore_then(label_selections())
            .map(Stage::Keep),
        keyword("decolorize").to(Stage::Decolorize),
        keyword("unwrap").ignore_then(unwrap()).map(Stage::Unwrap),
        label_filter().map(Stage::LabelFilter),
    ));

    choice((
        line_filter().map(Stage::LineFilter),
        just('|').padded().ignore_then(piped.padded()),
    ))
    .boxed()
}

fn selector<'src>() -> impl Parser<'src, &'src str, StreamSelector, Extra<'src>> + Clone {
    matcher_list().map(|matchers| StreamSelector { matchers })
}

fn pipeline<'src>() -> impl Parser<'src, &'src str, Vec<Stage>, Extra<'src>> + Clone {
    stage().padded().repeated().collect::<Vec<_>>()
}

fn log_query<'src>() -> impl Parser<'src, &'src str, LogQuery, Extra<'src>> + Clone {
    selector()
        .padded()
        .then(pipeline())
        .map(|(selector, pipeline)| LogQuery { selector, pipeline })
}

fn log_range<'src>() -> impl Parser<'src, &'src str, LogRange, Extra<'src>> + Clone {
    let range = duration()
        .padded()
        .delimited_by(just('['), just(']'))
        .padded();

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

    // `{..}[5m] | json` and `{..} | json [5m]` denote the same range.
    let range_first = selector()
        .padded()
        .then(range.clone())
        .then(pipeline())
        .map(|((selector, range), pipeline)| (LogQuery { selector, pipeline }, range));
    let range_last = log_query().then(range.clone());
    let parenthesised = log_query()
        .padded()
        .delimited_by(just('('), just(')'))
        .padded()
        .then(range);

    choice((range_first, range_last, parenthesised))
        .then(offset.or_not())
        .map(|((query, range), offset)| LogRange {
            query,
            range,
            offset,
        })
        .boxed()
}

fn binary(lhs: MetricExpr, operator: Operator, rhs: MetricExpr) -> MetricExpr {
    MetricExpr::Binary(Box::new(Binary { lhs, operator, rhs }))
}

fn unary(op: UnaryOp, expr: MetricExpr) -> MetricExpr {
    MetricExpr::Unary(op, Box::new(expr))
}

fn metric_expr<'src>() -> impl Parser<'src, &'src str, MetricExpr, Extra<'src>> + Clone {
    recursive(|expr| {
        let range_aggregation = op_word(RANGE_OPS)
            .padded()
            .then(
                signed_number()
                    .padded()
                    .then_ignore(just(','))
                    .or_not()
                    .then(log_range())
                    .padded()
                    .delimited_by(just('('), just(')')),
            )
            .then(grouping().or_not())
            .map(|((op, (param, range)), grouping)| {
                MetricExpr::Range(RangeAggregation {
                    op,
                    param,
                    range,
                    grouping,
                })
            });

        let vector_aggregation = op_word(VECTOR_OPS)
            .padded()
            .then(grouping().or_not())
            .then(
                expr.clone()
                    .separated_by(just(','))
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .padded()
                    .delimited_by(just('('), just(')')),
            )
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
                let param = match (args.pop(), args.is_empty()) {
                    (None, _) => None,
                    (Some(MetricExpr::Number(n)), true) => Some(n),
                    (Some(_), true) => {
                        return Err(Rich::custom(span, "aggregation parameter must be a number"));
                    }
                    (Some(_), false) => {
                        return Err(Rich::custom(span, "too many aggregation arguments"));
                    }
                };
                Ok(MetricExpr::Aggregate(VectorAggregation {
                    op,
                    grouping,
                    param,
                    expr: Box::new(expr),
                }))
            });

        let string_arg = just(',').padded().ignore_then(string_literal()).padded();
        let label_replace = keyword("label_replace")
            .padded()
            .ignore_then(
                expr.clone()
                    .then(string_arg.clone())
                    .then(string_arg.clone())
                    .then(string_arg.clone())
                    .then(string_arg)
                    .padded()
                    .delimited_by(just('('), just(')')),
            )
            .map(|((((expr, dst), replacement), src), regex)| {
                MetricExpr::LabelReplace(LabelReplace {
                    expr: Box::new(expr),
                    dst,
                    replacement,
                    src,
                    regex,
                })
            });

        let vector = keyword("vector")
            .padded()
            .ignore_then(
                signed_number()
                    .padded()
                    .delimited_by(just('('), just(')')),
            )
            .map(MetricExpr::Vector);

        let paren = expr
            .padded()
            .delimited_by(just('('), just(')'))
            .map(|e| MetricExpr::Paren(Box::new(e)));

        let atom = choice((
            paren,
            range_aggregation,
            vector_aggregation,
            label_replace,
            vector,
            number().map(MetricExpr::Number),
        ))
        .padded();

        precedence(atom, binary, unary)
    })
}
