//! Lexical building blocks shared by the PromQL and LogQL grammars.

use chumsky::prelude::*;

use crate::matcher::{MatchOp, Matcher};

pub(crate) type Extra<'src> = extra::Err<Rich<'src, char>>;

pub(crate) fn is_ident_start(c: &char) -> bool {
    c.is_ascii_alphabetic() || *c == '_'
}

pub(crate) fn is_ident_continue(c: &char) -> bool {
    c.is_ascii_alphanumeric() || *c == '_'
}

/// A bare identifier, returned as written.
pub(crate) fn word<'src>() -> impl Parser<'src, &'src str, &'src str, Extra<'src>> + Clone {
    any()
        .filter(is_ident_start)
        .then(any().filter(is_ident_continue).repeated())
        .to_slice()
}

/// A case-insensitive keyword. Matches whole words only, so `order` is not
/// read as `or`.
pub(crate) fn keyword<'src>(
    kw: &'static str,
) -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    word()
        .filter(move |w: &&str| w.eq_ignore_ascii_case(kw))
        .ignored()
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
pub(crate) fn label_name<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    word().map(ToString::to_string)
}

/// A parenthesised, comma-separated label list: `(a, b)`.
pub(crate) fn label_list<'src>()
-> impl Parser<'src, &'src str, Vec<String>, Extra<'src>> + Clone {
    label_name()
        .padded()
        .separated_by(just(','))
        .allow_trailing()
        .collect::<Vec<_>>()
        .padded()
        .delimited_by(just('('), just(')'))
}

/// A decoded piece of a quoted string.
#[derive(Debug, Clone, Copy)]
enum Piece {
    Char(char),
    /// `\xHH` or `\NNN`; may be one byte of a multi-byte UTF-8 sequence.
    Byte(u8),
}

fn digits<'src>(
    len: usize,
    radix: u32,
) -> impl Parser<'src, &'src str, &'src str, Extra<'src>> + Clone {
    any()
        .filter(move |c: &char| c.is_digit(radix))
        .repeated()
        .exactly(len)
        .to_slice()
}

fn code_point<'src>(
    prefix: char,
    len: usize,
) -> impl Parser<'src, &'src str, Piece, Extra<'src>> + Clone {
    just(prefix)
        .ignore_then(digits(len, 16))
        .try_map(|digits: &str, span| {
            u32::from_str_radix(digits, 16)
                .ok()
                .and_then(char::from_u32)
                .map(Piece::Char)
                .ok_or_else(|| Rich::custom(span, "invalid unicode escape"))
        })
}

fn decode(pieces: Vec<Piece>) -> Result<String, std::string::FromUtf8Error> {
    let mut bytes = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match piece {
            Piece::Char(c) => bytes.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
            Piece::Byte(b) => bytes.push(b),
        }
    }
    String::from_utf8(bytes)
}

/// Double-quoted, single-quoted or backtick string literal, unescaped.
///
/// Quoted strings accept the escapes `\a \b \f \n \r \t \v \\ \' \" \``,
/// `\xHH`, octal `\NNN`, `\uXXXX` and `\UXXXXXXXX`. Byte escapes must
/// combine into valid UTF-8.
pub(crate) fn string_literal<'src>()
-> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    let hex = just('x')
        .ignore_then(digits(2, 16))
        .try_map(|digits: &str, span| {
            u8::from_str_radix(digits, 16)
                .map(Piece::Byte)
                .map_err(|_| Rich::custom(span, "invalid hex escape"))
        });

    let octal = digits(3, 8).try_map(|digits: &str, span| {
        u8::from_str_radix(digits, 8)
            .map(Piece::Byte)
            .map_err(|_| Rich::custom(span, "octal escape out of range"))
    });

    let simple = choice((
        just('\\'),
        just('"'),
        just('\''),
        just('`'),
        just('n').to('\n'),
        just('t').to('\t'),
        just('r').to('\r'),
        just('a').to('\u{07}'),
        just('b').to('\u{08}'),
        just('f').to('\u{0c}'),
        just('v').to('\u{0b}'),
    ))
    .map(Piece::Char);

    let escape = just('\\').ignore_then(choice((
        simple,
        hex,
        octal,
        code_point('u', 4),
        code_point('U', 8),
    )));

    let quoted = |quote: char, excluded: &'static str| {
        none_of(excluded)
            .map(Piece::Char)
            .or(escape.clone())
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(just(quote), just(quote))
            .try_map(|pieces, span| {
                decode(pieces).map_err(|_| Rich::custom(span, "invalid UTF-8 in string"))
            })
    };

    let raw = none_of("`")
        .repeated()
        .to_slice()
        .map(ToString::to_string)
        .delimited_by(just('`'), just('`'));

    choice((quoted('"', "\\\"\n"), quoted('\'', "\\'\n"), raw))
}

/// Number literal as written: decimal, exponent, hex, `Inf` or `NaN`.
pub(crate) fn number<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    let hex = just("0x")
        .or(just("0X"))
        .then(
            any()
                .filter(char::is_ascii_hexdigit)
                .repeated()
                .at_least(1),
        )
        .to_slice();

    let exponent = one_of("eE")
        .then(one_of("+-").or_not())
        .then(text::digits(10));

    let decimal = choice((
        text::digits(10)
            .then(just('.').then(text::digits(10).or_not()).or_not())
            .ignored(),
        just('.').then(text::digits(10)).ignored(),
    ))
    .then(exponent.or_not())
    .to_slice();

    let special =
        word().filter(|w: &&str| w.eq_ignore_ascii_case("inf") || w.eq_ignore_ascii_case("nan"));

    choice((hex, decimal, special)).map(ToString::to_string)
}

/// Number with an optional leading minus sign.
pub(crate) fn signed_number<'src>()
-> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    just('-')
        .or_not()
        .then(number())
        .map(|(sign, n)| match sign {
            Some(_) => format!("-{n}"),
            None => n,
        })
}

/// Duration such as `5m`, `1h30m` or `1.5s`.
pub(crate) fn duration<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    let unit = choice((
        just("ms"),
        just("us"),
        just("µs"),
        just("ns"),
        just("s"),
        just("m"),
        just("h"),
        just("d"),
        just("w"),
        just("y"),
    ));

    text::digits(10)
        .then(just('.').then(text::digits(10)).or_not())
        .then(unit)
        .repeated()
        .at_least(1)
        .to_slice()
        .map(ToString::to_string)
}

const BYTE_UNITS: &[&str] = &[
    "b", "kb", "kib", "mb", "mib", "gb", "gib", "tb", "tib", "pb", "pib", "eb", "eib",
];

/// Byte quantity such as `20MB` or `1.5KiB`.
pub(crate) fn bytes<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    let unit = any()
        .filter(char::is_ascii_alphabetic)
        .repeated()
        .at_least(1)
        .to_slice()
        .filter(|u: &&str| BYTE_UNITS.iter().any(|b| b.eq_ignore_ascii_case(u)));

    text::digits(10)
        .then(just('.').then(text::digits(10)).or_not())
        .then(unit)
        .to_slice()
        .map(ToString::to_string)
}

pub(crate) fn match_op<'src>() -> impl Parser<'src, &'src str, MatchOp, Extra<'src>> + Clone {
    choice((
        just("=~").to(MatchOp::RegexMatch),
        just("!~").to(MatchOp::RegexNoMatch),
        just("!=").to(MatchOp::NotEqual),
        just("=").to(MatchOp::Equal),
    ))
}

/// `name op "value"`
pub(crate) fn matcher<'src>() -> impl Parser<'src, &'src str, Matcher, Extra<'src>> + Clone {
    label_name()
        .padded()
        .then(match_op().padded())
        .then(string_literal().padded())
        .map(|((name, op), value)| Matcher { name, op, value })
}

/// `{m1, m2, ...}`, trailing comma allowed.
pub(crate) fn matcher_list<'src>()
-> impl Parser<'src, &'src str, Vec<Matcher>, Extra<'src>> + Clone {
    matcher()
        .separated_by(just(','))
        .allow_trailing()
        .collect::<Vec<_>>()
        .padded()
        .delimited_by(just('{'), just('}'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all<'src, O>(
        p: impl Parser<'src, &'src str, O, Extra<'src>>,
        input: &'src str,
    ) -> Option<O> {
        p.then_ignore(end()).parse(input).into_result().ok()
    }

    #[test]
    fn test_string_literal_forms() {
        assert_eq!(parse_all(string_literal(), r#""a\"b""#).as_deref(), Some("a\"b"));
        assert_eq!(parse_all(string_literal(), "'it\\'s'").as_deref(), Some("it's"));
        assert_eq!(parse_all(string_literal(), r"`a\.b`").as_deref(), Some(r"a\.b"));
        assert_eq!(parse_all(string_literal(), r#""\u00e9""#).as_deref(), Some("é"));
        assert!(parse_all(string_literal(), r#""unterminated"#).is_none());
    }

    #[test]
    fn test_byte_and_long_escapes() {
        assert_eq!(parse_all(string_literal(), r#""\x41""#).as_deref(), Some("A"));
        assert_eq!(parse_all(string_literal(), r#""\101\102""#).as_deref(), Some("AB"));
        assert_eq!(parse_all(string_literal(), r#""\xc3\xa9""#).as_deref(), Some("é"));
        assert_eq!(parse_all(string_literal(), r#""\303\251""#).as_deref(), Some("é"));
        assert_eq!(
            parse_all(string_literal(), r#""\U0001F600""#).as_deref(),
            Some("\u{1F600}")
        );
        assert_eq!(parse_all(string_literal(), r"'\x00'").as_deref(), Some("\0"));
    }

    #[test]
    fn test_bad_escapes_rejected() {
        for input in [
            r#""\xc3""#,
            r#""\x4""#,
            r#""\400""#,
            r#""\18""#,
            r#""\UFFFFFFFF""#,
            r#""\q""#,
        ] {
            assert!(parse_all(string_literal(), input).is_none(), "{input}");
        }
    }

    #[test]
    fn test_numbers() {
        for n in ["1", "1.5", ".5", "1e3", "2.5E-3", "0x1F", "Inf", "NaN"] {
            assert_eq!(parse_all(number(), n).as_deref(), Some(n), "{n}");
        }
        assert!(parse_all(number(), "info").is_none());
    }

    #[test]
    fn test_durations() {
        for d in ["5m", "1h30m", "500ms", "1.5s", "2w"] {
            assert_eq!(parse_all(duration(), d).as_deref(), Some(d), "{d}");
        }
        assert!(parse_all(duration(), "5").is_none());
    }

    #[test]
    fn test_bytes() {
        assert_eq!(parse_all(bytes(), "20MB").as_deref(), Some("20MB"));
        assert_eq!(parse_all(bytes(), "1.5KiB").as_deref(), Some("1.5KiB"));
        assert!(parse_all(bytes(), "5m").is_none());
    }

    #[test]
    fn test_matcher_list() {
        let matchers = parse_all(matcher_list(), r#"{ a="1", b=~"x|y", }"#).unwrap();
        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers[1].op, MatchOp::RegexMatch);
        assert_eq!(parse_all(matcher_list(), "{}"), Some(vec![]));
    }

    #[test]
    fn test_keyword_is_whole_word() {
        assert!(parse_all(keyword("or"), "OR").is_some());
        assert!(parse_all(keyword("or"), "order").is_none());
    }
}
