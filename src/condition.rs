//! Document selections used for test-and-set conditions, iterator filters and
//! location removal.
//!
//! ```text
//! year >= 2000 and not (genre == "jazz" or id == "id:music:song::1")
//! ```
//!
//! A comparison against a field the document does not have is false,
//! regardless of the operator.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use std::cmp::Ordering;

use crate::error::{FeedError, Result};
use crate::types::{Document, FieldValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Integer(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Const(bool),
    Compare {
        field: String,
        op: CompareOp,
        value: Literal,
    },
    Not(Box<Selection>),
    And(Box<Selection>, Box<Selection>),
    Or(Box<Selection>, Box<Selection>),
}

impl Selection {
    pub fn parse(input: &str) -> Result<Self> {
        match all_consuming(ws(or_expr))(input) {
            Ok((_, selection)) => Ok(selection),
            Err(e) => Err(FeedError::InvalidRequest(format!(
                "invalid selection '{}': {}",
                input, e
            ))),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Selection::Const(b) => *b,
            Selection::Not(inner) => !inner.matches(doc),
            Selection::And(a, b) => a.matches(doc) && b.matches(doc),
            Selection::Or(a, b) => a.matches(doc) || b.matches(doc),
            Selection::Compare { field, op, value } => {
                if field == "id" {
                    return match value {
                        Literal::Text(s) => op.accepts(doc.id.as_str().cmp(s.as_str())),
                        _ => false,
                    };
                }
                match doc.get(field) {
                    Some(v) => compare_value(v, *op, value),
                    None => false,
                }
            }
        }
    }
}

fn compare_value(field: &FieldValue, op: CompareOp, literal: &Literal) -> bool {
    match (field, literal) {
        (FieldValue::Array(items), _) => items.iter().any(|v| compare_value(v, op, literal)),
        (FieldValue::Text(s), Literal::Text(l)) => op.accepts(s.as_str().cmp(l.as_str())),
        (FieldValue::Integer(i), Literal::Integer(l)) => op.accepts(i.cmp(l)),
        (FieldValue::Text(_), _) | (_, Literal::Text(_)) => false,
        (v, l) => {
            let lhs = v.as_f64();
            let rhs = match l {
                Literal::Integer(i) => Some(*i as f64),
                Literal::Float(f) => Some(*f),
                Literal::Text(_) => None,
            };
            match (lhs, rhs) {
                (Some(a), Some(b)) => a.partial_cmp(&b).map(|o| op.accepts(o)).unwrap_or(false),
                _ => false,
            }
        }
    }
}

// ── grammar ─────────────────────────────────────────────────────────────

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    ws(terminated(tag(kw), not(satisfy(is_ident_char))))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(input)
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
    ))(input)
}

fn quoted(input: &str) -> IResult<&str, Literal> {
    map(
        alt((
            delimited(char('"'), take_while(|c| c != '"'), char('"')),
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        )),
        |s: &str| Literal::Text(s.to_string()),
    )(input)
}

fn number(input: &str) -> IResult<&str, Literal> {
    map_res(
        recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1))))),
        |text: &str| -> std::result::Result<Literal, String> {
            if text.contains('.') {
                text.parse::<f64>()
                    .map(Literal::Float)
                    .map_err(|e| e.to_string())
            } else {
                text.parse::<i64>()
                    .map(Literal::Integer)
                    .map_err(|e| e.to_string())
            }
        },
    )(input)
}

fn comparison(input: &str) -> IResult<&str, Selection> {
    map(
        ws(tuple((identifier, ws(compare_op), alt((quoted, number))))),
        |(field, op, value)| Selection::Compare {
            field: field.to_string(),
            op,
            value,
        },
    )(input)
}

fn unary(input: &str) -> IResult<&str, Selection> {
    alt((
        map(preceded(keyword("not"), unary), |e| Selection::Not(Box::new(e))),
        ws(delimited(char('('), or_expr, char(')'))),
        value(Selection::Const(true), keyword("true")),
        value(Selection::Const(false), keyword("false")),
        comparison,
    ))(input)
}

fn and_expr(input: &str) -> IResult<&str, Selection> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(preceded(keyword("and"), unary))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Selection::And(Box::new(acc), Box::new(e))),
    ))
}

fn or_expr(input: &str) -> IResult<&str, Selection> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(keyword("or"), and_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Selection::Or(Box::new(acc), Box::new(e))),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;

    fn song() -> Document {
        Document::new(DocumentId::parse("id:music:song::1").unwrap())
            .with_field("year", FieldValue::Integer(1999))
            .with_field("rating", FieldValue::Float(4.5))
            .with_field("genre", FieldValue::Text("jazz".into()))
            .with_field(
                "tags",
                FieldValue::Array(vec![
                    FieldValue::Text("live".into()),
                    FieldValue::Text("remaster".into()),
                ]),
            )
    }

    #[test]
    fn simple_comparisons() {
        let doc = song();
        assert!(Selection::parse("year == 1999").unwrap().matches(&doc));
        assert!(Selection::parse("year < 2000").unwrap().matches(&doc));
        assert!(!Selection::parse("year >= 2000").unwrap().matches(&doc));
        assert!(Selection::parse("rating > 4").unwrap().matches(&doc));
        assert!(Selection::parse("rating <= 4.5").unwrap().matches(&doc));
        assert!(Selection::parse("genre == \"jazz\"").unwrap().matches(&doc));
        assert!(Selection::parse("genre != 'rock'").unwrap().matches(&doc));
    }

    #[test]
    fn boolean_composition_and_precedence() {
        let doc = song();
        let sel = Selection::parse("year == 1 or year == 1999 and genre == \"jazz\"").unwrap();
        assert!(sel.matches(&doc));
        let sel = Selection::parse("(year == 1 or year == 1999) and not genre == \"jazz\"").unwrap();
        assert!(!sel.matches(&doc));
        assert!(Selection::parse("not(year == 1)").unwrap().matches(&doc));
    }

    #[test]
    fn missing_field_is_false_for_every_operator() {
        let doc = song();
        assert!(!Selection::parse("album == \"x\"").unwrap().matches(&doc));
        assert!(!Selection::parse("album != \"x\"").unwrap().matches(&doc));
    }

    #[test]
    fn id_comparison() {
        let doc = song();
        assert!(Selection::parse("id == \"id:music:song::1\"").unwrap().matches(&doc));
        assert!(!Selection::parse("id == \"id:music:song::2\"").unwrap().matches(&doc));
    }

    #[test]
    fn array_matches_any_element() {
        let doc = song();
        assert!(Selection::parse("tags == \"live\"").unwrap().matches(&doc));
        assert!(!Selection::parse("tags == \"studio\"").unwrap().matches(&doc));
    }

    #[test]
    fn type_mismatch_is_false() {
        let doc = song();
        assert!(!Selection::parse("genre > 3").unwrap().matches(&doc));
        assert!(!Selection::parse("year == \"1999\"").unwrap().matches(&doc));
    }

    #[test]
    fn keywords_are_not_field_prefixes() {
        let doc = Document::new(DocumentId::parse("id:ns:t::x").unwrap())
            .with_field("notes", FieldValue::Integer(3))
            .with_field("order", FieldValue::Integer(1));
        assert!(Selection::parse("notes == 3").unwrap().matches(&doc));
        assert!(Selection::parse("order == 1 and notes > 2").unwrap().matches(&doc));
    }

    #[test]
    fn parse_errors_are_invalid_requests() {
        for bad in ["", "year ==", "== 3", "year == 3 and", "(year == 3", "year ~ 3"] {
            assert!(
                matches!(Selection::parse(bad), Err(FeedError::InvalidRequest(_))),
                "expected parse failure for {:?}",
                bad
            );
        }
    }

    #[test]
    fn constants() {
        let doc = song();
        assert!(Selection::parse("true").unwrap().matches(&doc));
        assert!(!Selection::parse("false or not true").unwrap().matches(&doc));
    }
}
