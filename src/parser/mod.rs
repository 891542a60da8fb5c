//! Binding expression parser (v0.1)
//!
//! Turns text like `a[i + 1].$hex4 * 2` into a tree of bindings. Parsing is
//! recursive descent by precedence level:
//!
//! | level | operators                                 |
//! |-------|-------------------------------------------|
//! | 0     | `?:`                                      |
//! | 1-10  | binary, `||` lowest to `*` `/` `%` highest |
//! | 11    | unary `!` `~` `-`                         |
//! | 12    | lookups `[]` `()` and `.field`            |
//!
//! Each level splits the text around its rightmost operator that is not inside
//! brackets or quotes. Text without operators is a literal or an identifier
//! handed to the [`BindResolver`] (usually the model's binding factory).
//!
//! Results are cached by normalized text; `x + x` yields one `x` binding.

mod binary;
mod bracket;
mod conditional;
mod literal;
mod lookup;
mod unary;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::bind::{Bind, ConstantBindValue};
use crate::converter::DataConverter;
use crate::error::{BindError, Result};
use crate::qualifier::QualifierFactoryMap;

pub use binary::{BinaryOp, BinaryOperator};
pub use bracket::Bracket;
pub use conditional::ConditionalOperator;
pub use literal::parse_literal;
pub use lookup::{test_lookup_binding, LookupOp, LookupOperator};
pub use unary::{UnaryOp, UnaryOperator};

/// Highest precedence level (lookups)
const LOOKUP_LEVEL: usize = 12;
const UNARY_LEVEL: usize = 11;

/// Whitespace is dropped except inside quotes and between identifier characters.
static NORMALIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s+|\s*([^A-Za-z0-9$_ ']+|'[^']*')\s*|\s+$").expect("valid regex")
});

static NOT_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.$]+").expect("valid regex"));

pub(crate) fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$')
}

/// Source of identifier bindings.
///
/// `is_lookup` asks for a fresh instance that an enclosing `[]`, `()` or `.`
/// operator can index without disturbing other users of the same name.
pub trait BindResolver {
    fn bind_value(&self, name: &str, is_lookup: bool) -> Result<Option<Bind>>;
}

pub struct ExpressionParser {
    cache: RefCell<FxHashMap<String, Bind>>,
    brackets: Bracket,
    qualifiers: Rc<QualifierFactoryMap>,
    converter: Rc<DataConverter>,
}

impl ExpressionParser {
    pub fn new(qualifiers: Rc<QualifierFactoryMap>, converter: Rc<DataConverter>) -> Self {
        Self {
            cache: RefCell::new(FxHashMap::default()),
            brackets: Bracket::expression_chain(),
            qualifiers,
            converter,
        }
    }

    /// Parse a complete expression. `Ok(None)` means the text was empty or
    /// named an identifier the resolver doesn't know.
    pub fn parse_expression(&self, expression: &str, resolver: &dyn BindResolver) -> Result<Option<Bind>> {
        let result = self.parse(expression, None, false, resolver);
        if let Err(err) = &result {
            debug!(expression, error = %err, "Failed to parse binding expression");
        }
        result
    }

    /// Parse `uri` starting at `precedence`. `None` means a top level call and
    /// normalizes whitespace first.
    pub(crate) fn parse(
        &self,
        uri: &str,
        precedence: Option<usize>,
        is_lookup: bool,
        resolver: &dyn BindResolver,
    ) -> Result<Option<Bind>> {
        let normalized;
        let uri = match precedence {
            Some(_) => uri,
            None => {
                normalized = NORMALIZE.replace_all(uri, "$1");
                normalized.as_ref()
            }
        };
        if uri.is_empty() {
            return Ok(None);
        }
        if !is_lookup {
            if let Some(bind) = self.cache.borrow().get(uri) {
                return Ok(Some(Rc::clone(bind)));
            }
        }

        let Some(bind) = self.parse_uncached(uri, precedence.unwrap_or(0), is_lookup, resolver)? else {
            return Ok(None);
        };
        if bind.name().is_empty() {
            bind.set_name(uri);
        }
        if let Some(lookup) = bind.as_lookup() {
            lookup.set_index(&[]);
        }
        if !is_lookup {
            trace!(uri, "Caching parsed binding");
            self.cache
                .borrow_mut()
                .insert(uri.to_string(), Rc::clone(&bind));
        }
        Ok(Some(bind))
    }

    fn parse_uncached(
        &self,
        uri: &str,
        precedence: usize,
        is_lookup: bool,
        resolver: &dyn BindResolver,
    ) -> Result<Option<Bind>> {
        let unrecognized = NOT_IDENTIFIER.find(uri).map(|m| m.as_str().to_string());

        if unrecognized.is_some() {
            for level in precedence..=LOOKUP_LEVEL {
                let parsed = match level {
                    0 => conditional::parse(self, uri, level, resolver)?,
                    UNARY_LEVEL => unary::parse(self, uri, level, resolver)?,
                    LOOKUP_LEVEL => lookup::parse(self, uri, level, resolver)?,
                    _ => binary::parse(self, uri, level, resolver)?,
                };
                if parsed.is_some() {
                    return Ok(parsed);
                }
            }
        }

        match parse_literal(uri) {
            Ok(Some(value)) => return Ok(Some(ConstantBindValue::new(value))),
            Ok(None) => {}
            Err(err) if literal::starts_with_digit(uri) => return Err(err),
            Err(err) => trace!(uri, error = %err, "Not a literal"),
        }

        match unrecognized {
            Some(text) => Err(BindError::UnrecognizedIdentifier { text }),
            None => resolver.bind_value(uri, is_lookup),
        }
    }

    pub fn converter(&self) -> &Rc<DataConverter> {
        &self.converter
    }

    pub fn qualifiers(&self) -> &Rc<QualifierFactoryMap> {
        &self.qualifiers
    }

    /// Last position of `op` outside brackets. With `include_operator` the
    /// operator itself is part of the bracket test (for closing braces).
    pub fn find_last_index_of(&self, text: &str, op: &str, include_operator: bool) -> Option<usize> {
        let mut pos = text.rfind(op)?;
        while pos > 0 {
            let check = if include_operator {
                pos + op.len() - 1
            } else {
                pos - 1
            };
            if !self.brackets.is_in_bracket(text, check) {
                break;
            }
            pos = text[..pos].rfind(op)?;
        }
        Some(pos)
    }

    /// First position of `op` at or after `start` outside brackets.
    pub fn find_first_index_of(&self, text: &str, op: &str, start: usize) -> Option<usize> {
        let mut from = start;
        loop {
            let pos = from + text.get(from..)?.find(op)?;
            let check = (pos + op.len()).saturating_sub(2);
            if pos == 0 || !self.brackets.is_in_bracket(text, check) {
                return Some(pos);
            }
            from = pos + op.len();
        }
    }

    /// Position of the `close` that pairs with an `open` already consumed
    /// before `text`, skipping nested `open`/`close` pairs.
    pub fn find_matching_brace(&self, text: &str, open: &str, close: &str) -> Option<usize> {
        let mut pos: Option<usize> = None;
        let mut nested: Option<usize> = None;
        loop {
            pos = self.find_first_index_of(text, close, pos.map_or(0, |p| p + 1));
            nested = self.find_first_index_of(text, open, nested.map_or(0, |n| n + 1));
            match (pos, nested) {
                (Some(p), Some(n)) if p > n => continue,
                _ => return pos,
            }
        }
    }

    /// Split at commas that are not inside brackets or quotes.
    pub(crate) fn split_parameters<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut parts = Vec::new();
        let mut start = 0;
        for (pos, _) in text.match_indices(',') {
            if !self.brackets.is_in_bracket(text, pos) {
                parts.push(&text[start..pos]);
                start = pos + 1;
            }
        }
        parts.push(&text[start..]);
        parts
    }

    /// Number of cached expressions.
    pub fn binding_count(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Dispose every cached binding and forget them.
    pub fn dispose(&self) {
        let cached: Vec<Bind> = self.cache.borrow_mut().drain().map(|(_, bind)| bind).collect();
        for bind in cached {
            bind.dispose();
        }
    }
}

impl fmt::Debug for ExpressionParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionParser")
            .field("cached", &self.binding_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::{BindValue, VariableBindValue};
    use crate::progress::Progress;
    use crate::status::Status;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::cell::Cell;

    /// Variables by name; unknown names resolve to nothing.
    struct Vars {
        vars: FxHashMap<String, Bind>,
        calls: Cell<usize>,
    }

    impl Vars {
        fn new(entries: &[(&str, Value)]) -> Self {
            let vars = entries
                .iter()
                .map(|(name, value)| {
                    let var: Bind = VariableBindValue::new(value.clone());
                    var.set_name(name);
                    (name.to_string(), var)
                })
                .collect();
            Self {
                vars,
                calls: Cell::new(0),
            }
        }

        fn get(&self, name: &str) -> Bind {
            Rc::clone(&self.vars[name])
        }
    }

    impl BindResolver for Vars {
        fn bind_value(&self, name: &str, _is_lookup: bool) -> Result<Option<Bind>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.vars.get(name).cloned())
        }
    }

    fn parser() -> ExpressionParser {
        let converter = Rc::new(DataConverter::new());
        let qualifiers = Rc::new(QualifierFactoryMap::with_defaults(&converter));
        ExpressionParser::new(qualifiers, converter)
    }

    fn eval(parser: &ExpressionParser, vars: &Vars, text: &str) -> Value {
        match parser.parse_expression(text, vars) {
            Ok(Some(bind)) => bind.value(),
            Ok(None) => panic!("{text} parsed to nothing"),
            Err(err) => panic!("{text} failed: {err}"),
        }
    }

    fn error(parser: &ExpressionParser, vars: &Vars, text: &str) -> String {
        match parser.parse_expression(text, vars) {
            Err(err) => err.plain_message(),
            Ok(_) => panic!("{text} should not parse"),
        }
    }

    #[test]
    fn precedence_and_associativity() {
        let parser = parser();
        let vars = Vars::new(&[]);
        assert_eq!(eval(&parser, &vars, "1 + 2 * 3"), json!(7));
        assert_eq!(eval(&parser, &vars, "(1 + 2) * 3"), json!(9));
        assert_eq!(eval(&parser, &vars, "10 - 4 - 3"), json!(3));
        assert_eq!(eval(&parser, &vars, "2 * 3 == 6 && !false"), json!(true));
        assert_eq!(eval(&parser, &vars, "-2 * -3"), json!(6));
        assert_eq!(eval(&parser, &vars, "1e+2 + 1"), json!(101));
    }

    #[test]
    fn identifiers_and_writes() {
        let parser = parser();
        let vars = Vars::new(&[("a", json!(4)), ("b", json!(2))]);
        let sum = parser
            .parse_expression("a + 2", &vars)
            .ok()
            .flatten()
            .expect("a + 2 parses");
        assert_eq!(sum.value(), json!(6));
        assert_eq!(sum.name(), "a+2");

        sum.set_value(json!(10), &Progress::null(), false);
        assert_eq!(vars.get("a").value(), json!(8));
    }

    #[test]
    fn conditional_selects_branch() {
        let parser = parser();
        let vars = Vars::new(&[("flag", json!(true)), ("x", json!(1)), ("y", json!(2))]);
        assert_eq!(eval(&parser, &vars, "flag ? x : y"), json!(1));
        vars.get("flag").set_value(json!(false), &Progress::null(), false);
        assert_eq!(eval(&parser, &vars, "flag ? x : y"), json!(2));
        assert_eq!(eval(&parser, &vars, "flag ? 1 : x > 0 ? 3 : 4"), json!(3));
    }

    #[test]
    fn strings_keep_inner_spaces() {
        let parser = parser();
        let vars = Vars::new(&[]);
        assert_eq!(eval(&parser, &vars, "'a b' + 'c'"), json!("a bc"));
        assert_eq!(eval(&parser, &vars, "'x+y'"), json!("x+y"));
    }

    #[test]
    fn results_are_cached_by_normalized_text() {
        let parser = parser();
        let vars = Vars::new(&[("a", json!(1))]);
        let first = parser.parse_expression("a + 1", &vars).ok().flatten();
        let second = parser.parse_expression(" a+1 ", &vars).ok().flatten();
        match (first, second) {
            (Some(first), Some(second)) => assert!(Rc::ptr_eq(&first, &second)),
            _ => panic!("expected bindings"),
        }
        assert_eq!(vars.calls.get(), 1);
        // "a", "1" and "a+1"
        assert_eq!(parser.binding_count(), 3);

        parser.dispose();
        assert_eq!(parser.binding_count(), 0);
    }

    #[test]
    fn unknown_identifier_is_none() {
        let parser = parser();
        let vars = Vars::new(&[]);
        assert!(matches!(parser.parse_expression("missing", &vars), Ok(None)));
        assert!(matches!(parser.parse_expression("   ", &vars), Ok(None)));
    }

    #[test]
    fn syntax_errors() {
        let parser = parser();
        let vars = Vars::new(&[("a", json!(1)), ("b", json!(2))]);
        assert_eq!(
            error(&parser, &vars, "a +"),
            "Unrecognized identifier '+'."
        );
        assert_eq!(
            error(&parser, &vars, "? a : b"),
            "I found a '?' operator but nothing in front of it.  To be honest, I was expecting to find \
             something before the '?' in the following text: ?a:b"
        );
        assert_eq!(
            error(&parser, &vars, "a ? b"),
            "I found a '?' operator, but I couldn't find the matching ':' operator.  To be honest I was \
             expecting one in the following text: b"
        );
        assert_eq!(
            error(&parser, &vars, "a ?: b"),
            "I found a ':' imediately following a '?' operator.  To be honest, I was expecting to find \
             something between them."
        );
        assert_eq!(error(&parser, &vars, "12abc"), "Invalid literal '12abc'.");
        assert_eq!(
            error(&parser, &vars, "a + missing"),
            "Missing operands for the + operator."
        );
        assert_eq!(
            error(&parser, &vars, "a()"),
            "I found an empty operator '()'.  To be honest, I was expecting to find something inside."
        );
        assert_eq!(
            error(&parser, &vars, "a]"),
            "I found a ']' operator, but I couldn't find the matching '[' operator.  To be honest I was \
             expecting one in the following text: a]"
        );
        assert_eq!(
            error(&parser, &vars, "a[1]"),
            "'a' is not an array type.  It cannot be used with the [] operator."
        );
    }

    #[test]
    fn literal_arrays() {
        let parser = parser();
        let vars = Vars::new(&[]);
        assert_eq!(eval(&parser, &vars, "[1, 'a,b', true]"), json!([1, "a,b", true]));
        assert_eq!(eval(&parser, &vars, "[1, 2] + 1"), json!([2, 3]));
        assert_eq!(eval(&parser, &vars, "[]"), json!([]));
    }

    #[test]
    fn operator_errors_become_status() {
        let parser = parser();
        let vars = Vars::new(&[("s", json!({"a": 1}))]);
        let bind = parser
            .parse_expression("-s", &vars)
            .ok()
            .flatten()
            .expect("-s parses");
        assert_eq!(bind.value(), Value::Null);
        assert_eq!(
            bind.status(),
            Some(Status::error("Operator '-' does not support object types"))
        );
    }

    #[test]
    fn bracket_helpers() {
        let parser = parser();
        assert_eq!(parser.find_last_index_of("a[b+c]+d", "+", false), Some(6));
        assert_eq!(parser.find_last_index_of("a[b+c]", "+", false), None);
        assert_eq!(parser.find_last_index_of("a[0][1]", "]", true), Some(6));
        assert_eq!(parser.find_first_index_of("(a?b:c)?d:e", "?", 0), Some(7));
        assert_eq!(parser.find_matching_brace("b?c:d:e", "?", ":"), Some(5));
        assert_eq!(
            parser.split_parameters("1,f(2,3),'x,y'"),
            vec!["1", "f(2,3)", "'x,y'"]
        );
    }
}
