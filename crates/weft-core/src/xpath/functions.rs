//! Builtin function implementations.

use crate::error::Result;

use super::eval::{Ctx, XPathEval};
use super::{xpath_err, Value};

/// Dispatch a builtin by name. Returns `None` for unknown names so the
/// caller can produce the error.
pub(crate) fn call_builtin(
    eval: &XPathEval<'_>,
    name: &str,
    args: &[Value],
    ctx: &Ctx<'_>,
) -> Option<Result<Value>> {
    let result = match name {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        "not" => fn_not(args),
        "name" => fn_name(eval, args, ctx),
        "count" => fn_count(args),
        "min" => fn_min_max(eval, args, true),
        "max" => fn_min_max(eval, args, false),
        "position" => Ok(Value::Int(ctx.position as i64)),
        "last" => Ok(Value::Int(ctx.size as i64)),
        "string-length" => fn_string_length(eval, args, ctx),
        "substring" => fn_substring(eval, args),
        "contains" => fn_contains(eval, args),
        "string-join" => fn_string_join(eval, args),
        "current" => Ok(Value::Seq(ctx.current.to_vec())),
        _ => return None,
    };
    Some(result)
}

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(xpath_err(
            name,
            format!("expected {min}..{max} arguments, got {}", args.len()),
        ));
    }
    Ok(())
}

fn fn_not(args: &[Value]) -> Result<Value> {
    expect_args("not", args, 1, 1)?;
    Ok(Value::Bool(!args[0].truthy()))
}

fn fn_name(eval: &XPathEval<'_>, args: &[Value], ctx: &Ctx<'_>) -> Result<Value> {
    expect_args("name", args, 0, 1)?;
    let item = match args.first() {
        Some(Value::Seq(items)) => items.first().cloned(),
        Some(other) => {
            return Err(xpath_err(
                "name",
                format!("expected a node sequence, got {:?}", other.as_string(eval.doc())),
            ));
        }
        None => ctx.items.first().cloned(),
    };
    Ok(Value::Str(
        item.map(|i| i.node_name(eval.doc())).unwrap_or_default(),
    ))
}

fn fn_count(args: &[Value]) -> Result<Value> {
    expect_args("count", args, 1, 1)?;
    match &args[0] {
        Value::Seq(items) => Ok(Value::Int(items.len() as i64)),
        _ => Err(xpath_err("count", "expected a node sequence")),
    }
}

/// `min`/`max` over a sequence's numeric string-values, or over plain
/// numeric arguments.
fn fn_min_max(eval: &XPathEval<'_>, args: &[Value], want_min: bool) -> Result<Value> {
    let name = if want_min { "min" } else { "max" };
    let mut numbers = Vec::new();

    if let [Value::Seq(items)] = args {
        for item in items {
            let text = item.string_value(eval.doc());
            let n: f64 = text
                .trim()
                .parse()
                .map_err(|_| xpath_err(name, format!("non-numeric sequence item {text:?}")))?;
            numbers.push(n);
        }
    } else {
        for arg in args {
            if let Some(n) = arg.as_number(eval.doc()) {
                numbers.push(n);
            } else {
                return Err(xpath_err(
                    name,
                    format!("non-numeric argument {:?}", arg.as_string(eval.doc())),
                ));
            }
        }
    }

    if numbers.is_empty() {
        return Ok(Value::Seq(Vec::new()));
    }

    let folded = numbers
        .into_iter()
        .reduce(|a, b| if (b < a) == want_min { b } else { a })
        .unwrap();
    Ok(Value::Float(folded))
}

fn fn_string_length(eval: &XPathEval<'_>, args: &[Value], ctx: &Ctx<'_>) -> Result<Value> {
    expect_args("string-length", args, 0, 1)?;
    let s = match args.first() {
        Some(v) => v.as_string(eval.doc()),
        None => Value::Seq(ctx.items.to_vec()).as_string(eval.doc()),
    };
    Ok(Value::Int(s.chars().count() as i64))
}

/// `substring(s, start [, length])` with XPath's 1-based indexing.
fn fn_substring(eval: &XPathEval<'_>, args: &[Value]) -> Result<Value> {
    expect_args("substring", args, 2, 3)?;
    let s = args[0].as_string(eval.doc());
    let start = args[1]
        .as_number(eval.doc())
        .ok_or_else(|| xpath_err("substring", "start must be numeric"))? as i64;

    let chars: Vec<char> = s.chars().collect();
    let from = (start - 1).max(0) as usize;
    if from >= chars.len() {
        return Ok(Value::Str(String::new()));
    }

    let taken: String = match args.get(2) {
        Some(len) => {
            let len = len
                .as_number(eval.doc())
                .ok_or_else(|| xpath_err("substring", "length must be numeric"))?
                as i64;
            // A negative start eats into the requested length.
            let end = (start - 1 + len).max(0) as usize;
            chars[from..end.min(chars.len())].iter().collect()
        }
        None => chars[from..].iter().collect(),
    };
    Ok(Value::Str(taken))
}

fn fn_contains(eval: &XPathEval<'_>, args: &[Value]) -> Result<Value> {
    expect_args("contains", args, 2, 2)?;
    let haystack = args[0].as_string(eval.doc());
    let needle = args[1].as_string(eval.doc());
    Ok(Value::Bool(haystack.contains(&needle)))
}

fn fn_string_join(eval: &XPathEval<'_>, args: &[Value]) -> Result<Value> {
    expect_args("string-join", args, 1, 2)?;
    let separator = args
        .get(1)
        .map(|v| v.as_string(eval.doc()))
        .unwrap_or_default();
    match &args[0] {
        Value::Seq(items) => {
            let parts: Vec<String> = items.iter().map(|i| i.string_value(eval.doc())).collect();
            Ok(Value::Str(parts.join(&separator)))
        }
        other => Ok(Value::Str(other.as_string(eval.doc()))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Value, XPathEval};
    use crate::xml::Document;

    fn doc() -> Document {
        Document::parse(
            r#"<out><line n="3">alpha</line><line n="1">beta</line><line n="2">gamma</line></out>"#,
        )
        .unwrap()
    }

    fn eval(d: &Document, expr: &str) -> Value {
        XPathEval::new(d)
            .evaluate(expr, d.root())
            .unwrap_or_else(|e| panic!("eval failed for {expr:?}: {e}"))
    }

    #[test]
    fn boolean_functions() {
        let d = doc();
        assert_eq!(eval(&d, "true()"), Value::Bool(true));
        assert_eq!(eval(&d, "false()"), Value::Bool(false));
        assert_eq!(eval(&d, "not(false())"), Value::Bool(true));
        assert_eq!(eval(&d, "not(count(line))"), Value::Bool(false));
    }

    #[test]
    fn count_lines() {
        let d = doc();
        assert_eq!(eval(&d, "count(line)"), Value::Int(3));
        assert_eq!(eval(&d, "count(missing)"), Value::Int(0));
    }

    #[test]
    fn min_max_over_attributes() {
        let d = doc();
        assert_eq!(eval(&d, "min(line/@n)"), Value::Float(1.0));
        assert_eq!(eval(&d, "max(line/@n)"), Value::Float(3.0));
    }

    #[test]
    fn min_max_over_plain_numbers() {
        let d = doc();
        assert_eq!(eval(&d, "min(4, 2)"), Value::Float(2.0));
        assert_eq!(eval(&d, "max(4, 2)"), Value::Float(4.0));
    }

    #[test]
    fn string_length() {
        let d = doc();
        assert_eq!(eval(&d, "string-length('hello')"), Value::Int(5));
        assert_eq!(eval(&d, "string-length('')"), Value::Int(0));
    }

    #[test]
    fn substring_is_one_based() {
        let d = doc();
        assert_eq!(eval(&d, "substring('hello', 2)"), Value::Str("ello".into()));
        assert_eq!(eval(&d, "substring('hello', 2, 3)"), Value::Str("ell".into()));
        assert_eq!(eval(&d, "substring('hello', 9)"), Value::Str("".into()));
    }

    #[test]
    fn contains_substrings() {
        let d = doc();
        assert_eq!(eval(&d, "contains('workflow', 'flow')"), Value::Bool(true));
        assert_eq!(eval(&d, "contains('workflow', 'job')"), Value::Bool(false));
    }

    #[test]
    fn string_join_concatenates_values() {
        let d = doc();
        assert_eq!(
            eval(&d, "string-join(line, ',')"),
            Value::Str("alpha,beta,gamma".into())
        );
        assert_eq!(
            eval(&d, "string-join(line)"),
            Value::Str("alphabetagamma".into())
        );
    }

    #[test]
    fn name_of_first_item() {
        let d = doc();
        assert_eq!(eval(&d, "name(line)"), Value::Str("line".into()));
        assert_eq!(eval(&d, "name(line/@n)"), Value::Str("n".into()));
    }

    #[test]
    fn current_returns_evaluation_context() {
        let d = doc();
        // Inside a predicate, current() still refers to the outer node.
        assert_eq!(
            eval(&d, "count(line[count(current()) = 1])"),
            Value::Int(3)
        );
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let d = doc();
        assert!(XPathEval::new(&d).evaluate("not()", d.root()).is_err());
        assert!(XPathEval::new(&d)
            .evaluate("substring('x')", d.root())
            .is_err());
    }
}
