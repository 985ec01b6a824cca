//! Builtin functions available to every code unit.

use crate::core::types::RuntimeFault;
use crate::lang::ast::BinaryOp;
use crate::lang::eval::{
    Host, arity_error, binary_op, compare, nested_list, type_error, value_error, values_equal,
};
use crate::lang::value::Value;

/// Upper bound on list and string lengths produced by builtins, repetition
/// and concatenation.
pub(crate) const MAX_SEQUENCE_LEN: usize = 1_000_000;

/// Dispatch a builtin by name. `None` when no builtin has that name.
pub(crate) fn call<H: Host>(
    name: &str,
    args: Vec<Value>,
    host: &mut H,
) -> Option<Result<Value, RuntimeFault>> {
    let result = match name {
        "print" => {
            let line = args
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            host.write(&line);
            host.write("\n");
            Ok(Value::None)
        }
        "len" => exactly::<1>(name, args).and_then(|[x]| len(&x)),
        "str" => exactly::<1>(name, args).map(|[x]| Value::Str(x.to_string())),
        "int" => exactly::<1>(name, args).and_then(|[x]| to_int(x)),
        "float" => exactly::<1>(name, args).and_then(|[x]| to_float(x)),
        "range" => range(args),
        "upper" => exactly::<1>(name, args).and_then(|[x]| map_str(name, x, |s| s.to_uppercase())),
        "lower" => exactly::<1>(name, args).and_then(|[x]| map_str(name, x, |s| s.to_lowercase())),
        "split" => split(args),
        "join" => join(args),
        "contains" => exactly::<2>(name, args).and_then(|[container, item]| contains(&container, &item)),
        "sum" => exactly::<1>(name, args).and_then(|[x]| sum(x)),
        "min" => extreme(name, args, |ordering| ordering.is_lt()),
        "max" => extreme(name, args, |ordering| ordering.is_gt()),
        "sorted" => exactly::<1>(name, args).and_then(|[x]| sorted(x)),
        "append" => exactly::<2>(name, args).and_then(|[list, item]| append(list, item)),
        "type" => exactly::<1>(name, args).map(|[x]| Value::Str(x.type_name().to_string())),
        _ => return None,
    };
    Some(result)
}

fn exactly<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], RuntimeFault> {
    let given = args.len();
    <[Value; N]>::try_from(args).map_err(|_| arity_error(name, &N.to_string(), given))
}

fn expect_list(name: &str, value: Value) -> Result<Vec<Value>, RuntimeFault> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(type_error(format!(
            "{name}() expects a list, got '{}'",
            other.type_name()
        ))),
    }
}

fn expect_str(name: &str, value: Value) -> Result<String, RuntimeFault> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(type_error(format!(
            "{name}() expects a str, got '{}'",
            other.type_name()
        ))),
    }
}

fn len(value: &Value) -> Result<Value, RuntimeFault> {
    let n = match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.len(),
        other => {
            return Err(type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )));
        }
    };
    i64::try_from(n).map(Value::Int).map_err(|_| value_error("length overflows int"))
}

fn to_int(value: Value) -> Result<Value, RuntimeFault> {
    match value {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) if f.is_finite() && f.abs() < 9.2e18 => Ok(Value::Int(f.trunc() as i64)),
        Value::Float(f) => Err(value_error(format!("cannot convert float {f} to int"))),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| value_error(format!("invalid literal for int(): '{s}'"))),
        other => Err(type_error(format!(
            "int() argument must be a str or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn to_float(value: Value) -> Result<Value, RuntimeFault> {
    match value {
        Value::Float(f) => Ok(Value::Float(f)),
        Value::Int(i) => Ok(Value::Float(i as f64)),
        Value::Bool(b) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| value_error(format!("could not convert string to float: '{s}'"))),
        other => Err(type_error(format!(
            "float() argument must be a str or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn range(args: Vec<Value>) -> Result<Value, RuntimeFault> {
    let bounds = args
        .iter()
        .map(|arg| match arg {
            Value::Int(i) => Ok(i128::from(*i)),
            other => Err(type_error(format!(
                "range() arguments must be int, not '{}'",
                other.type_name()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(arity_error("range", "1 to 3", bounds.len())),
    };
    if step == 0 {
        return Err(value_error("range() step must not be zero"));
    }
    let count = if (step > 0 && start < stop) || (step < 0 && start > stop) {
        (stop - start - step.signum()) / step + 1
    } else {
        0
    };
    if count > MAX_SEQUENCE_LEN as i128 {
        return Err(value_error(format!(
            "range of {count} items exceeds the limit of {MAX_SEQUENCE_LEN}"
        )));
    }
    let items = (0..count)
        .map(|k| i64::try_from(start + k * step).map(Value::Int))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| value_error("range() bounds overflow int"))?;
    Ok(Value::List(items))
}

fn map_str(name: &str, value: Value, f: impl Fn(&str) -> String) -> Result<Value, RuntimeFault> {
    expect_str(name, value).map(|s| Value::Str(f(&s)))
}

fn split(args: Vec<Value>) -> Result<Value, RuntimeFault> {
    let given = args.len();
    let mut args = args.into_iter();
    let (Some(text), separator, None) = (args.next(), args.next(), args.next()) else {
        return Err(arity_error("split", "1 or 2", given));
    };
    let text = expect_str("split", text)?;
    let parts: Vec<Value> = match separator {
        None | Some(Value::None) => text
            .split_whitespace()
            .map(|part| Value::Str(part.to_string()))
            .collect(),
        Some(sep) => {
            let sep = expect_str("split", sep)?;
            if sep.is_empty() {
                return Err(value_error("empty separator"));
            }
            text.split(sep.as_str())
                .map(|part| Value::Str(part.to_string()))
                .collect()
        }
    };
    Ok(Value::List(parts))
}

/// `join(items, sep = "")`: items are rendered with `str()`.
fn join(args: Vec<Value>) -> Result<Value, RuntimeFault> {
    let given = args.len();
    let mut args = args.into_iter();
    let (Some(items), separator, None) = (args.next(), args.next(), args.next()) else {
        return Err(arity_error("join", "1 or 2", given));
    };
    let items = expect_list("join", items)?;
    let separator = match separator {
        None => String::new(),
        Some(sep) => expect_str("join", sep)?,
    };
    let joined = items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(&separator);
    Ok(Value::Str(joined))
}

fn contains(container: &Value, item: &Value) -> Result<Value, RuntimeFault> {
    match (container, item) {
        (Value::Str(haystack), Value::Str(needle)) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
        (Value::List(items), item) => Ok(Value::Bool(items.iter().any(|x| values_equal(x, item)))),
        (container, item) => Err(type_error(format!(
            "contains() cannot search '{}' for '{}'",
            container.type_name(),
            item.type_name()
        ))),
    }
}

fn sum(value: Value) -> Result<Value, RuntimeFault> {
    expect_list("sum", value)?
        .into_iter()
        .try_fold(Value::Int(0), |acc, item| binary_op(BinaryOp::Add, acc, item))
}

fn extreme(
    name: &str,
    args: Vec<Value>,
    prefer: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, RuntimeFault> {
    let items = match <[Value; 1]>::try_from(args) {
        Ok([single]) => expect_list(name, single)?,
        Err(args) => args,
    };
    let mut items = items.into_iter();
    let Some(mut best) = items.next() else {
        return Err(value_error(format!("{name}() arg is an empty sequence")));
    };
    for item in items {
        if prefer(compare(&item, &best, BinaryOp::Lt)?) {
            best = item;
        }
    }
    Ok(best)
}

fn sorted(value: Value) -> Result<Value, RuntimeFault> {
    let mut items = expect_list("sorted", value)?;
    let mut failure = None;
    items.sort_by(|a, b| {
        compare(a, b, BinaryOp::Lt).unwrap_or_else(|err| {
            failure.get_or_insert(err);
            std::cmp::Ordering::Equal
        })
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(Value::List(items)),
    }
}

/// Values are immutable, so `append` returns a new list.
fn append(list: Value, item: Value) -> Result<Value, RuntimeFault> {
    let mut items = expect_list("append", list)?;
    if items.len() >= MAX_SEQUENCE_LEN {
        return Err(value_error(format!("list exceeds {MAX_SEQUENCE_LEN} items")));
    }
    items.push(item);
    nested_list(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;

    struct NullHost(String);

    impl Host for NullHost {
        fn write(&mut self, text: &str) {
            self.0.push_str(text);
        }

        fn tick(&mut self) -> Result<(), RuntimeFault> {
            Ok(())
        }

        fn delegate(&mut self, _chunk: String, _question: String) -> String {
            String::new()
        }
    }

    fn call_ok(name: &str, args: Vec<Value>) -> Value {
        let mut host = NullHost(String::new());
        call(name, args, &mut host)
            .expect("builtin exists")
            .expect("builtin succeeds")
    }

    fn call_err(name: &str, args: Vec<Value>) -> RuntimeFault {
        let mut host = NullHost(String::new());
        call(name, args, &mut host)
            .expect("builtin exists")
            .expect_err("builtin fails")
    }

    fn s(text: &str) -> Value {
        Value::Str(text.to_string())
    }

    fn ints(values: &[i64]) -> Value {
        Value::List(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn unknown_names_are_not_builtins() {
        let mut host = NullHost(String::new());
        assert!(call("open", Vec::new(), &mut host).is_none());
    }

    #[test]
    fn print_joins_arguments_with_spaces() {
        let mut host = NullHost(String::new());
        let result = call("print", vec![s("a"), Value::Int(1), ints(&[2])], &mut host);
        assert_eq!(result, Some(Ok(Value::None)));
        assert_eq!(host.0, "a 1 [2]\n");
    }

    #[test]
    fn range_forms() {
        assert_eq!(call_ok("range", vec![Value::Int(3)]), ints(&[0, 1, 2]));
        assert_eq!(call_ok("range", vec![Value::Int(2), Value::Int(5)]), ints(&[2, 3, 4]));
        assert_eq!(
            call_ok("range", vec![Value::Int(5), Value::Int(0), Value::Int(-2)]),
            ints(&[5, 3, 1])
        );
        assert_eq!(call_ok("range", vec![Value::Int(-1)]), ints(&[]));
        assert_eq!(
            call_err("range", vec![Value::Int(0), Value::Int(1), Value::Int(0)]).kind,
            ErrorKind::ValueError
        );
        assert_eq!(
            call_err("range", vec![Value::Int(i64::MAX)]).kind,
            ErrorKind::ValueError
        );
    }

    #[test]
    fn string_helpers() {
        assert_eq!(
            call_ok("split", vec![s(" a  b ")]),
            Value::List(vec![s("a"), s("b")])
        );
        assert_eq!(
            call_ok("split", vec![s("a,b"), s(",")]),
            Value::List(vec![s("a"), s("b")])
        );
        assert_eq!(call_ok("join", vec![ints(&[1, 2]), s("-")]), s("1-2"));
        assert_eq!(call_ok("upper", vec![s("abc")]), s("ABC"));
        assert_eq!(call_ok("contains", vec![s("haystack"), s("st")]), Value::Bool(true));
        assert_eq!(call_ok("contains", vec![ints(&[1, 2]), Value::Float(2.0)]), Value::Bool(true));
    }

    #[test]
    fn aggregates() {
        assert_eq!(call_ok("sum", vec![ints(&[1, 2, 3])]), Value::Int(6));
        assert_eq!(
            call_ok("sum", vec![Value::List(vec![Value::Int(1), Value::Float(0.5)])]),
            Value::Float(1.5)
        );
        assert_eq!(call_ok("min", vec![ints(&[3, 1, 2])]), Value::Int(1));
        assert_eq!(call_ok("max", vec![Value::Int(3), Value::Int(7)]), Value::Int(7));
        assert_eq!(call_ok("sorted", vec![ints(&[3, 1, 2])]), ints(&[1, 2, 3]));
        assert_eq!(call_err("min", vec![ints(&[])]).kind, ErrorKind::ValueError);
        assert_eq!(
            call_err("sorted", vec![Value::List(vec![Value::Int(1), s("a")])]).kind,
            ErrorKind::TypeError
        );
    }

    #[test]
    fn conversions() {
        assert_eq!(call_ok("int", vec![s(" 42 ")]), Value::Int(42));
        assert_eq!(call_ok("int", vec![Value::Float(-2.7)]), Value::Int(-2));
        assert_eq!(call_ok("float", vec![s("2.5")]), Value::Float(2.5));
        assert_eq!(call_ok("str", vec![Value::Float(1.0)]), s("1.0"));
        assert_eq!(call_ok("type", vec![ints(&[])]), s("list"));
    }

    #[test]
    fn arity_is_checked() {
        let err = call_err("len", vec![s("a"), s("b")]);
        assert_eq!(err.kind, ErrorKind::TypeError);
        assert_eq!(err.message, "len() takes 1 argument(s) (2 given)");
    }

    #[test]
    fn append_returns_new_list() {
        assert_eq!(call_ok("append", vec![ints(&[1]), Value::Int(2)]), ints(&[1, 2]));
    }
}
