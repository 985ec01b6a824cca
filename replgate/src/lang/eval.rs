//! Tree-walking evaluator for parsed code units.
//!
//! Evaluation never touches the outside world directly: output, step
//! accounting and delegate calls all go through [`Host`], which the runtime
//! implements on top of the output router.

use std::cmp::Ordering;

use crate::core::types::{ErrorKind, RuntimeFault};
use crate::lang::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use crate::lang::builtins;
use crate::lang::value::{Capability, Namespace, Value};
use crate::lang::{MAX_NESTING_DEPTH, clean_variable_name};

/// Services the evaluator needs from its embedding.
pub trait Host {
    /// Append text to the current output buffer.
    fn write(&mut self, text: &str);

    /// Charge one evaluation step.
    ///
    /// Fails with [`ErrorKind::Timeout`] once the step budget or deadline is
    /// exhausted.
    fn tick(&mut self) -> Result<(), RuntimeFault>;

    /// Synchronous delegate call. Failures come back as an error-marker string.
    fn delegate(&mut self, chunk: String, question: String) -> String;
}

/// Run `program` against `namespace`.
///
/// Bindings made before a fault stay in `namespace`. When the last statement
/// is a bare expression other than `print(...)`, its repr is echoed unless it
/// evaluates to `none`.
pub fn run_program<H: Host>(
    program: &Program,
    namespace: &mut Namespace,
    host: &mut H,
) -> Result<(), RuntimeFault> {
    let Some((last, body)) = program.statements.split_last() else {
        return Ok(());
    };
    let mut evaluator = Evaluator { namespace, host };
    evaluator.exec_block(body)?;
    match last {
        Stmt::Expr(expr) if !expr.is_print_call() => {
            let value = evaluator.eval(expr)?;
            if value != Value::None {
                evaluator.host.write(&format!("{}\n", value.repr()));
            }
            Ok(())
        }
        stmt => evaluator.exec(stmt),
    }
}

struct Evaluator<'a, H> {
    namespace: &'a mut Namespace,
    host: &'a mut H,
}

enum Callee {
    Capability(Capability),
    NotCallable(&'static str),
    Builtin,
}

impl<H: Host> Evaluator<'_, H> {
    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<(), RuntimeFault> {
        for stmt in stmts {
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), RuntimeFault> {
        self.host.tick()?;
        match stmt {
            Stmt::Assign { name, value } => {
                let value = self.eval(value)?;
                self.namespace.insert(name.clone(), value);
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::If { branches, otherwise } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                if let Some(body) = otherwise {
                    self.exec_block(body)?;
                }
            }
            Stmt::For { var, iter, body } => {
                let items = match self.eval(iter)? {
                    Value::List(items) => items,
                    Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
                    other => {
                        return Err(type_error(format!(
                            "'{}' object is not iterable",
                            other.type_name()
                        )));
                    }
                };
                for item in items {
                    self.host.tick()?;
                    self.namespace.insert(var.clone(), item);
                    self.exec_block(body)?;
                }
            }
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, RuntimeFault> {
        self.host.tick()?;
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => self
                .namespace
                .get(name)
                .cloned()
                .ok_or_else(|| name_error(name)),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .and_then(nested_list),
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(&target, &index)
            }
            Expr::Call { name, args } => self.call(name, args),
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                unary_op(*op, operand)
            }
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let left = self.eval(left)?;
                if left.truthy() { self.eval(right) } else { Ok(left) }
            }
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                let left = self.eval(left)?;
                if left.truthy() { Ok(left) } else { self.eval(right) }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary_op(*op, left, right)
            }
        }
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Value, RuntimeFault> {
        let callee = match self.namespace.get(name) {
            Some(Value::Capability(cap)) => Callee::Capability(*cap),
            Some(other) => Callee::NotCallable(other.type_name()),
            None => Callee::Builtin,
        };
        let args = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;
        match callee {
            Callee::Capability(cap) => self.invoke(cap, args),
            Callee::NotCallable(type_name) => {
                Err(type_error(format!("'{type_name}' object is not callable")))
            }
            Callee::Builtin => builtins::call(name, args, &mut *self.host).unwrap_or_else(|| Err(name_error(name))),
        }
    }

    fn invoke(&mut self, cap: Capability, args: Vec<Value>) -> Result<Value, RuntimeFault> {
        match cap {
            Capability::DelegateQuery => {
                let (chunk, question) = match args.as_slice() {
                    [question] => (String::new(), question.to_string()),
                    [chunk, question] => (chunk.to_string(), question.to_string()),
                    _ => return Err(arity_error(cap.name(), "1 or 2", args.len())),
                };
                Ok(Value::Str(self.host.delegate(chunk, question)))
            }
            Capability::FinalVar => {
                let [Value::Str(raw)] = args.as_slice() else {
                    return Err(type_error("FINAL_VAR() takes a single variable name string"));
                };
                let name = clean_variable_name(raw);
                let rendered = match self.namespace.get(name) {
                    Some(value) => value.to_string(),
                    None => format!("Error: Variable '{name}' not found"),
                };
                Ok(Value::Str(rendered))
            }
        }
    }
}

pub(crate) fn type_error(message: impl Into<String>) -> RuntimeFault {
    RuntimeFault::new(ErrorKind::TypeError, message)
}

pub(crate) fn value_error(message: impl Into<String>) -> RuntimeFault {
    RuntimeFault::new(ErrorKind::ValueError, message)
}

pub(crate) fn arity_error(name: &str, expected: &str, given: usize) -> RuntimeFault {
    type_error(format!("{name}() takes {expected} argument(s) ({given} given)"))
}

fn name_error(name: &str) -> RuntimeFault {
    RuntimeFault::new(ErrorKind::NameError, format!("name '{name}' is not defined"))
}

/// Wrap `items` in a list, refusing values nested past the limit.
pub(crate) fn nested_list(items: Vec<Value>) -> Result<Value, RuntimeFault> {
    let depth = 1 + items.iter().map(Value::nesting_depth).max().unwrap_or(0);
    if depth > MAX_NESTING_DEPTH {
        return Err(value_error(format!(
            "list nesting exceeds {MAX_NESTING_DEPTH} levels"
        )));
    }
    Ok(Value::List(items))
}

fn zero_division() -> RuntimeFault {
    RuntimeFault::new(ErrorKind::ZeroDivision, "division by zero")
}

fn overflow() -> RuntimeFault {
    value_error("integer overflow")
}

fn unsupported(op: BinaryOp, left: &Value, right: &Value) -> RuntimeFault {
    type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn unary_op(op: UnaryOp, operand: Value) -> Result<Value, RuntimeFault> {
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.truthy())),
        (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(type_error(format!(
            "bad operand type for unary -: '{}'",
            other.type_name()
        ))),
    }
}

pub(crate) fn binary_op(op: BinaryOp, left: Value, right: Value) -> Result<Value, RuntimeFault> {
    use Value::{Bool, Float, Int, List, Str};

    match (op, left, right) {
        (BinaryOp::Add, Int(a), Int(b)) => a.checked_add(b).map(Int).ok_or_else(overflow),
        (BinaryOp::Sub, Int(a), Int(b)) => a.checked_sub(b).map(Int).ok_or_else(overflow),
        (BinaryOp::Mul, Int(a), Int(b)) => a.checked_mul(b).map(Int).ok_or_else(overflow),
        (BinaryOp::FloorDiv, Int(a), Int(b)) => floor_div(a, b).map(Int),
        (BinaryOp::Mod, Int(a), Int(b)) => floor_mod(a, b).map(Int),
        (BinaryOp::Add, Str(a), Str(b)) => {
            concat_len(a.chars().count(), b.chars().count())?;
            Ok(Str(a + &b))
        }
        (BinaryOp::Add, List(mut a), List(b)) => {
            concat_len(a.len(), b.len())?;
            a.extend(b);
            Ok(List(a))
        }
        (BinaryOp::Mul, Str(s), Int(n)) | (BinaryOp::Mul, Int(n), Str(s)) => repeat_str(&s, n),
        (BinaryOp::Mul, List(items), Int(n)) | (BinaryOp::Mul, Int(n), List(items)) => {
            repeat_list(&items, n)
        }
        (BinaryOp::Div, left, right) => {
            let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
                return Err(unsupported(op, &left, &right));
            };
            if b == 0.0 {
                return Err(zero_division());
            }
            Ok(Float(a / b))
        }
        (BinaryOp::Eq, left, right) => Ok(Bool(values_equal(&left, &right))),
        (BinaryOp::Ne, left, right) => Ok(Bool(!values_equal(&left, &right))),
        (BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge, left, right) => {
            let ordering = compare(&left, &right, op)?;
            Ok(Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        (BinaryOp::And, left, right) => Ok(if left.truthy() { right } else { left }),
        (BinaryOp::Or, left, right) => Ok(if left.truthy() { left } else { right }),
        (op, left, right) => float_arithmetic(op, &left, &right),
    }
}

fn float_arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeFault> {
    let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
        return Err(unsupported(op, left, right));
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::FloorDiv if b == 0.0 => return Err(zero_division()),
        BinaryOp::FloorDiv => (a / b).floor(),
        BinaryOp::Mod if b == 0.0 => return Err(zero_division()),
        BinaryOp::Mod => a - b * (a / b).floor(),
        _ => return Err(unsupported(op, left, right)),
    };
    Ok(Value::Float(result))
}

/// Integer division rounding toward negative infinity.
fn floor_div(a: i64, b: i64) -> Result<i64, RuntimeFault> {
    if b == 0 {
        return Err(zero_division());
    }
    let quotient = a.checked_div(b).ok_or_else(overflow)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(quotient - 1)
    } else {
        Ok(quotient)
    }
}

/// Remainder carrying the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> Result<i64, RuntimeFault> {
    if b == 0 {
        return Err(zero_division());
    }
    let remainder = a.checked_rem(b).ok_or_else(overflow)?;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        Ok(remainder + b)
    } else {
        Ok(remainder)
    }
}

fn concat_len(left: usize, right: usize) -> Result<usize, RuntimeFault> {
    match left.checked_add(right) {
        Some(total) if total <= builtins::MAX_SEQUENCE_LEN => Ok(total),
        _ => Err(value_error(format!(
            "concatenation result exceeds {} items",
            builtins::MAX_SEQUENCE_LEN
        ))),
    }
}

fn repetition_count(len: usize, n: i64) -> Result<usize, RuntimeFault> {
    let count = usize::try_from(n.max(0)).map_err(|_| overflow())?;
    match len.checked_mul(count) {
        Some(total) if total <= builtins::MAX_SEQUENCE_LEN => Ok(count),
        _ => Err(value_error(format!(
            "repetition result exceeds {} items",
            builtins::MAX_SEQUENCE_LEN
        ))),
    }
}

fn repeat_str(s: &str, n: i64) -> Result<Value, RuntimeFault> {
    let count = repetition_count(s.chars().count(), n)?;
    Ok(Value::Str(s.repeat(count)))
}

fn repeat_list(items: &[Value], n: i64) -> Result<Value, RuntimeFault> {
    let count = repetition_count(items.len(), n)?;
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend_from_slice(items);
    }
    Ok(Value::List(out))
}

/// Equality with numeric promotion between `int` and `float`.
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            left.as_number() == right.as_number()
        }
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => left == right,
    }
}

/// Ordering for numbers, strings and lists of comparable items.
pub(crate) fn compare(left: &Value, right: &Value, op: BinaryOp) -> Result<Ordering, RuntimeFault> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b) {
                let ordering = compare(x, y, op)?;
                if ordering.is_ne() {
                    return Ok(ordering);
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| value_error("cannot order nan")),
            _ => Err(type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ))),
        },
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, RuntimeFault> {
    let position = |len: usize| -> Result<usize, RuntimeFault> {
        let Value::Int(i) = index else {
            return Err(type_error(format!(
                "indices must be integers, not '{}'",
                index.type_name()
            )));
        };
        resolve_index(*i, len).ok_or_else(|| {
            RuntimeFault::new(
                ErrorKind::IndexError,
                format!("{} index out of range", target.type_name()),
            )
        })
    };
    match target {
        Value::List(items) => Ok(items[position(items.len())?].clone()),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(chars[position(chars.len())?].to_string()))
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// Map a possibly negative index onto `0..len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}
