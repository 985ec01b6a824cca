//! `nom` parser for cell-language code units.
//!
//! Statements are separated by newlines or `;`. Blocks use braces, so
//! indentation carries no meaning. Horizontal whitespace is skipped between
//! tokens; newlines are only skipped inside brackets and between statements.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, one_of, satisfy, space0},
    combinator::{cut, map, not, opt, recognize, value, verify},
    error::{VerboseError, VerboseErrorKind, context, convert_error},
    multi::separated_list0,
    sequence::{pair, terminated, tuple},
};

use crate::lang::MAX_NESTING_DEPTH;
use crate::lang::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use crate::lang::value::Value;

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// Error context entries kept when rendering a parse failure.
const ERROR_TRACE_LIMIT: usize = 4;

const KEYWORDS: &[&str] = &[
    "if", "else", "for", "in", "and", "or", "not", "true", "false", "none",
];

// ============================================================================
// Public API
// ============================================================================

/// Parse a complete code unit.
///
/// Errors are rendered with line context by `convert_error`.
pub fn parse_program(source: &str) -> Result<Program, String> {
    match statements(source, 0) {
        Ok(("", statements)) => Ok(Program { statements }),
        Ok((rest, _)) => Err(unexpected_input(source, rest)),
        Err(nom::Err::Error(mut e)) | Err(nom::Err::Failure(mut e)) => {
            // Innermost entries come first; deep input stacks one per level.
            e.errors.truncate(ERROR_TRACE_LIMIT);
            Err(convert_error(source, e))
        }
        Err(nom::Err::Incomplete(_)) => Err("incomplete input".to_string()),
    }
}

fn unexpected_input(source: &str, rest: &str) -> String {
    let offset = source.len() - rest.len();
    let line = source[..offset].matches('\n').count() + 1;
    let snippet = rest.lines().next().unwrap_or_default().trim();
    format!("unexpected `{snippet}` at line {line}")
}

// ============================================================================
// Whitespace and separators
// ============================================================================

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn sp(input: &str) -> Res<'_, &str> {
    space0(input)
}

fn comment(input: &str) -> Res<'_, &str> {
    recognize(pair(char('#'), take_while(|c| c != '\n')))(input)
}

/// Skip whitespace (including newlines) and comments.
fn ws(input: &str) -> Res<'_, ()> {
    skip_filler(input, false)
}

/// Skip everything that may sit between statements, `;` included.
fn blank(input: &str) -> Res<'_, ()> {
    skip_filler(input, true)
}

fn skip_filler(input: &str, separators: bool) -> Res<'_, ()> {
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || (separators && c == ';'));
        if trimmed.starts_with('#') {
            let (after, _) = comment(trimmed)?;
            rest = after;
        } else {
            return Ok((trimmed, ()));
        }
    }
}

fn hard_error<'a, T>(input: &'a str, ctx: &'static str) -> Res<'a, T> {
    Err(nom::Err::Failure(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context(ctx))],
    }))
}

/// Enter one more level of nesting.
///
/// Brackets, blocks, call arguments, indexes, unary operators and each link
/// of an operator chain count as a level, since parsing or evaluating them
/// recurses once per level.
fn deeper(input: &str, depth: usize) -> Res<'_, usize> {
    if depth >= MAX_NESTING_DEPTH {
        hard_error(input, "nesting too deep")
    } else {
        Ok((input, depth + 1))
    }
}

/// A statement must be followed by a separator, a comment, a closing brace
/// or the end of input.
fn stmt_end(input: &str) -> Res<'_, ()> {
    let (rest, _) = sp(input)?;
    if rest.is_empty() || rest.starts_with(['\n', '\r', ';', '#', '}']) {
        Ok((rest, ()))
    } else {
        hard_error(rest, "end of statement")
    }
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    move |input| terminated(tag(word), not(satisfy(is_ident_char)))(input)
}

fn identifier(input: &str) -> Res<'_, &str> {
    verify(
        recognize(pair(satisfy(is_ident_start), take_while(is_ident_char))),
        |name: &str| !KEYWORDS.contains(&name),
    )(input)
}

// ============================================================================
// Statements
// ============================================================================

/// Statements up to a closing brace or the end of input.
fn statements(input: &str, depth: usize) -> Res<'_, Vec<Stmt>> {
    let mut out = Vec::new();
    let (mut rest, _) = blank(input)?;
    while !rest.is_empty() && !rest.starts_with('}') {
        let (after, stmt) = statement(rest, depth)?;
        let (after, _) = stmt_end(after)?;
        let (after, _) = blank(after)?;
        out.push(stmt);
        rest = after;
    }
    Ok((rest, out))
}

fn statement(input: &str, depth: usize) -> Res<'_, Stmt> {
    alt((
        |i| if_stmt(i, depth),
        |i| for_stmt(i, depth),
        |i| assignment(i, depth),
        map(|i| expression(i, depth), Stmt::Expr),
    ))(input)
}

fn block(input: &str, depth: usize) -> Res<'_, Vec<Stmt>> {
    let (rest, _) = context("opening brace", char('{'))(input)?;
    let (_, depth) = deeper(rest, depth)?;
    let (rest, body) = statements(rest, depth)?;
    let (rest, _) = cut(context("closing brace", char('}')))(rest)?;
    Ok((rest, body))
}

fn assignment(input: &str, depth: usize) -> Res<'_, Stmt> {
    let (rest, name) = identifier(input)?;
    let (rest, _) = sp(rest)?;
    let (rest, _) = char('=')(rest)?;
    let (rest, _) = not(char('='))(rest)?;
    let (rest, _) = sp(rest)?;
    let (rest, value) = cut(context("assignment value", |i| expression(i, depth)))(rest)?;
    Ok((
        rest,
        Stmt::Assign {
            name: name.to_string(),
            value,
        },
    ))
}

fn conditional_branch(input: &str, depth: usize) -> Res<'_, (Expr, Vec<Stmt>)> {
    let (rest, _) = sp(input)?;
    let (rest, cond) = cut(context("condition", |i| expression(i, depth)))(rest)?;
    let (rest, _) = sp(rest)?;
    let (rest, body) = cut(|i| block(i, depth))(rest)?;
    Ok((rest, (cond, body)))
}

fn if_stmt(input: &str, depth: usize) -> Res<'_, Stmt> {
    let (mut rest, _) = keyword("if")(input)?;
    let (after, first) = conditional_branch(rest, depth)?;
    rest = after;

    let mut branches = vec![first];
    let mut otherwise = None;
    loop {
        // `else` may sit on the line after the closing brace.
        let (after_ws, _) = ws(rest)?;
        let Ok((after_else, _)) = keyword("else")(after_ws) else {
            break;
        };
        let (after_else, _) = sp(after_else)?;
        if let Ok((after_if, _)) = keyword("if")(after_else) {
            let (after, branch) = conditional_branch(after_if, depth)?;
            branches.push(branch);
            rest = after;
        } else {
            let (after, body) = cut(|i| block(i, depth))(after_else)?;
            otherwise = Some(body);
            rest = after;
            break;
        }
    }
    Ok((rest, Stmt::If { branches, otherwise }))
}

fn for_stmt(input: &str, depth: usize) -> Res<'_, Stmt> {
    let (rest, _) = keyword("for")(input)?;
    let (rest, _) = sp(rest)?;
    let (rest, var) = cut(context("loop variable", identifier))(rest)?;
    let (rest, _) = sp(rest)?;
    let (rest, _) = cut(context("`in`", keyword("in")))(rest)?;
    let (rest, _) = sp(rest)?;
    let (rest, iter) = cut(context("loop iterable", |i| expression(i, depth)))(rest)?;
    let (rest, _) = sp(rest)?;
    let (rest, body) = cut(|i| block(i, depth))(rest)?;
    Ok((
        rest,
        Stmt::For {
            var: var.to_string(),
            iter,
            body,
        },
    ))
}

// ============================================================================
// Expressions, lowest precedence first
// ============================================================================

fn expression(input: &str, depth: usize) -> Res<'_, Expr> {
    or_expr(input, depth)
}

fn or_expr(input: &str, depth: usize) -> Res<'_, Expr> {
    let (rest, first) = and_expr(input, depth)?;
    fold_binary(rest, first, depth, value(BinaryOp::Or, keyword("or")), and_expr)
}

fn and_expr(input: &str, depth: usize) -> Res<'_, Expr> {
    let (rest, first) = not_expr(input, depth)?;
    fold_binary(rest, first, depth, value(BinaryOp::And, keyword("and")), not_expr)
}

fn not_expr(input: &str, depth: usize) -> Res<'_, Expr> {
    if let Ok((after, _)) = keyword("not")(input) {
        let (rest, _) = sp(after)?;
        let (_, depth) = deeper(rest, depth)?;
        let (rest, operand) = cut(context("operand of `not`", |i| not_expr(i, depth)))(rest)?;
        return Ok((
            rest,
            Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            },
        ));
    }
    comparison(input, depth)
}

fn comparison(input: &str, depth: usize) -> Res<'_, Expr> {
    let (rest, first) = additive(input, depth)?;
    let op = alt((
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Lt, char('<')),
        value(BinaryOp::Gt, char('>')),
    ));
    fold_binary(rest, first, depth, op, additive)
}

fn additive(input: &str, depth: usize) -> Res<'_, Expr> {
    let (rest, first) = multiplicative(input, depth)?;
    let op = alt((value(BinaryOp::Add, char('+')), value(BinaryOp::Sub, char('-'))));
    fold_binary(rest, first, depth, op, multiplicative)
}

fn multiplicative(input: &str, depth: usize) -> Res<'_, Expr> {
    let (rest, first) = unary(input, depth)?;
    let op = alt((
        value(BinaryOp::FloorDiv, tag("//")),
        value(BinaryOp::Mul, char('*')),
        value(BinaryOp::Div, char('/')),
        value(BinaryOp::Mod, char('%')),
    ));
    fold_binary(rest, first, depth, op, unary)
}

/// Left-associative fold of `operand (op operand)*`.
///
/// The result nests one level deeper per operator, so each link counts
/// against the nesting limit.
fn fold_binary<'a>(
    input: &'a str,
    first: Expr,
    mut depth: usize,
    mut operator: impl FnMut(&'a str) -> Res<'a, BinaryOp>,
    mut operand: impl FnMut(&'a str, usize) -> Res<'a, Expr>,
) -> Res<'a, Expr> {
    let mut acc = first;
    let mut rest = input;
    loop {
        let (after_sp, _) = sp(rest)?;
        let Ok((after_op, op)) = operator(after_sp) else {
            return Ok((rest, acc));
        };
        (_, depth) = deeper(after_sp, depth)?;
        let (after_op, _) = ws(after_op)?;
        let (after, rhs) = match operand(after_op, depth) {
            Ok(parsed) => parsed,
            Err(nom::Err::Error(_)) => return hard_error(after_op, "right-hand operand"),
            Err(e) => return Err(e),
        };
        acc = Expr::Binary {
            op,
            left: Box::new(acc),
            right: Box::new(rhs),
        };
        rest = after;
    }
}

fn unary(input: &str, depth: usize) -> Res<'_, Expr> {
    if let Some(after) = input.strip_prefix('-') {
        let (rest, _) = sp(after)?;
        let (_, depth) = deeper(rest, depth)?;
        let (rest, operand) = cut(context("operand of `-`", |i| unary(i, depth)))(rest)?;
        return Ok((
            rest,
            Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            },
        ));
    }
    postfix(input, depth)
}

fn postfix(input: &str, mut depth: usize) -> Res<'_, Expr> {
    let (mut rest, mut expr) = primary(input, depth)?;
    while let Some(after) = rest.strip_prefix('[') {
        (_, depth) = deeper(after, depth)?;
        let (after, _) = ws(after)?;
        let (after, index) = cut(context("index expression", |i| expression(i, depth)))(after)?;
        let (after, _) = ws(after)?;
        let (after, _) = cut(context("closing bracket", char(']')))(after)?;
        expr = Expr::Index {
            target: Box::new(expr),
            index: Box::new(index),
        };
        rest = after;
    }
    Ok((rest, expr))
}

fn primary(input: &str, depth: usize) -> Res<'_, Expr> {
    context(
        "expression",
        alt((
            |i| parenthesized(i, depth),
            |i| list_literal(i, depth),
            string_literal,
            number,
            value(Expr::Literal(Value::Bool(true)), keyword("true")),
            value(Expr::Literal(Value::Bool(false)), keyword("false")),
            value(Expr::Literal(Value::None), keyword("none")),
            |i| call_or_name(i, depth),
        )),
    )(input)
}

fn parenthesized(input: &str, depth: usize) -> Res<'_, Expr> {
    let (rest, _) = char('(')(input)?;
    let (rest, depth) = deeper(rest, depth)?;
    let (rest, _) = ws(rest)?;
    let (rest, inner) = cut(context("parenthesized expression", |i| expression(i, depth)))(rest)?;
    let (rest, _) = ws(rest)?;
    let (rest, _) = cut(context("closing parenthesis", char(')')))(rest)?;
    Ok((rest, inner))
}

fn list_literal(input: &str, depth: usize) -> Res<'_, Expr> {
    let (rest, _) = char('[')(input)?;
    let (rest, depth) = deeper(rest, depth)?;
    let (rest, items) = comma_separated(rest, depth)?;
    let (rest, _) = cut(context("closing bracket", char(']')))(rest)?;
    Ok((rest, Expr::List(items)))
}

/// Comma-separated expressions with an optional trailing comma.
fn comma_separated(input: &str, depth: usize) -> Res<'_, Vec<Expr>> {
    let (rest, _) = ws(input)?;
    let (rest, items) =
        separated_list0(tuple((ws, char(','), ws)), |i| expression(i, depth))(rest)?;
    let (rest, _) = ws(rest)?;
    let (rest, _) = opt(char(','))(rest)?;
    let (rest, _) = ws(rest)?;
    Ok((rest, items))
}

fn call_or_name(input: &str, depth: usize) -> Res<'_, Expr> {
    let (rest, name) = identifier(input)?;
    let Some(after_paren) = rest.strip_prefix('(') else {
        return Ok((rest, Expr::Name(name.to_string())));
    };
    let (after_paren, depth) = deeper(after_paren, depth)?;
    let (rest, args) = comma_separated(after_paren, depth)?;
    let (rest, _) = cut(context("closing parenthesis", char(')')))(rest)?;
    Ok((
        rest,
        Expr::Call {
            name: name.to_string(),
            args,
        },
    ))
}

fn number(input: &str) -> Res<'_, Expr> {
    let (rest, text) = recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)?;
    let literal = if text.contains('.') {
        text.parse::<f64>().ok().map(Value::Float)
    } else {
        text.parse::<i64>().ok().map(Value::Int)
    };
    match literal {
        Some(v) => Ok((rest, Expr::Literal(v))),
        None => hard_error(input, "number literal out of range"),
    }
}

fn string_literal(input: &str) -> Res<'_, Expr> {
    let (body, quote) = one_of("\"'")(input)?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, '0')) => out.push('\0'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            '\n' => break,
            c if c == quote => {
                return Ok((&body[idx + c.len_utf8()..], Expr::Literal(Value::Str(out))));
            }
            c => out.push(c),
        }
    }
    hard_error(input, "unterminated string literal")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Expr {
        Expr::Literal(Value::Int(i))
    }

    fn parse(source: &str) -> Vec<Stmt> {
        parse_program(source).expect("program parses").statements
    }

    #[test]
    fn parses_assignment_with_precedence() {
        let stmts = parse("x = 1 + 2 * 3");
        assert_eq!(
            stmts,
            vec![Stmt::Assign {
                name: "x".to_string(),
                value: Expr::Binary {
                    op: BinaryOp::Add,
                    left: Box::new(int(1)),
                    right: Box::new(Expr::Binary {
                        op: BinaryOp::Mul,
                        left: Box::new(int(2)),
                        right: Box::new(int(3)),
                    }),
                },
            }]
        );
    }

    #[test]
    fn separators_and_comments() {
        let stmts = parse("# setup\nx = 1; y = 2  # trailing\n\n\nprint(x)");
        assert_eq!(stmts.len(), 3);
        assert!(matches!(&stmts[2], Stmt::Expr(e) if e.is_print_call()));
    }

    #[test]
    fn comparison_is_not_assignment() {
        let stmts = parse("x == 1");
        assert!(matches!(
            &stmts[0],
            Stmt::Expr(Expr::Binary { op: BinaryOp::Eq, .. })
        ));
    }

    #[test]
    fn if_else_chain_across_lines() {
        let source = "if x > 1 {\n  y = 1\n}\nelse if x == 1 { y = 2 }\nelse {\n  y = 3\n}";
        let stmts = parse(source);
        let Stmt::If { branches, otherwise } = &stmts[0] else {
            panic!("expected if statement, got {stmts:?}");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(otherwise.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn for_loop_over_call() {
        let stmts = parse("for i in range(3) { total = total + i }");
        let Stmt::For { var, iter, body } = &stmts[0] else {
            panic!("expected for statement");
        };
        assert_eq!(var, "i");
        assert!(matches!(iter, Expr::Call { name, .. } if name == "range"));
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn keywords_need_word_boundaries() {
        let stmts = parse("format = 1\nnotes = format\niffy = notes");
        assert_eq!(stmts.len(), 3);
        assert!(parse_program("if = 1").is_err());
    }

    #[test]
    fn string_escapes() {
        let stmts = parse(r#"s = "a\n\"b\"" + 'it\'s'"#);
        let Stmt::Assign { value: Expr::Binary { left, right, .. }, .. } = &stmts[0] else {
            panic!("expected concatenation");
        };
        assert_eq!(**left, Expr::Literal(Value::Str("a\n\"b\"".to_string())));
        assert_eq!(**right, Expr::Literal(Value::Str("it's".to_string())));
    }

    #[test]
    fn multiline_lists_and_trailing_commas() {
        let stmts = parse("xs = [\n  1,\n  2,\n]\nprint(xs[-1])");
        assert!(matches!(&stmts[0], Stmt::Assign { value: Expr::List(items), .. } if items.len() == 2));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = parse_program("s = \"abc").expect_err("must fail");
        assert!(err.contains("unterminated string literal"), "{err}");
    }

    #[test]
    fn dangling_operator_is_an_error() {
        let err = parse_program("x = (1 +").expect_err("must fail");
        assert!(err.contains("right-hand operand"), "{err}");
    }

    #[test]
    fn junk_after_statement_is_an_error() {
        let err = parse_program("run system shell command").expect_err("must fail");
        assert!(err.contains("end of statement"), "{err}");
    }

    #[test]
    fn stray_closing_brace_is_an_error() {
        let err = parse_program("x = 1\n}").expect_err("must fail");
        assert_eq!(err, "unexpected `}` at line 2");
    }

    #[test]
    fn deep_nesting_is_an_error_not_a_crash() {
        let source = format!("x = {}1{}", "(".repeat(5000), ")".repeat(5000));
        let err = parse_program(&source).expect_err("must fail");
        assert!(err.contains("nesting too deep"), "{err}");

        for deep in [
            format!("x = {}1{}", "[".repeat(200), "]".repeat(200)),
            format!("x = {}1", "-".repeat(200)),
            format!("x = {}true", "not ".repeat(200)),
            format!("x = {}", ["1"; 200].join(" + ")),
            format!("x = xs{}", "[0]".repeat(200)),
            format!("{}x = 1{}", "if true { ".repeat(200), " }".repeat(200)),
            format!("x = {}0{}", "len(".repeat(200), ")".repeat(200)),
        ] {
            let err = parse_program(&deep).expect_err("must fail");
            assert!(err.contains("nesting too deep"), "{err}");
        }
    }

    #[test]
    fn moderate_nesting_parses() {
        let source = format!("x = {}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(parse(&source), vec![Stmt::Assign { name: "x".to_string(), value: int(1) }]);
        let sum = format!("total = {}", ["1"; 60].join(" + "));
        assert_eq!(parse(&sum).len(), 1);
        assert!(parse_program(&format!("x = {}1{}", "[".repeat(40), "]".repeat(40))).is_ok());
    }

    #[test]
    fn empty_program_parses() {
        assert!(parse("").is_empty());
        assert!(parse("  \n# only a comment\n").is_empty());
    }
}
