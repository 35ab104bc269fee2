//! The seam between the transport and whatever interprets payloads.
//!
//! A node hands every received payload to an [`Evaluator`] and routes the
//! returned text. Evaluators that need to send on their own (rather than
//! through the returned result) do so through the [`NetworkSink`] they are
//! given, which keeps them free of any transport types.

use crate::error::{EvalError, TransportError};

/// Outbound operations an evaluator may call back into.
pub trait NetworkSink: Send + Sync {
    /// Sends `text` to the upstream peer this node dialed.
    fn write(&self, text: &str) -> Result<(), TransportError>;

    /// Delivers `text` to every member of the broadcast group. Returns the
    /// number of members it was queued on.
    fn broadcast(&self, text: &str) -> Result<usize, TransportError>;
}

/// A sink with no network behind it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl NetworkSink for Detached {
    fn write(&self, _text: &str) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    fn broadcast(&self, _text: &str) -> Result<usize, TransportError> {
        Ok(0)
    }
}

pub trait Evaluator: Send + Sync + 'static {
    fn evaluate(&self, input: &str, sink: &dyn NetworkSink) -> Result<String, EvalError>;
}

impl<F> Evaluator for F
where
    F: Fn(&str) -> Result<String, EvalError> + Send + Sync + 'static,
{
    fn evaluate(&self, input: &str, _sink: &dyn NetworkSink) -> Result<String, EvalError> {
        self(input)
    }
}

/// Returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Evaluator for Echo {
    fn evaluate(&self, input: &str, _sink: &dyn NetworkSink) -> Result<String, EvalError> {
        Ok(input.to_string())
    }
}

/// Prefix arithmetic over numbers and strings.
///
/// ```text
/// (+ 1 2)                 => 3
/// (* 2 (- 10 4))          => 12
/// (concat "n=" (/ 9 2))   => n=4.5
/// (broadcast (+ 1 1))     => 2, also delivered to the group
/// (write "hi")            => hi, also sent upstream
/// ```
///
/// A bare word evaluates to itself. When the input holds several
/// expressions, each is evaluated and the last result is returned.
#[derive(Debug, Clone, Copy, Default)]
pub struct Calculator;

impl Evaluator for Calculator {
    fn evaluate(&self, input: &str, sink: &dyn NetworkSink) -> Result<String, EvalError> {
        let exprs = parse(input)?;
        let mut last = None;
        for expr in &exprs {
            last = Some(eval(expr, sink)?);
        }
        last.map(|value| value.to_string())
            .ok_or_else(|| EvalError::new("empty expression"))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Str(String),
    Word(String),
    List(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Number(f64),
    Str(String),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{n:.0}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Str(String),
    Atom(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some(escaped) => text.push(escaped),
                            None => return Err(EvalError::new("unterminated string")),
                        },
                        Some(other) => text.push(other),
                        None => return Err(EvalError::new("unterminated string")),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }
    Ok(tokens)
}

/// Deepest list nesting accepted. Parsing and evaluation recurse per level,
/// so this bounds stack use for input that arrives from the network.
const MAX_DEPTH: usize = 256;

fn parse(input: &str) -> Result<Vec<Expr>, EvalError> {
    let mut tokens = tokenize(input)?.into_iter();
    let mut exprs = Vec::new();
    while let Some(token) = tokens.next() {
        exprs.push(parse_expr(token, &mut tokens, 0)?);
    }
    Ok(exprs)
}

fn parse_expr(
    token: Token,
    rest: &mut impl Iterator<Item = Token>,
    depth: usize,
) -> Result<Expr, EvalError> {
    match token {
        Token::Open => {
            if depth >= MAX_DEPTH {
                return Err(EvalError::new("expression nested too deeply"));
            }
            let mut items = Vec::new();
            loop {
                match rest.next() {
                    Some(Token::Close) => return Ok(Expr::List(items)),
                    Some(token) => items.push(parse_expr(token, rest, depth + 1)?),
                    None => return Err(EvalError::new("missing ')'")),
                }
            }
        }
        Token::Close => Err(EvalError::new("unexpected ')'")),
        Token::Str(text) => Ok(Expr::Str(text)),
        Token::Atom(atom) => {
            // Words such as `inf` or `nan` stay words.
            let numeric = atom
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'));
            match atom.parse::<f64>() {
                Ok(n) if numeric && n.is_finite() => Ok(Expr::Number(n)),
                _ => Ok(Expr::Word(atom)),
            }
        }
    }
}

fn eval(expr: &Expr, sink: &dyn NetworkSink) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Str(s) | Expr::Word(s) => Ok(Value::Str(s.clone())),
        Expr::List(items) => {
            let Some((head, args)) = items.split_first() else {
                return Err(EvalError::new("cannot evaluate ()"));
            };
            let Expr::Word(op) = head else {
                return Err(EvalError::new("expected an operator"));
            };
            let args = args
                .iter()
                .map(|arg| eval(arg, sink))
                .collect::<Result<Vec<_>, _>>()?;
            apply(op, args, sink)
        }
    }
}

fn apply(op: &str, args: Vec<Value>, sink: &dyn NetworkSink) -> Result<Value, EvalError> {
    match op {
        "+" => numbers(op, &args).map(|ns| Value::Number(ns.iter().sum())),
        "*" => numbers(op, &args).map(|ns| Value::Number(ns.iter().product())),
        "-" => {
            let ns = numbers(op, &args)?;
            match ns.split_first() {
                None => Err(EvalError::new("- expects at least one argument")),
                Some((only, [])) => Ok(Value::Number(-only)),
                Some((first, rest)) => {
                    Ok(Value::Number(rest.iter().fold(*first, |acc, n| acc - n)))
                }
            }
        }
        "/" => {
            let ns = numbers(op, &args)?;
            let Some((first, rest)) = ns.split_first() else {
                return Err(EvalError::new("/ expects at least one argument"));
            };
            let mut acc = *first;
            for divisor in rest {
                if *divisor == 0.0 {
                    return Err(EvalError::new("division by zero"));
                }
                acc /= divisor;
            }
            Ok(Value::Number(acc))
        }
        "concat" => Ok(Value::Str(args.iter().map(Value::to_string).collect())),
        "write" | "broadcast" => {
            let [value] = <[Value; 1]>::try_from(args)
                .map_err(|_| EvalError::new(format!("{op} expects exactly one argument")))?;
            let text = value.to_string();
            let sent = if op == "write" {
                sink.write(&text)
            } else {
                sink.broadcast(&text).map(|_| ())
            };
            sent.map_err(|err| EvalError::new(format!("{op}: {err}")))?;
            Ok(value)
        }
        other => Err(EvalError::new(format!("unknown operator '{other}'"))),
    }
}

fn numbers(op: &str, args: &[Value]) -> Result<Vec<f64>, EvalError> {
    args.iter()
        .map(|arg| match arg {
            Value::Number(n) => Ok(*n),
            Value::Str(s) => Err(EvalError::new(format!("{op} expects numbers, got '{s}'"))),
        })
        .collect()
}
