//! Factor expression language
//!
//! A small closed grammar evaluated against a match's typed context:
//!
//! ```text
//! home.xg > away.xg && !(league == "friendly")
//! abs(handicap) >= 1 ? "away" : "home"
//! exists(home.form) && max(home.form, 0) * 10
//! ```
//!
//! Expressions are parsed once when the factor library is loaded. Evaluation
//! is a pure function of (expression, context).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A runtime value inside an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Flattened, read-only field map a factor is evaluated against
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    fields: HashMap<String, Value>,
}

impl MatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: Value) {
        self.fields.insert(path.into(), value);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.fields.get(path)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found} at token {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{func} expects {expected} argument(s), got {got}")]
    Arity {
        func: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("exists() takes a field path")]
    ExistsNeedsField,

    #[error("empty expression")]
    Empty,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("{op} not defined for {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("non-finite result")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Abs,
    Min,
    Max,
    Exists,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
}

impl FromStr for Expr {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.ternary()?;
        if let Some(tok) = parser.peek() {
            return Err(ExprError::UnexpectedToken {
                found: tok.describe(),
                pos: parser.pos,
            });
        }
        Ok(expr)
    }
}

impl Expr {
    /// Evaluate against a context
    pub fn eval(&self, ctx: &MatchContext) -> Result<Value, EvalError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Field(path) => ctx
                .get(path)
                .cloned()
                .ok_or_else(|| EvalError::MissingField(path.clone())),
            Self::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(ctx)?, "!")?)),
            Self::Neg(inner) => match inner.eval(ctx)? {
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(EvalError::TypeMismatch {
                    op: "-",
                    lhs: other.type_name(),
                    rhs: "none",
                }),
            },
            Self::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, ctx),
            Self::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if truthy(&cond.eval(ctx)?, "?:")? {
                    then.eval(ctx)
                } else {
                    otherwise.eval(ctx)
                }
            }
            Self::Call { func, args } => eval_call(*func, args, ctx),
        }
    }

    /// Evaluate as a predicate. Null counts as false.
    pub fn eval_bool(&self, ctx: &MatchContext) -> Result<bool, EvalError> {
        truthy(&self.eval(ctx)?, "predicate")
    }

    pub fn eval_number(&self, ctx: &MatchContext) -> Result<f64, EvalError> {
        match self.eval(ctx)? {
            Value::Number(n) => Ok(n),
            other => Err(EvalError::TypeMismatch {
                op: "number",
                lhs: other.type_name(),
                rhs: "number",
            }),
        }
    }

    pub fn eval_text(&self, ctx: &MatchContext) -> Result<String, EvalError> {
        match self.eval(ctx)? {
            Value::Text(s) => Ok(s),
            other => Err(EvalError::TypeMismatch {
                op: "text",
                lhs: other.type_name(),
                rhs: "text",
            }),
        }
    }
}

fn truthy(value: &Value, op: &'static str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(EvalError::TypeMismatch {
            op,
            lhs: other.type_name(),
            rhs: "bool",
        }),
    }
}

fn finite(n: f64) -> Result<Value, EvalError> {
    if n.is_finite() {
        Ok(Value::Number(n))
    } else {
        Err(EvalError::NonFinite)
    }
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, ctx: &MatchContext) -> Result<Value, EvalError> {
    // short-circuit before touching the right side
    match op {
        BinaryOp::And => {
            let l = truthy(&lhs.eval(ctx)?, "&&")?;
            return Ok(Value::Bool(l && truthy(&rhs.eval(ctx)?, "&&")?));
        }
        BinaryOp::Or => {
            let l = truthy(&lhs.eval(ctx)?, "||")?;
            return Ok(Value::Bool(l || truthy(&rhs.eval(ctx)?, "||")?));
        }
        _ => {}
    }

    let l = lhs.eval(ctx)?;
    let r = rhs.eval(ctx)?;
    let mismatch = || EvalError::TypeMismatch {
        op: op.symbol(),
        lhs: l.type_name(),
        rhs: r.type_name(),
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(l == r)),
        BinaryOp::Ne => Ok(Value::Bool(l != r)),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            let (Value::Number(a), Value::Number(b)) = (&l, &r) else {
                return Err(mismatch());
            };
            match op {
                BinaryOp::Add => finite(a + b),
                BinaryOp::Sub => finite(a - b),
                BinaryOp::Mul => finite(a * b),
                _ if *b == 0.0 => Err(EvalError::DivisionByZero),
                _ => finite(a / b),
            }
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&l, &r) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(mismatch());
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn eval_call(func: Func, args: &[Expr], ctx: &MatchContext) -> Result<Value, EvalError> {
    if func == Func::Exists {
        return Ok(Value::Bool(match args.first() {
            Some(Expr::Field(path)) => ctx.get(path).is_some_and(|v| *v != Value::Null),
            _ => false,
        }));
    }

    let mut numbers = Vec::with_capacity(args.len());
    for arg in args {
        match arg.eval(ctx)? {
            Value::Number(n) => numbers.push(n),
            other => {
                return Err(EvalError::TypeMismatch {
                    op: "function",
                    lhs: other.type_name(),
                    rhs: "number",
                })
            }
        }
    }

    match func {
        Func::Abs => finite(numbers[0].abs()),
        Func::Min => finite(numbers.iter().copied().fold(f64::INFINITY, f64::min)),
        Func::Max => finite(numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        Func::Exists => unreachable!("handled above"),
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number {n}"),
            Self::Str(s) => format!("string {s:?}"),
            Self::Ident(s) => format!("'{s}'"),
            Self::Op(op) => format!("'{op}'"),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Question => "'?'".to_string(),
            Self::Colon => "':'".to_string(),
        }
    }
}

const OPERATORS: &[&str] = &[
    "||", "&&", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "!",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            '?' => tokens.push(Token::Question),
            ':' => tokens.push(Token::Colon),
            '"' | '\'' => {
                let start = i;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString(start)),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                text.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == c => break,
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            _ if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let n = raw.parse::<f64>().map_err(|_| ExprError::InvalidNumber(raw.clone()))?;
                tokens.push(Token::Number(n));
                continue;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                continue;
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
                    return Err(ExprError::UnexpectedChar { ch: c, pos: i });
                };
                tokens.push(Token::Op(*op));
                i += op.len();
                continue;
            }
        }
        i += 1;
    }

    Ok(tokens)
}

// ============================================================================
// Parser (precedence climbing)
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn unexpected(&self) -> ExprError {
        ExprError::UnexpectedToken {
            found: self
                .peek()
                .map(Token::describe)
                .unwrap_or_else(|| "end of input".to_string()),
            pos: self.pos,
        }
    }

    fn expect(&mut self, want: &Token) -> Result<(), ExprError> {
        if self.peek() == Some(want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.binary(0)?;
        if self.peek() != Some(&Token::Question) {
            return Ok(cond);
        }
        self.pos += 1;
        let then = self.ternary()?;
        self.expect(&Token::Colon)?;
        let otherwise = self.ternary()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    /// Binary levels, loosest first
    fn binary(&mut self, level: usize) -> Result<Expr, ExprError> {
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["==", "!="],
            &["<", "<=", ">", ">="],
            &["+", "-"],
            &["*", "/"],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }

        let mut lhs = self.binary(level + 1)?;
        while let Some(op) = self.eat_op(LEVELS[level]) {
            let rhs = self.binary(level + 1)?;
            let op = match op {
                "||" => BinaryOp::Or,
                "&&" => BinaryOp::And,
                "==" => BinaryOp::Eq,
                "!=" => BinaryOp::Ne,
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                _ => BinaryOp::Div,
            };
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.eat_op(&["!", "-"]) {
            Some("!") => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(_) => Ok(Expr::Neg(Box::new(self.unary()?))),
            None => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let Some(tok) = self.peek().cloned() else {
            return Err(self.unexpected());
        };
        match tok {
            Token::Number(n) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Number(n)))
            }
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Text(s)))
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.ternary()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => return Ok(Expr::Literal(Value::Bool(true))),
                    "false" => return Ok(Expr::Literal(Value::Bool(false))),
                    "null" => return Ok(Expr::Literal(Value::Null)),
                    _ => {}
                }
                if self.peek() == Some(&Token::LParen) {
                    self.call(name)
                } else {
                    Ok(Expr::Field(name))
                }
            }
            _ => Err(self.unexpected()),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr, ExprError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.ternary()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        let func = match name.as_str() {
            "abs" => Func::Abs,
            "min" => Func::Min,
            "max" => Func::Max,
            "exists" => Func::Exists,
            _ => return Err(ExprError::UnknownFunction(name)),
        };
        match func {
            Func::Abs | Func::Exists if args.len() != 1 => {
                return Err(ExprError::Arity {
                    func: if func == Func::Abs { "abs" } else { "exists" },
                    expected: "1",
                    got: args.len(),
                })
            }
            Func::Min | Func::Max if args.is_empty() => {
                return Err(ExprError::Arity {
                    func: if func == Func::Min { "min" } else { "max" },
                    expected: "1+",
                    got: 0,
                })
            }
            Func::Exists if !matches!(args[0], Expr::Field(_)) => return Err(ExprError::ExistsNeedsField),
            _ => {}
        }
        Ok(Expr::Call { func, args })
    }
}
