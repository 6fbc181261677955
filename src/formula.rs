//! Restricted arithmetic formulas over scenario variables.
//!
//! Grammar, loosest binding first. `**` is right-associative and binds
//! tighter than a unary minus on its left, so `-2 ** 2` is `-4`:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := ('+' | '-') unary | power
//! power   := primary ('**' unary)?
//! primary := NUMBER | NAME | FUNC '(' args? ')' | '(' expr ')'
//! ```
//!
//! The AST can hold literals, variable slots, unary and binary operators and
//! calls to a fixed set of functions. Nothing else is representable, so a
//! compiled formula cannot reach anything beyond its bound variables.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::error::{Result, WargameError};

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

/// Whitelisted functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Min,
    Max,
    Sum,
    Len,
}

impl Function {
    fn lookup(name: &str) -> Option<Function> {
        match name {
            "abs" => Some(Function::Abs),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "sum" => Some(Function::Sum),
            "len" => Some(Function::Len),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Min => "min",
            Function::Max => "max",
            Function::Sum => "sum",
            Function::Len => "len",
        }
    }

    fn check_arity(&self, args: usize) -> std::result::Result<(), String> {
        match self {
            Function::Abs if args != 1 => Err(format!("abs() takes 1 argument, got {}", args)),
            Function::Min | Function::Max if args == 0 => {
                Err(format!("{}() needs at least 1 argument", self.name()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    /// Index into the binding slice.
    Var(usize),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

/// Arithmetic fault raised by one evaluation. The Monte Carlo engine counts
/// these as invalid iterations instead of aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NumericFault {
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("zero raised to a negative power")]
    ZeroToNegativePower,
    #[error("result is not a finite number")]
    NonFinite,
}

// ═══════════════════════════════════════════════════════════════════════
// Tokenizer
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Number(f64),
    Name(String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    End,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: usize,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let pos = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let (value, next) = scan_number(&chars, i)?;
            tokens.push(Token {
                tok: Tok::Number(value),
                pos,
            });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            if KEYWORDS.contains(&name.as_str()) {
                return Err(WargameError::evaluation(
                    pos,
                    format!("keyword '{}' is not allowed", name),
                ));
            }
            tokens.push(Token {
                tok: Tok::Name(name),
                pos,
            });
            continue;
        }

        let tok = match c {
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' if chars.get(i + 1) == Some(&'*') => {
                i += 1;
                Tok::DoubleStar
            }
            '*' => Tok::Star,
            '/' if chars.get(i + 1) == Some(&'/') => {
                return Err(WargameError::evaluation(pos, "floor division '//' is not supported"))
            }
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            ',' => Tok::Comma,
            '.' => {
                return Err(WargameError::evaluation(pos, "attribute access is not allowed"))
            }
            '[' | ']' => {
                return Err(WargameError::evaluation(pos, "subscripts are not allowed"))
            }
            '\'' | '"' => {
                return Err(WargameError::evaluation(pos, "string literals are not allowed"))
            }
            '=' | '<' | '>' | '!' => {
                return Err(WargameError::evaluation(
                    pos,
                    "comparisons and assignments are not allowed",
                ))
            }
            other => {
                return Err(WargameError::evaluation(
                    pos,
                    format!("unexpected character '{}'", other),
                ))
            }
        };
        tokens.push(Token { tok, pos });
        i += 1;
    }

    tokens.push(Token {
        tok: Tok::End,
        pos: chars.len(),
    });
    Ok(tokens)
}

/// Scan a numeric literal: digits with optional underscores, an optional
/// fraction and an optional exponent.
fn scan_number(chars: &[char], start: usize) -> Result<(f64, usize)> {
    let mut i = start;
    let mut text = String::new();

    fn digits(chars: &[char], i: &mut usize, text: &mut String) {
        while *i < chars.len() && (chars[*i].is_ascii_digit() || chars[*i] == '_') {
            if chars[*i] != '_' {
                text.push(chars[*i]);
            }
            *i += 1;
        }
    }

    digits(chars, &mut i, &mut text);
    if i < chars.len() && chars[i] == '.' {
        text.push('.');
        i += 1;
        digits(chars, &mut i, &mut text);
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        let mut exp = String::from("e");
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            exp.push(chars[j]);
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            i = j;
            text.push_str(&exp);
            digits(chars, &mut i, &mut text);
        }
    }
    if i < chars.len() && (chars[i].is_alphabetic() || chars[i] == '_' || chars[i] == '.') {
        return Err(WargameError::evaluation(i, "malformed numeric literal"));
    }

    text.parse::<f64>()
        .map(|v| (v, i))
        .map_err(|_| WargameError::evaluation(start, format!("invalid number '{}'", text)))
}

// ═══════════════════════════════════════════════════════════════════════
// Parser
// ═══════════════════════════════════════════════════════════════════════

/// Bound on AST depth, so parsing and evaluation stay well inside the
/// stack of a worker thread.
const MAX_DEPTH: usize = 256;

struct Parser<'a> {
    tokens: Vec<Token>,
    idx: usize,
    depth: usize,
    slots: &'a BTreeMap<&'a str, usize>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.idx].tok
    }

    fn pos(&self) -> usize {
        self.tokens[self.idx].pos
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens[self.idx].tok.clone();
        if self.idx + 1 < self.tokens.len() {
            self.idx += 1;
        }
        tok
    }

    fn expect(&mut self, want: Tok, what: &str) -> Result<()> {
        if *self.peek() == want {
            self.advance();
            Ok(())
        } else {
            Err(WargameError::evaluation(
                self.pos(),
                format!("expected {}, found {}", what, describe(self.peek())),
            ))
        }
    }

    /// One more level of AST depth. Every recursive path runs through
    /// `parse_unary`, and every chained operator deepens the left spine.
    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(WargameError::evaluation(
                self.pos(),
                format!("formula nests too deeply (limit {})", MAX_DEPTH),
            ));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let entered = self.depth;
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.descend()?;
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = entered;
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let entered = self.depth;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            self.descend()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = entered;
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.descend()?;
        let op = match self.peek() {
            Tok::Plus => Some(UnaryOp::Plus),
            Tok::Minus => Some(UnaryOp::Neg),
            _ => None,
        };
        let expr = match op {
            Some(op) => {
                self.advance();
                Expr::Unary(op, Box::new(self.parse_unary()?))
            }
            None => self.parse_power()?,
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if *self.peek() == Tok::DoubleStar {
            self.advance();
            // Right-associative; the exponent may carry its own sign.
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let pos = self.pos();
        match self.advance() {
            Tok::Number(v) => Ok(Expr::Literal(v)),
            Tok::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::Name(name) => {
                if *self.peek() == Tok::LParen {
                    self.parse_call(&name, pos)
                } else if let Some(&slot) = self.slots.get(name.as_str()) {
                    Ok(Expr::Var(slot))
                } else {
                    Err(WargameError::evaluation(
                        pos,
                        format!("unknown variable '{}'", name),
                    ))
                }
            }
            other => Err(WargameError::evaluation(
                pos,
                format!("unexpected {}", describe(&other)),
            )),
        }
    }

    fn parse_call(&mut self, name: &str, pos: usize) -> Result<Expr> {
        let func = Function::lookup(name).ok_or_else(|| {
            WargameError::evaluation(pos, format!("call to '{}' is not allowed", name))
        })?;
        self.expect(Tok::LParen, "'('")?;

        let mut args = Vec::new();
        if *self.peek() != Tok::RParen {
            loop {
                args.push(self.parse_expr()?);
                if *self.peek() == Tok::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(Tok::RParen, "')' or ','")?;

        func.check_arity(args.len())
            .map_err(|msg| WargameError::evaluation(pos, msg))?;
        Ok(Expr::Call(func, args))
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Number(v) => format!("number {}", v),
        Tok::Name(n) => format!("name '{}'", n),
        Tok::Plus => "'+'".into(),
        Tok::Minus => "'-'".into(),
        Tok::Star => "'*'".into(),
        Tok::DoubleStar => "'**'".into(),
        Tok::Slash => "'/'".into(),
        Tok::Percent => "'%'".into(),
        Tok::LParen => "'('".into(),
        Tok::RParen => "')'".into(),
        Tok::Comma => "','".into(),
        Tok::End => "end of formula".into(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Compiled formula
// ═══════════════════════════════════════════════════════════════════════

/// A formula validated against a fixed variable list.
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    variables: Vec<String>,
    root: Expr,
}

impl Formula {
    /// Parse `source` and resolve every name against `variables`. Slot `i`
    /// of the binding slice passed to [`Formula::evaluate`] is `variables[i]`.
    pub fn compile<S: AsRef<str>>(source: &str, variables: &[S]) -> Result<Formula> {
        if source.trim().is_empty() {
            return Err(WargameError::evaluation(0, "formula is empty"));
        }

        let names: Vec<String> = variables.iter().map(|v| v.as_ref().to_string()).collect();
        let slots: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let mut parser = Parser {
            tokens: tokenize(source)?,
            idx: 0,
            depth: 0,
            slots: &slots,
        };
        let root = parser.parse_expr()?;
        if *parser.peek() != Tok::End {
            return Err(WargameError::evaluation(
                parser.pos(),
                format!("unexpected {}", describe(parser.peek())),
            ));
        }

        Ok(Formula {
            source: source.to_string(),
            variables: names,
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn ast(&self) -> &Expr {
        &self.root
    }

    /// Names the formula actually references.
    pub fn referenced_variables(&self) -> BTreeSet<&str> {
        fn walk(e: &Expr, out: &mut BTreeSet<usize>) {
            match e {
                Expr::Literal(_) => {}
                Expr::Var(slot) => {
                    out.insert(*slot);
                }
                Expr::Unary(_, inner) => walk(inner, out),
                Expr::Binary(_, l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
                Expr::Call(_, args) => args.iter().for_each(|a| walk(a, out)),
            }
        }
        let mut slots = BTreeSet::new();
        walk(&self.root, &mut slots);
        slots
            .into_iter()
            .map(|s| self.variables[s].as_str())
            .collect()
    }

    /// Turn a name → value map into the slot vector `evaluate` expects.
    pub fn bind(&self, bindings: &BTreeMap<String, f64>) -> Result<Vec<f64>> {
        self.variables
            .iter()
            .map(|name| {
                bindings.get(name).copied().ok_or_else(|| {
                    WargameError::validation(format!("no value bound for variable '{}'", name))
                })
            })
            .collect()
    }

    /// Evaluate against one binding. `slots` must have one value per
    /// compiled variable.
    pub fn evaluate(&self, slots: &[f64]) -> std::result::Result<f64, NumericFault> {
        let v = eval(&self.root, slots)?;
        if v.is_finite() {
            Ok(v)
        } else {
            Err(NumericFault::NonFinite)
        }
    }
}

fn eval(expr: &Expr, slots: &[f64]) -> std::result::Result<f64, NumericFault> {
    match expr {
        Expr::Literal(v) => Ok(*v),
        Expr::Var(slot) => Ok(slots[*slot]),
        Expr::Unary(op, inner) => {
            let v = eval(inner, slots)?;
            Ok(match op {
                UnaryOp::Plus => v,
                UnaryOp::Neg => -v,
            })
        }
        Expr::Binary(op, l, r) => {
            let a = eval(l, slots)?;
            let b = eval(r, slots)?;
            match op {
                BinaryOp::Add => Ok(a + b),
                BinaryOp::Sub => Ok(a - b),
                BinaryOp::Mul => Ok(a * b),
                BinaryOp::Div => {
                    if b == 0.0 {
                        Err(NumericFault::DivisionByZero)
                    } else {
                        Ok(a / b)
                    }
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        return Err(NumericFault::ModuloByZero);
                    }
                    // Floored modulo: result takes the sign of the divisor.
                    let mut m = a % b;
                    if m != 0.0 && (m < 0.0) != (b < 0.0) {
                        m += b;
                    }
                    Ok(m)
                }
                BinaryOp::Pow => {
                    if a == 0.0 && b < 0.0 {
                        Err(NumericFault::ZeroToNegativePower)
                    } else {
                        Ok(a.powf(b))
                    }
                }
            }
        }
        Expr::Call(func, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, slots))
                .collect::<std::result::Result<Vec<f64>, _>>()?;
            Ok(match func {
                Function::Abs => values[0].abs(),
                Function::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                Function::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                Function::Sum => values.iter().sum(),
                Function::Len => values.len() as f64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_src(src: &str) -> f64 {
        Formula::compile::<&str>(src, &[]).unwrap().evaluate(&[]).unwrap()
    }

    #[test]
    fn power_binds_tighter_than_unary_minus() {
        assert_eq!(eval_src("-2**2"), -4.0);
        assert_eq!(eval_src("2**-1"), 0.5);
        assert_eq!(eval_src("2**3**2"), 512.0);
    }

    #[test]
    fn modulo_follows_divisor_sign() {
        assert_eq!(eval_src("-7 % 3"), 2.0);
        assert_eq!(eval_src("7 % -3"), -2.0);
        assert_eq!(eval_src("7.5 % 2"), 1.5);
    }

    #[test]
    fn number_literals() {
        assert_eq!(eval_src("1_000 + .5"), 1000.5);
        assert_eq!(eval_src("2.5e2"), 250.0);
        assert_eq!(eval_src("1E-1"), 0.1);
    }
}
