//! Expression language for [`MemoryTable`].
//!
//! A program is a sequence of statements, `name = expr` or `expr`, separated by `;`
//! or newlines. Expressions cover integer, float, string and `[a, b]` array literals,
//! `+ - * /` applied element-wise with scalar broadcast, calls with keyword
//! arguments, `x[i]` / `x[a:b:s]` indexing, and `remote("name")`, which reads a
//! variable from the peer.
//!
//! Remote reads happen before evaluation starts: [`fetch_remotes`] issues one nested
//! GetVar per distinct name, and the [`Interpreter`] then runs synchronously.

use std::collections::HashMap;

use varbridge::bridge::types::Scalar;
use varbridge::{
    Action, ArrayData, CallArgs, ElementType, EvalError, Handle, Index, Message, Name,
    NumericArray, Opaque, Peer, RangeSpec, Reply, StringArray, SymbolTable, Value,
};

use crate::table::{Function, MemoryTable};

/// Name of the builtin that reads a variable from the peer.
pub const REMOTE: &str = "remote";

/// Type name of values standing for a result held on the peer.
pub const REMOTE_REFERENCE: &str = "remote reference";

/// A value the peer could not send, held on its side under `handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRef(pub Handle);

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Sym(char),
    /// `;` or newline
    Sep,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Int(v) => v.to_string(),
            Token::Float(v) => v.to_string(),
            Token::Str(s) => format!("{s:?}"),
            Token::Ident(s) => s.clone(),
            Token::Sym(c) => format!("'{c}'"),
            Token::Sep => "end of statement".to_string(),
        }
    }
}

fn syntax(message: impl Into<String>) -> EvalError {
    EvalError::Syntax(message.into())
}

fn lex(src: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '\n' | ';' => {
                tokens.push(Token::Sep);
                i += 1;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '0'..='9' | '.' if c != '.' || chars.get(i + 1).is_some_and(char::is_ascii_digit) => {
                let (token, next) = lex_number(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            '"' | '\'' => {
                let (text, next) = lex_string(&chars, i)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '(' | ')' | '[' | ']' | ',' | '=' | ':' => {
                tokens.push(Token::Sym(c));
                i += 1;
            }
            other => return Err(syntax(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(Token, usize), EvalError> {
    let digits = |mut i: usize| {
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut i = digits(start);
    let mut float = false;
    if chars.get(i) == Some(&'.') {
        float = true;
        i = digits(i + 1);
    }
    if matches!(chars.get(i), Some('e' | 'E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+' | '-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(char::is_ascii_digit) {
            float = true;
            i = digits(j);
        }
    }

    let text: String = chars[start..i].iter().collect();
    let token = if float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| syntax(format!("bad number '{text}'")))?
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| syntax(format!("integer literal out of range: {text}")))?
    };
    Ok((token, i))
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), EvalError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| syntax("unterminated string"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => *other,
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(syntax("unterminated string"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn symbol(self) -> char {
        match self {
            BinOp::Add => '+',
            BinOp::Sub => '-',
            BinOp::Mul => '*',
            BinOp::Div => '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Expr>),
    Name(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Arg>),
    Index(Box<Expr>, Vec<Subscript>),
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Positional(Expr),
    Named(String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Subscript {
    At(Expr),
    Slice {
        start: Option<Expr>,
        stop: Option<Expr>,
        step: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Assign(String, Expr),
    Expr(Expr),
}

/// A parsed statement sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    statements: Vec<Stmt>,
}

impl Program {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Distinct names read with `remote("...")`, in order of appearance.
    pub fn remote_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for stmt in &self.statements {
            match stmt {
                Stmt::Assign(_, expr) | Stmt::Expr(expr) => expr.collect_remotes(&mut names),
            }
        }
        names
    }
}

impl Expr {
    fn collect_remotes(&self, out: &mut Vec<String>) {
        match self {
            Expr::Call(name, args) => {
                if name == REMOTE
                    && let [Arg::Positional(Expr::Str(target))] = args.as_slice()
                {
                    if !out.contains(target) {
                        out.push(target.clone());
                    }
                    return;
                }
                for arg in args {
                    match arg {
                        Arg::Positional(e) | Arg::Named(_, e) => e.collect_remotes(out),
                    }
                }
            }
            Expr::Array(items) => items.iter().for_each(|e| e.collect_remotes(out)),
            Expr::Neg(e) => e.collect_remotes(out),
            Expr::Binary(_, l, r) => {
                l.collect_remotes(out);
                r.collect_remotes(out);
            }
            Expr::Index(base, subs) => {
                base.collect_remotes(out);
                for sub in subs {
                    match sub {
                        Subscript::At(e) => e.collect_remotes(out),
                        Subscript::Slice { start, stop, step } => {
                            for e in [start, stop, step].into_iter().flatten() {
                                e.collect_remotes(out);
                            }
                        }
                    }
                }
            }
            Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Name(_) => {}
        }
    }
}

pub fn parse(text: &str) -> Result<Program, EvalError> {
    let mut parser = Parser {
        tokens: lex(text)?,
        pos: 0,
    };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn at(&self, c: char) -> bool {
        self.peek() == Some(&Token::Sym(c))
    }

    fn eat(&mut self, c: char) -> bool {
        let hit = self.at(c);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect(&mut self, c: char) -> Result<(), EvalError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{c}'")))
        }
    }

    fn unexpected(&self, wanted: &str) -> EvalError {
        match self.peek() {
            Some(token) => syntax(format!("expected {wanted}, found {}", token.describe())),
            None => syntax(format!("expected {wanted}, found end of input")),
        }
    }

    fn program(&mut self) -> Result<Program, EvalError> {
        let mut statements = Vec::new();
        loop {
            while self.peek() == Some(&Token::Sep) {
                self.pos += 1;
            }
            if self.peek().is_none() {
                break;
            }
            statements.push(self.statement()?);
            if !matches!(self.peek(), None | Some(Token::Sep)) {
                return Err(self.unexpected("end of statement"));
            }
        }
        Ok(Program { statements })
    }

    fn statement(&mut self) -> Result<Stmt, EvalError> {
        if let (Some(Token::Ident(name)), Some(Token::Sym('='))) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            self.pos += 2;
            return Ok(Stmt::Assign(name, self.expr()?));
        }
        Ok(Stmt::Expr(self.expr()?))
    }

    fn expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat('+') {
                BinOp::Add
            } else if self.eat('-') {
                BinOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat('*') {
                BinOp::Mul
            } else if self.eat('/') {
                BinOp::Div
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat('-') {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat('+') {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        while self.eat('[') {
            let mut subs = vec![self.subscript()?];
            while self.eat(',') {
                subs.push(self.subscript()?);
            }
            self.expect(']')?;
            expr = Expr::Index(Box::new(expr), subs);
        }
        Ok(expr)
    }

    fn bound(&mut self) -> Result<Option<Expr>, EvalError> {
        if self.at(':') || self.at(',') || self.at(']') {
            Ok(None)
        } else {
            self.expr().map(Some)
        }
    }

    fn subscript(&mut self) -> Result<Subscript, EvalError> {
        let start = self.bound()?;
        if !self.eat(':') {
            return start
                .map(Subscript::At)
                .ok_or_else(|| self.unexpected("an index"));
        }
        let stop = self.bound()?;
        let step = if self.eat(':') { self.bound()? } else { None };
        Ok(Subscript::Slice { start, stop, step })
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let token = self.peek().cloned().ok_or_else(|| self.unexpected("a value"))?;
        match token {
            Token::Int(v) => {
                self.pos += 1;
                Ok(Expr::Int(v))
            }
            Token::Float(v) => {
                self.pos += 1;
                Ok(Expr::Float(v))
            }
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Str(s))
            }
            Token::Sym('(') => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(')')?;
                Ok(inner)
            }
            Token::Sym('[') => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.eat(']') {
                    loop {
                        items.push(self.expr()?);
                        if self.eat(']') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Ident(name) => {
                self.pos += 1;
                if self.eat('(') {
                    Ok(Expr::Call(name, self.args()?))
                } else {
                    Ok(Expr::Name(name))
                }
            }
            _ => Err(self.unexpected("a value")),
        }
    }

    fn args(&mut self) -> Result<Vec<Arg>, EvalError> {
        let mut args = Vec::new();
        if self.eat(')') {
            return Ok(args);
        }
        loop {
            if let (Some(Token::Ident(key)), Some(Token::Sym('='))) = (self.peek(), self.peek_at(1)) {
                let key = key.clone();
                self.pos += 2;
                args.push(Arg::Named(key, self.expr()?));
            } else {
                args.push(Arg::Positional(self.expr()?));
            }
            if self.eat(')') {
                return Ok(args);
            }
            self.expect(',')?;
        }
    }
}

/// Read every `remote("name")` of `program` from the peer.
///
/// A value the peer cannot send is claimed straight away with an empty-name GetVar
/// and comes back as a [`RemoteRef`].
pub async fn fetch_remotes(
    program: &Program,
    table: &mut dyn SymbolTable,
    peer: &mut Peer<'_>,
) -> Result<HashMap<String, Value>, EvalError> {
    let mut fetched = HashMap::new();
    for name in program.remote_names() {
        let reply = peer
            .request(Action::GetVar(Name::literal(name.clone())), table)
            .await
            .map_err(|e| EvalError::Remote(e.to_string()))?;
        let reply = match reply {
            Reply::Unencodable => {
                tracing::debug!(%name, "Claiming remote result by reference");
                peer.request(Action::GetVar(Name::literal("")), table)
                    .await
                    .map_err(|e| EvalError::Remote(e.to_string()))?
            }
            other => other,
        };
        let value = match reply {
            Reply::Value(message) => remote_value(message)?,
            Reply::Empty => Value::Nil,
            Reply::Failed(reason) => return Err(EvalError::Remote(reason)),
            Reply::Unencodable => {
                return Err(EvalError::Remote(format!("{name} has no wire form")));
            }
        };
        fetched.insert(name, value);
    }
    Ok(fetched)
}

pub(crate) fn remote_value(message: Message) -> Result<Value, EvalError> {
    Value::from_message(message, &mut |handle| {
        Ok(Value::Opaque(Opaque::new(REMOTE_REFERENCE, RemoteRef(handle))))
    })
    .map_err(|e| EvalError::Remote(e.to_string()))
}

/// Runs a parsed program against a table.
pub struct Interpreter<'a> {
    table: &'a mut MemoryTable,
    remotes: &'a HashMap<String, Value>,
}

impl<'a> Interpreter<'a> {
    pub fn new(table: &'a mut MemoryTable, remotes: &'a HashMap<String, Value>) -> Self {
        Self { table, remotes }
    }

    /// Run every statement and return the value of the last one.
    ///
    /// Assignments yield nil. A statement that is only the name of a function calls
    /// it with no arguments.
    pub fn run(&mut self, program: &Program) -> Result<Value, EvalError> {
        let mut last = Value::Nil;
        for stmt in &program.statements {
            last = match stmt {
                Stmt::Assign(name, expr) => {
                    let value = self.eval(expr)?;
                    self.table.set(name, value)?;
                    Value::Nil
                }
                Stmt::Expr(Expr::Name(name)) if self.is_function(name) => self
                    .call(name, CallArgs::default())?
                    .unwrap_or(Value::Nil),
                Stmt::Expr(expr) => self.eval(expr)?,
            };
        }
        Ok(last)
    }

    fn is_function(&self, name: &str) -> bool {
        self.table
            .lookup(name)
            .and_then(Function::from_value)
            .is_some()
    }

    fn call(&mut self, name: &str, args: CallArgs) -> Result<Option<Value>, EvalError> {
        let callee = self.table.get(name)?;
        self.table.invoke(&callee, name, &args)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Int(v) => Ok(Value::int(*v)),
            Expr::Float(v) => Ok(Value::float(*v)),
            Expr::Str(s) => Ok(Value::string(s.clone())),
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(array_literal(values))
            }
            Expr::Name(name) => self.table.get(name),
            Expr::Neg(inner) => {
                let value = self.eval(inner)?;
                match value {
                    Value::Array(_) => binary(BinOp::Mul, value, Value::int(-1)),
                    other => Err(EvalError::type_mismatch(format!(
                        "cannot negate a {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, left, right)
            }
            Expr::Call(name, args) if name == REMOTE => self.remote(args),
            Expr::Call(name, args) => {
                let args = self.call_args(args)?;
                Ok(self.call(name, args)?.unwrap_or(Value::Nil))
            }
            Expr::Index(base, subs) => {
                let value = self.eval(base)?;
                let index = subs
                    .iter()
                    .map(|s| self.subscript(s))
                    .collect::<Result<Vec<_>, _>>()?;
                value.get_index(&index)
            }
        }
    }

    fn remote(&self, args: &[Arg]) -> Result<Value, EvalError> {
        let [Arg::Positional(Expr::Str(name))] = args else {
            return Err(EvalError::type_mismatch(
                "remote() takes one string literal naming a peer variable",
            ));
        };
        self.remotes
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::Remote(format!("{name} was not fetched from the peer")))
    }

    fn call_args(&mut self, args: &[Arg]) -> Result<CallArgs, EvalError> {
        let mut out = CallArgs::default();
        for arg in args {
            match arg {
                Arg::Positional(e) => out.positional.push(self.eval(e)?),
                Arg::Named(key, e) => {
                    let value = self.eval(e)?;
                    out.named.push((key.clone(), value));
                }
            }
        }
        Ok(out)
    }

    fn bound(&mut self, expr: Option<&Expr>) -> Result<Option<i64>, EvalError> {
        let Some(expr) = expr else {
            return Ok(None);
        };
        let value = self.eval(expr)?;
        value.as_i64().map(Some).ok_or_else(|| {
            EvalError::type_mismatch(format!("slice bound must be an integer, got {}", value.type_name()))
        })
    }

    fn subscript(&mut self, sub: &Subscript) -> Result<Index, EvalError> {
        match sub {
            Subscript::At(expr) => {
                let value = self.eval(expr)?;
                Index::from_value(&value)
            }
            Subscript::Slice { start, stop, step } => {
                let step = self.bound(step.as_ref())?;
                if step == Some(0) {
                    return Err(EvalError::failed("slice step cannot be zero"));
                }
                let backwards = step.is_some_and(|s| s < 0);
                let start = self
                    .bound(start.as_ref())?
                    .unwrap_or(if backwards { -1 } else { 0 });
                let stop = self
                    .bound(stop.as_ref())?
                    .unwrap_or(if backwards { i64::MIN } else { i64::MAX });
                let range = RangeSpec::slice(start, stop);
                Ok(Index::Range(match step {
                    Some(step) => range.with_step(step),
                    None => range,
                }))
            }
        }
    }
}

/// `[a, b, c]`: numeric scalars become an array, scalar strings a string array, and
/// anything else a list.
fn array_literal(values: Vec<Value>) -> Value {
    if values.is_empty() {
        return Value::List(values);
    }

    let numbers: Option<Vec<Scalar>> = values
        .iter()
        .map(|v| match v {
            Value::Array(a) if a.is_scalar() => a.get(0),
            _ => None,
        })
        .collect();
    if let Some(numbers) = numbers {
        if numbers.iter().all(|s| matches!(s, Scalar::Int(_))) {
            return Value::ints(numbers.iter().map(|s| s.as_i64()).collect());
        }
        return Value::floats(numbers.iter().map(|s| s.as_f64()).collect());
    }

    let strings: Option<Vec<&str>> = values.iter().map(Value::as_str).collect();
    if let Some(strings) = strings {
        return Value::Strings(StringArray::from_strings(strings));
    }
    Value::List(values)
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, EvalError> {
    match (&left, &right) {
        (Value::Array(l), Value::Array(r)) => numeric(op, l, r),
        (Value::Strings(l), Value::Strings(r)) if op == BinOp::Add => {
            match (l.as_scalar(), r.as_scalar()) {
                (Some(a), Some(b)) => Ok(Value::string(format!("{a}{b}"))),
                _ => Err(EvalError::type_mismatch("'+' joins single strings only")),
            }
        }
        _ => Err(EvalError::type_mismatch(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

/// Result extents for an element-wise operation; a one-element side broadcasts.
fn broadcast(l: &NumericArray, r: &NumericArray) -> Result<Vec<usize>, EvalError> {
    if l.dims() == r.dims() {
        return Ok(l.dims().to_vec());
    }
    match (l.len(), r.len()) {
        (1, 1) if r.rank() > l.rank() => Ok(r.dims().to_vec()),
        (_, 1) => Ok(l.dims().to_vec()),
        (1, _) => Ok(r.dims().to_vec()),
        _ => Err(EvalError::type_mismatch(format!(
            "extents {:?} and {:?} do not match",
            l.dims(),
            r.dims()
        ))),
    }
}

fn numeric(op: BinOp, l: &NumericArray, r: &NumericArray) -> Result<Value, EvalError> {
    let dims = broadcast(l, r)?;
    let count = l.len().max(r.len());
    let pick = |a: &NumericArray, i: usize| {
        a.get(if a.len() == 1 { 0 } else { i })
            .ok_or_else(|| EvalError::IndexOutOfRange(i.to_string()))
    };

    let (elem, data) = if l.elem().is_float() || r.elem().is_float() {
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(float_op(op, pick(l, i)?.as_f64(), pick(r, i)?.as_f64())?);
        }
        (ElementType::F64, ArrayData::F64(out))
    } else {
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(int_op(op, pick(l, i)?.as_i64(), pick(r, i)?.as_i64())?);
        }
        (ElementType::I64, ArrayData::I64(out))
    };
    NumericArray::new(elem, dims, data)
        .map(Value::Array)
        .map_err(|e| EvalError::failed(e.to_string()))
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<i64, EvalError> {
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div if b == 0 => return Err(EvalError::failed("division by zero")),
        BinOp::Div => a.checked_div(b),
    };
    result.ok_or_else(|| EvalError::failed(format!("integer overflow in {a} {} {b}", op.symbol())))
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<f64, EvalError> {
    Ok(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div if b == 0.0 => return Err(EvalError::failed("division by zero")),
        BinOp::Div => a / b,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(table: &mut MemoryTable, text: &str) -> Result<Value, EvalError> {
        let program = parse(text)?;
        let remotes = HashMap::new();
        Interpreter::new(table, &remotes).run(&program)
    }

    fn eval(text: &str) -> Result<Value, EvalError> {
        run(&mut MemoryTable::with_prelude(), text)
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        assert_eq!(eval("1+1").unwrap(), Value::int(2));
        assert_eq!(eval("2 + 3 * 4").unwrap(), Value::int(14));
        assert_eq!(eval("(2 + 3) * 4").unwrap(), Value::int(20));
        assert_eq!(eval("7 / 2").unwrap(), Value::int(3));
        assert_eq!(eval("-3 - -1").unwrap(), Value::int(-2));
    }

    #[test]
    fn floats_widen_the_result() {
        assert_eq!(eval("1 + 0.5").unwrap(), Value::float(1.5));
        assert_eq!(eval("7 / 2.0").unwrap(), Value::float(3.5));
        assert_eq!(eval("1e3").unwrap(), Value::float(1000.0));
        assert_eq!(eval(".25 * 4").unwrap(), Value::float(1.0));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(
            eval("1 / 0").unwrap_err(),
            EvalError::failed("division by zero")
        );
        assert!(eval("1.0 / 0").is_err());
    }

    #[test]
    fn overflow_is_an_error() {
        assert!(eval("9223372036854775807 + 1").is_err());
        assert!(eval("99999999999999999999").is_err());
    }

    #[test]
    fn element_wise_with_broadcast() {
        assert_eq!(eval("[1, 2, 3] * 2").unwrap(), Value::ints(vec![2, 4, 6]));
        assert_eq!(eval("10 - [1, 2]").unwrap(), Value::ints(vec![9, 8]));
        assert_eq!(
            eval("[1, 2] + [0.5, 0.5]").unwrap(),
            Value::floats(vec![1.5, 2.5])
        );
        assert_eq!(eval("-[1, 2]").unwrap(), Value::ints(vec![-1, -2]));
        assert!(eval("[1, 2] + [1, 2, 3]").is_err());
    }

    #[test]
    fn array_literals() {
        assert_eq!(eval("[1, 2.5]").unwrap(), Value::floats(vec![1.0, 2.5]));
        assert_eq!(
            eval("['a', \"b\"]").unwrap(),
            Value::Strings(StringArray::from_strings(["a", "b"]))
        );
        assert_eq!(eval("[]").unwrap(), Value::List(vec![]));
        assert_eq!(
            eval("[1, 'a']").unwrap(),
            Value::List(vec![Value::int(1), Value::string("a")])
        );
    }

    #[test]
    fn strings_concatenate() {
        assert_eq!(eval("'ab' + \"c\\n\"").unwrap(), Value::string("abc\n"));
        assert!(eval("'a' - 'b'").is_err());
        assert!(eval("'a' + 1").is_err());
    }

    #[test]
    fn statements_assign_and_return_the_last_value() {
        let mut table = MemoryTable::with_prelude();
        assert_eq!(run(&mut table, "a = 2; b = a * 5\nb + 1").unwrap(), Value::int(11));
        assert_eq!(table.get("b").unwrap(), Value::int(10));
        assert_eq!(run(&mut table, "c = 1").unwrap(), Value::Nil);
        assert_eq!(run(&mut table, "\n;  # nothing\n").unwrap(), Value::Nil);
    }

    #[test]
    fn calls_take_keyword_arguments() {
        assert_eq!(eval("sum(1, 2, k=3)").unwrap(), Value::int(6));
        assert_eq!(eval("len([4, 5, 6]) + sum()").unwrap(), Value::int(3));
        assert!(matches!(
            eval("nope(1)").unwrap_err(),
            EvalError::NotFound(name) if name == "nope"
        ));
    }

    #[test]
    fn bare_function_name_calls_it() {
        let mut table = MemoryTable::with_prelude();
        table.define_fn("answer", |_| Ok(Some(Value::int(42))));
        assert_eq!(run(&mut table, "answer").unwrap(), Value::int(42));
        assert!(run(&mut table, "answer + 1").is_err());
    }

    #[test]
    fn indexing_and_slicing() {
        let mut table = MemoryTable::with_prelude();
        run(&mut table, "a = [10, 20, 30, 40, 50]").unwrap();
        assert_eq!(run(&mut table, "a[1]").unwrap(), Value::int(20));
        assert_eq!(run(&mut table, "a[-1]").unwrap(), Value::int(50));
        assert_eq!(run(&mut table, "a[1:3]").unwrap(), Value::ints(vec![20, 30]));
        assert_eq!(run(&mut table, "a[:2]").unwrap(), Value::ints(vec![10, 20]));
        assert_eq!(run(&mut table, "a[3:]").unwrap(), Value::ints(vec![40, 50]));
        assert_eq!(run(&mut table, "a[::2]").unwrap(), Value::ints(vec![10, 30, 50]));
        assert_eq!(run(&mut table, "a[::-2]").unwrap(), Value::ints(vec![50, 30, 10]));
        assert!(run(&mut table, "a[1:2:0]").is_err());
        assert!(run(&mut table, "a[9]").is_err());
    }

    #[test]
    fn syntax_errors() {
        for text in ["1 +", "(1", "a = ", "[1, 2", "f(1,", "'open", "1 $ 2", "a[]", "1 2"] {
            assert!(
                matches!(eval(text), Err(EvalError::Syntax(_))),
                "{text} should not parse"
            );
        }
    }

    #[test]
    fn remote_names_are_collected_once() {
        let program = parse("x = remote('a') + remote(\"b\"); sum(remote('a'), [remote('c')])").unwrap();
        assert_eq!(program.remote_names(), ["a", "b", "c"]);
        assert!(parse("1").unwrap().remote_names().is_empty());
    }

    #[test]
    fn remote_without_fetch_fails() {
        assert!(matches!(eval("remote('x')"), Err(EvalError::Remote(_))));
        assert!(matches!(eval("remote(1)"), Err(EvalError::Type(_))));
    }
}
