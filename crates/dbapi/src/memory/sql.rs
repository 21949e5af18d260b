//! Tokenizer and parser for the T-SQL subset the memory server executes

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::types::{ColumnType, Value};

/// Parse failure; reported by the server as error 102
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyntaxError(pub(crate) String);

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type PResult<T> = std::result::Result<T, SyntaxError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(String),
    Str(String),
    Hex(Vec<u8>),
    /// `?` (next positional) or `@pN` (1-based)
    Param(Option<usize>),
    Sym(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => f.write_str(w),
            Token::Number(n) => f.write_str(n),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Hex(_) => f.write_str("0x"),
            Token::Param(None) => f.write_str("?"),
            Token::Param(Some(n)) => write!(f, "@p{n}"),
            Token::Sym(s) => f.write_str(s),
        }
    }
}

const SYMBOLS: [&str; 15] = [
    "<>", "!=", "<=", ">=", "=", "<", ">", "(", ")", ",", ";", "*", ".", "-", "+",
];

const RESERVED: [&str; 16] = [
    "FROM", "WHERE", "AND", "OR", "FOR", "VALUES", "SET", "SELECT", "INSERT", "UPDATE", "DELETE",
    "INTO", "IS", "NOT", "ORDER", "GROUP",
];

fn tokenize(sql: &str) -> PResult<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && next == Some('*') {
            let rest: String = chars[i + 2..].iter().collect();
            let end = rest
                .find("*/")
                .ok_or_else(|| SyntaxError("Missing end comment mark '*/'.".into()))?;
            i += 2 + rest[..end].chars().count() + 2;
        } else if (c == 'N' || c == 'n') && next == Some('\'') {
            i += 1;
        } else if c == '\'' {
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => {
                        return Err(SyntaxError(format!(
                            "Unclosed quotation mark after the character string '{s}'."
                        )))
                    }
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        s.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            out.push(Token::Str(s));
        } else if c == '0' && matches!(next, Some('x' | 'X')) {
            i += 2;
            let start = i;
            while i < chars.len() && chars[i].is_ascii_hexdigit() {
                i += 1;
            }
            let mut digits: String = chars[start..i].iter().collect();
            if digits.len() % 2 == 1 {
                digits.insert(0, '0');
            }
            let bytes = (0..digits.len())
                .step_by(2)
                .map(|k| u8::from_str_radix(&digits[k..k + 2], 16))
                .collect::<std::result::Result<Vec<u8>, _>>()
                .map_err(|_| SyntaxError(format!("Incorrect syntax near '0x{digits}'.")))?;
            out.push(Token::Hex(bytes));
        } else if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            out.push(Token::Number(chars[start..i].iter().collect()));
        } else if c == '[' || c == '"' {
            let close = if c == '[' { ']' } else { '"' };
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|ch| *ch == close)
                .ok_or_else(|| SyntaxError("Unclosed quoted identifier.".into()))?;
            out.push(Token::Word(chars[start..start + end].iter().collect()));
            i = start + end + 1;
        } else if c == '?' {
            out.push(Token::Param(None));
            i += 1;
        } else if c == '@' {
            let start = i + 1;
            i = start;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            let index = name
                .strip_prefix(['p', 'P'])
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    SyntaxError(format!("Must declare the scalar variable \"@{name}\"."))
                })?;
            out.push(Token::Param(Some(index)));
        } else if c.is_alphabetic() || c == '_' || c == '#' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '#'))
            {
                i += 1;
            }
            out.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let sym = SYMBOLS
                .iter()
                .find(|s| rest.starts_with(**s))
                .copied()
                .ok_or_else(|| SyntaxError(format!("Incorrect syntax near '{c}'.")))?;
            out.push(Token::Sym(sym));
            i += sym.len();
        }
    }
    Ok(out)
}

/// Column of a CREATE TABLE; `nullable` is `None` when not declared
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ColumnDef {
    pub(crate) name: String,
    pub(crate) column_type: ColumnType,
    pub(crate) nullable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    /// 0-based parameter index
    Param(usize),
    Column(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Predicate {
    Compare {
        column: String,
        op: CmpOp,
        value: Expr,
    },
    IsNull {
        column: String,
        negated: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Projection {
    All,
    Count,
    Items(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Select {
    pub(crate) projection: Projection,
    pub(crate) table: Option<String>,
    pub(crate) filter: Vec<Predicate>,
    /// `Some(empty)` for `FOR UPDATE` without a column list
    pub(crate) for_update: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    Filter(Vec<Predicate>),
    CurrentOf(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        table: String,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    Select(Select),
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        target: Target,
    },
    Delete {
        table: String,
        target: Target,
    },
    Use(String),
    Print(Expr),
    RaiseError {
        message: String,
        severity: u8,
        state: u8,
    },
    WaitFor(Duration),
    Begin,
    Commit,
    Rollback,
}

/// Parse a batch of statements separated by `;` or simply juxtaposed
pub(crate) fn parse_batch(sql: &str) -> PResult<Vec<Statement>> {
    let mut parser = Parser::new(tokenize(sql)?);
    let mut statements = Vec::new();
    loop {
        while parser.eat_sym(";") {}
        if parser.peek().is_none() {
            break;
        }
        statements.push(parser.statement()?);
    }
    Ok(statements)
}

/// Parse a stand-alone search condition
pub(crate) fn parse_condition(condition: &str) -> PResult<Vec<Predicate>> {
    let mut parser = Parser::new(tokenize(condition)?);
    let predicates = parser.conditions()?;
    match parser.peek() {
        None => Ok(predicates),
        Some(_) => Err(parser.near()),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_param: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            next_param: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn near(&self) -> SyntaxError {
        match self.peek() {
            Some(token) => SyntaxError(format!("Incorrect syntax near '{token}'.")),
            None => SyntaxError("Incorrect syntax near the end of the statement.".into()),
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> PResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.near())
        }
    }

    fn at_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Some(Token::Sym(s)) if *s == sym)
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if self.at_sym(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> PResult<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.near())
        }
    }

    fn ident(&mut self) -> PResult<String> {
        match self.peek() {
            Some(Token::Word(w)) if !is_reserved(w) => {
                let w = w.clone();
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.near()),
        }
    }

    fn ident_list(&mut self) -> PResult<Vec<String>> {
        let mut names = vec![self.ident()?];
        while self.eat_sym(",") {
            names.push(self.ident()?);
        }
        Ok(names)
    }

    /// `name`, `owner.name`, `db.owner.name` or `db..name`
    fn object_name(&mut self) -> PResult<String> {
        let mut name = self.ident()?;
        while self.eat_sym(".") {
            name.push('.');
            if self.at_sym(".") {
                continue;
            }
            name.push_str(&self.ident()?);
        }
        Ok(name)
    }

    fn number<T: FromStr>(&mut self) -> PResult<T> {
        match self.peek() {
            Some(Token::Number(n)) => {
                let parsed = n.parse().map_err(|_| self.near())?;
                self.pos += 1;
                Ok(parsed)
            }
            _ => Err(self.near()),
        }
    }

    fn string(&mut self) -> PResult<String> {
        match self.peek() {
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.near()),
        }
    }

    fn statement(&mut self) -> PResult<Statement> {
        let keyword = match self.peek() {
            Some(Token::Word(w)) => w.to_ascii_uppercase(),
            _ => return Err(self.near()),
        };
        self.pos += 1;
        match keyword.as_str() {
            "CREATE" => {
                self.expect_keyword("TABLE")?;
                let table = self.object_name()?;
                self.expect_sym("(")?;
                let mut columns = vec![self.column_def()?];
                while self.eat_sym(",") {
                    columns.push(self.column_def()?);
                }
                self.expect_sym(")")?;
                Ok(Statement::CreateTable { table, columns })
            }
            "DROP" => {
                self.expect_keyword("TABLE")?;
                Ok(Statement::DropTable {
                    table: self.object_name()?,
                })
            }
            "INSERT" => {
                self.eat_keyword("INTO");
                let table = self.object_name()?;
                let columns = if self.eat_sym("(") {
                    let names = self.ident_list()?;
                    self.expect_sym(")")?;
                    Some(names)
                } else {
                    None
                };
                self.expect_keyword("VALUES")?;
                let mut rows = Vec::new();
                loop {
                    self.expect_sym("(")?;
                    let mut row = vec![self.expr()?];
                    while self.eat_sym(",") {
                        row.push(self.expr()?);
                    }
                    self.expect_sym(")")?;
                    rows.push(row);
                    if !self.eat_sym(",") {
                        break;
                    }
                }
                Ok(Statement::Insert {
                    table,
                    columns,
                    rows,
                })
            }
            "SELECT" => self.select().map(Statement::Select),
            "UPDATE" => {
                let table = self.object_name()?;
                self.expect_keyword("SET")?;
                let mut assignments = Vec::new();
                loop {
                    let column = self.ident()?;
                    self.expect_sym("=")?;
                    assignments.push((column, self.expr()?));
                    if !self.eat_sym(",") {
                        break;
                    }
                }
                let target = self.target()?;
                Ok(Statement::Update {
                    table,
                    assignments,
                    target,
                })
            }
            "DELETE" => {
                self.eat_keyword("FROM");
                let table = self.object_name()?;
                let target = self.target()?;
                Ok(Statement::Delete { table, target })
            }
            "USE" => Ok(Statement::Use(self.ident()?)),
            "PRINT" => Ok(Statement::Print(self.expr()?)),
            "RAISERROR" => {
                self.expect_sym("(")?;
                let message = self.string()?;
                self.expect_sym(",")?;
                let severity = self.number()?;
                self.expect_sym(",")?;
                let state = self.number()?;
                self.expect_sym(")")?;
                Ok(Statement::RaiseError {
                    message,
                    severity,
                    state,
                })
            }
            "WAITFOR" => {
                self.expect_keyword("DELAY")?;
                let text = self.string()?;
                parse_delay(&text).map(Statement::WaitFor)
            }
            "BEGIN" => {
                if !(self.eat_keyword("TRANSACTION") || self.eat_keyword("TRAN")) {
                    return Err(self.near());
                }
                Ok(Statement::Begin)
            }
            "COMMIT" | "ROLLBACK" => {
                let _ = self.eat_keyword("TRANSACTION")
                    || self.eat_keyword("TRAN")
                    || self.eat_keyword("WORK");
                Ok(if keyword == "COMMIT" {
                    Statement::Commit
                } else {
                    Statement::Rollback
                })
            }
            _ => {
                self.pos -= 1;
                Err(self.near())
            }
        }
    }

    fn column_def(&mut self) -> PResult<ColumnDef> {
        let name = self.ident()?;
        let type_name = self.ident()?;
        let mut args = Vec::new();
        if self.eat_sym("(") {
            args.push(self.number::<u32>()?);
            while self.eat_sym(",") {
                args.push(self.number::<u32>()?);
            }
            self.expect_sym(")")?;
        }
        let column_type = ColumnType::parse(&type_name, &args)
            .map_err(|_| SyntaxError(format!("Cannot find data type {type_name}.")))?;
        let nullable = if self.eat_keyword("NOT") {
            self.expect_keyword("NULL")?;
            Some(false)
        } else if self.eat_keyword("NULL") {
            Some(true)
        } else {
            None
        };
        Ok(ColumnDef {
            name,
            column_type,
            nullable,
        })
    }

    fn select(&mut self) -> PResult<Select> {
        let projection = if self.eat_sym("*") {
            Projection::All
        } else if self.at_keyword("COUNT")
            && matches!(self.tokens.get(self.pos + 1), Some(Token::Sym("(")))
        {
            self.pos += 2;
            self.expect_sym("*")?;
            self.expect_sym(")")?;
            Projection::Count
        } else {
            let mut items = vec![self.expr()?];
            while self.eat_sym(",") {
                items.push(self.expr()?);
            }
            Projection::Items(items)
        };

        let table = if self.eat_keyword("FROM") {
            Some(self.object_name()?)
        } else {
            None
        };
        let filter = if table.is_some() && self.eat_keyword("WHERE") {
            self.conditions()?
        } else {
            Vec::new()
        };
        let for_update = if self.eat_keyword("FOR") {
            self.expect_keyword("UPDATE")?;
            if self.eat_keyword("OF") {
                Some(self.ident_list()?)
            } else {
                Some(Vec::new())
            }
        } else {
            None
        };
        Ok(Select {
            projection,
            table,
            filter,
            for_update,
        })
    }

    fn target(&mut self) -> PResult<Target> {
        if !self.eat_keyword("WHERE") {
            return Ok(Target::Filter(Vec::new()));
        }
        if self.eat_keyword("CURRENT") {
            self.expect_keyword("OF")?;
            return Ok(Target::CurrentOf(self.ident()?));
        }
        self.conditions().map(Target::Filter)
    }

    fn conditions(&mut self) -> PResult<Vec<Predicate>> {
        let mut predicates = Vec::new();
        loop {
            let column = self.ident()?;
            let predicate = if self.eat_keyword("IS") {
                let negated = self.eat_keyword("NOT");
                self.expect_keyword("NULL")?;
                Predicate::IsNull { column, negated }
            } else {
                let op = match self.peek() {
                    Some(Token::Sym("=")) => CmpOp::Eq,
                    Some(Token::Sym("<>" | "!=")) => CmpOp::Ne,
                    Some(Token::Sym("<")) => CmpOp::Lt,
                    Some(Token::Sym(">")) => CmpOp::Gt,
                    Some(Token::Sym("<=")) => CmpOp::Le,
                    Some(Token::Sym(">=")) => CmpOp::Ge,
                    _ => return Err(self.near()),
                };
                self.pos += 1;
                Predicate::Compare {
                    column,
                    op,
                    value: self.expr()?,
                }
            };
            predicates.push(predicate);
            if !self.eat_keyword("AND") {
                return Ok(predicates);
            }
        }
    }

    fn expr(&mut self) -> PResult<Expr> {
        let negative = self.eat_sym("-");
        let Some(token) = self.peek().cloned() else {
            return Err(self.near());
        };
        let expr = match token {
            Token::Number(n) => Expr::Literal(number_value(&n, negative).ok_or_else(|| self.near())?),
            _ if negative => return Err(self.near()),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Hex(b) => Expr::Literal(Value::Bytes(b)),
            Token::Param(None) => {
                let index = self.next_param;
                self.next_param += 1;
                Expr::Param(index)
            }
            Token::Param(Some(n)) => Expr::Param(n - 1),
            Token::Word(w) if w.eq_ignore_ascii_case("NULL") => Expr::Literal(Value::Null),
            Token::Word(w) if !is_reserved(&w) => Expr::Column(w),
            _ => return Err(self.near()),
        };
        self.pos += 1;
        Ok(expr)
    }
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}

fn number_value(text: &str, negative: bool) -> Option<Value> {
    let signed = if negative {
        format!("-{text}")
    } else {
        text.to_string()
    };
    if text.contains('.') {
        return Decimal::from_str(&signed).ok().map(Value::Decimal);
    }
    match signed.parse::<i64>() {
        Ok(n) => Some(match i32::try_from(n) {
            Ok(small) => Value::Int32(small),
            Err(_) => Value::Int64(n),
        }),
        Err(_) => Decimal::from_str(&signed).ok().map(Value::Decimal),
    }
}

/// `hh:mm:ss[.fff]`
fn parse_delay(text: &str) -> PResult<Duration> {
    let invalid = || SyntaxError(format!("Incorrect syntax near '{text}'."));
    let parts: Vec<&str> = text.trim().split(':').collect();
    let [h, m, s] = parts.as_slice() else {
        return Err(invalid());
    };
    let hours: u64 = h.parse().map_err(|_| invalid())?;
    let minutes: u64 = m.parse().map_err(|_| invalid())?;
    let seconds: f64 = s.parse().map_err(|_| invalid())?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return Err(invalid());
    }
    Ok(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

/// Last component of a possibly qualified name, and the database when given
pub(crate) fn split_object_name(name: &str) -> (Option<&str>, &str) {
    let parts: Vec<&str> = name.split('.').collect();
    let table = parts.last().copied().unwrap_or(name);
    let database = match parts.as_slice() {
        [db, _, _] if !db.is_empty() => Some(*db),
        _ => None,
    };
    (database, table)
}
