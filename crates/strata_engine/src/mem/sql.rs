//! Tokenizer and parser for the SQL subset understood by the in-memory engine.

use strata_common::{ColumnFlag, ColumnType, StrataError, StrataResult, TableType, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    Param,
    Sym(&'static str),
}

fn syntax(msg: impl Into<String>) -> StrataError {
    StrataError::engine(-2, format!("syntax error, {}", msg.into()))
}

fn tokenize(sql: &str) -> StrataResult<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '-' && i + 1 < chars.len() && chars[i + 1] == '-' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '\'' {
            let mut s = String::new();
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err(syntax("unterminated string literal"));
                }
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        s.push('\'');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                s.push(chars[i]);
                i += 1;
            }
            tokens.push(Token::Str(s));
            continue;
        }
        let negative_number = c == '-'
            && i + 1 < chars.len()
            && chars[i + 1].is_ascii_digit()
            && !matches!(
                tokens.last(),
                Some(Token::Ident(_)) | Some(Token::Num(_)) | Some(Token::Str(_)) | Some(Token::Param)
            );
        if c.is_ascii_digit() || negative_number {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e' || chars[i] == 'E') {
                i += 1;
            }
            tokens.push(Token::Num(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_alphabetic() || c == '_' || c == '"' {
            if c == '"' {
                let start = i + 1;
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                i += 1;
                continue;
            }
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let sym = match two.as_str() {
            "<=" => Some("<="),
            ">=" => Some(">="),
            "<>" | "!=" => Some("<>"),
            _ => None,
        };
        if let Some(sym) = sym {
            tokens.push(Token::Sym(sym));
            i += 2;
            continue;
        }
        let sym = match c {
            '(' => "(",
            ')' => ")",
            ',' => ",",
            '*' => "*",
            '=' => "=",
            '<' => "<",
            '>' => ">",
            ';' => ";",
            '?' => {
                tokens.push(Token::Param);
                i += 1;
                continue;
            }
            other => return Err(syntax(format!("unexpected character '{}'", other))),
        };
        tokens.push(Token::Sym(sym));
        i += 1;
    }
    while tokens.last() == Some(&Token::Sym(";")) {
        tokens.pop();
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Zero-based position of the `?` placeholder.
    Param(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cond {
    pub column: String,
    pub op: CmpOp,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Star,
    Column { name: String, alias: Option<String> },
    CountStar { alias: Option<String> },
    Min { column: String, alias: Option<String> },
    Max { column: String, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub length: usize,
    pub flag: ColumnFlag,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        name: String,
        table_type: TableType,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        name: String,
    },
    TruncateTable {
        name: String,
    },
    AlterSystem,
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        values: Vec<Expr>,
    },
    Delete {
        table: String,
        filter: Vec<Cond>,
    },
    Select {
        table: String,
        items: Vec<SelectItem>,
        filter: Vec<Cond>,
        order_by: Option<(String, bool)>,
        limit: Option<usize>,
    },
}

impl Statement {
    pub fn param_count(&self) -> usize {
        let count_expr = |e: &Expr| matches!(e, Expr::Param(_)) as usize;
        let count_conds = |conds: &[Cond]| conds.iter().map(|c| count_expr(&c.value)).sum::<usize>();
        match self {
            Statement::Insert { values, .. } => values.iter().map(count_expr).sum(),
            Statement::Delete { filter, .. } => count_conds(filter),
            Statement::Select { filter, .. } => count_conds(filter),
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    params: usize,
}

pub fn parse(sql: &str) -> StrataResult<Statement> {
    let tokens = tokenize(sql)?;
    if tokens.is_empty() {
        return Err(syntax("empty statement"));
    }
    let mut p = Parser {
        tokens,
        pos: 0,
        params: 0,
    };
    let stmt = p.statement()?;
    if p.pos < p.tokens.len() {
        return Err(syntax(format!("unexpected token {:?}", p.tokens[p.pos])));
    }
    Ok(stmt)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn accept_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> StrataResult<()> {
        if self.accept_keyword(kw) {
            Ok(())
        } else {
            Err(syntax(format!("expected {}", kw)))
        }
    }

    fn accept_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> StrataResult<()> {
        if self.accept_sym(sym) {
            Ok(())
        } else {
            Err(syntax(format!("expected '{}'", sym)))
        }
    }

    fn ident(&mut self) -> StrataResult<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(syntax(format!("expected identifier, found {:?}", other))),
        }
    }

    fn table_name(&mut self) -> StrataResult<String> {
        let name = self.ident()?;
        // strip `db.user.` qualifiers
        let table = name.rsplit('.').next().unwrap_or(&name);
        Ok(table.to_uppercase())
    }

    fn statement(&mut self) -> StrataResult<Statement> {
        let kw = self.ident()?.to_uppercase();
        match kw.as_str() {
            "CREATE" => self.create(),
            "DROP" => {
                self.expect_keyword("TABLE")?;
                Ok(Statement::DropTable {
                    name: self.table_name()?,
                })
            }
            "TRUNCATE" => {
                self.expect_keyword("TABLE")?;
                Ok(Statement::TruncateTable {
                    name: self.table_name()?,
                })
            }
            "ALTER" => {
                self.expect_keyword("SYSTEM")?;
                self.pos = self.tokens.len();
                Ok(Statement::AlterSystem)
            }
            "INSERT" => self.insert(),
            "DELETE" => self.delete(),
            "SELECT" => self.select(),
            other => Err(syntax(format!("unsupported statement {}", other))),
        }
    }

    fn create(&mut self) -> StrataResult<Statement> {
        let table_type = if self.accept_keyword("TAG") {
            TableType::Tag
        } else if self.accept_keyword("LOG") {
            TableType::Log
        } else if self.accept_keyword("VOLATILE") {
            TableType::Volatile
        } else if self.accept_keyword("LOOKUP") {
            TableType::Lookup
        } else {
            TableType::Log
        };
        self.expect_keyword("TABLE")?;
        let name = self.table_name()?;
        self.expect_sym("(")?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.column_def()?);
            if self.accept_sym(",") {
                continue;
            }
            self.expect_sym(")")?;
            break;
        }
        // trailing table options (METADATA, WITH ROLLUP, ...) are accepted and ignored
        self.pos = self.tokens.len();
        if table_type == TableType::Tag {
            if !columns.iter().any(|c| c.flag.contains(ColumnFlag::TAG_NAME)) {
                if let Some(first) = columns.first_mut() {
                    first.flag = first.flag.union(ColumnFlag::TAG_NAME);
                }
            }
            if !columns.iter().any(|c| c.flag.contains(ColumnFlag::BASETIME)) {
                if let Some(col) = columns
                    .iter_mut()
                    .find(|c| c.column_type == ColumnType::Datetime)
                {
                    col.flag = col.flag.union(ColumnFlag::BASETIME);
                }
            }
        }
        Ok(Statement::CreateTable {
            name,
            table_type,
            columns,
        })
    }

    fn column_def(&mut self) -> StrataResult<ColumnDef> {
        let name = self.ident()?.to_uppercase();
        let type_name = self.ident()?;
        let column_type = ColumnType::parse(&type_name)
            .ok_or_else(|| syntax(format!("unknown column type {}", type_name)))?;
        let mut length = 0;
        if self.accept_sym("(") {
            match self.next() {
                Some(Token::Num(n)) => {
                    length = n
                        .parse()
                        .map_err(|_| syntax(format!("bad length {}", n)))?
                }
                other => return Err(syntax(format!("bad length {:?}", other))),
            }
            self.expect_sym(")")?;
        }
        let mut flag = ColumnFlag::NONE;
        loop {
            if self.accept_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                flag = flag.union(ColumnFlag::TAG_NAME);
            } else if self.accept_keyword("BASETIME") {
                flag = flag.union(ColumnFlag::BASETIME);
            } else if self.accept_keyword("SUMMARIZED") {
                flag = flag.union(ColumnFlag::SUMMARIZED);
            } else if self.accept_keyword("NOT") {
                self.expect_keyword("NULL")?;
            } else {
                break;
            }
        }
        Ok(ColumnDef {
            name,
            column_type,
            length,
            flag,
        })
    }

    fn expr(&mut self) -> StrataResult<Expr> {
        match self.next() {
            Some(Token::Param) => {
                let idx = self.params;
                self.params += 1;
                Ok(Expr::Param(idx))
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => {
                if let Ok(v) = n.parse::<i64>() {
                    Ok(Expr::Literal(Value::Int64(v)))
                } else {
                    n.parse::<f64>()
                        .map(|v| Expr::Literal(Value::Float64(v)))
                        .map_err(|_| syntax(format!("bad number {}", n)))
                }
            }
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("NULL") => Ok(Expr::Literal(Value::Null)),
            other => Err(syntax(format!("expected value, found {:?}", other))),
        }
    }

    fn insert(&mut self) -> StrataResult<Statement> {
        self.expect_keyword("INTO")?;
        let table = self.table_name()?;
        let mut columns = None;
        if self.accept_sym("(") {
            let mut names = Vec::new();
            loop {
                names.push(self.ident()?.to_uppercase());
                if self.accept_sym(",") {
                    continue;
                }
                self.expect_sym(")")?;
                break;
            }
            columns = Some(names);
        }
        self.expect_keyword("VALUES")?;
        self.expect_sym("(")?;
        let mut values = Vec::new();
        loop {
            values.push(self.expr()?);
            if self.accept_sym(",") {
                continue;
            }
            self.expect_sym(")")?;
            break;
        }
        Ok(Statement::Insert {
            table,
            columns,
            values,
        })
    }

    fn filter(&mut self) -> StrataResult<Vec<Cond>> {
        let mut conds = Vec::new();
        if !self.accept_keyword("WHERE") {
            return Ok(conds);
        }
        loop {
            let column = self.ident()?.to_uppercase();
            let op = match self.next() {
                Some(Token::Sym("=")) => CmpOp::Eq,
                Some(Token::Sym("<>")) => CmpOp::Ne,
                Some(Token::Sym("<")) => CmpOp::Lt,
                Some(Token::Sym("<=")) => CmpOp::Le,
                Some(Token::Sym(">")) => CmpOp::Gt,
                Some(Token::Sym(">=")) => CmpOp::Ge,
                other => return Err(syntax(format!("expected comparison, found {:?}", other))),
            };
            let value = self.expr()?;
            conds.push(Cond { column, op, value });
            if !self.accept_keyword("AND") {
                break;
            }
        }
        Ok(conds)
    }

    fn delete(&mut self) -> StrataResult<Statement> {
        self.expect_keyword("FROM")?;
        let table = self.table_name()?;
        let filter = self.filter()?;
        Ok(Statement::Delete { table, filter })
    }

    fn alias(&mut self) -> StrataResult<Option<String>> {
        if self.accept_keyword("AS") {
            return Ok(Some(self.ident()?.to_uppercase()));
        }
        Ok(None)
    }

    fn select_item(&mut self) -> StrataResult<SelectItem> {
        if self.accept_sym("*") {
            return Ok(SelectItem::Star);
        }
        let name = self.ident()?;
        let upper = name.to_uppercase();
        if self.accept_sym("(") {
            let item = match upper.as_str() {
                "COUNT" => {
                    self.expect_sym("*")?;
                    self.expect_sym(")")?;
                    SelectItem::CountStar {
                        alias: self.alias()?,
                    }
                }
                "MIN" | "MAX" => {
                    let column = self.ident()?.to_uppercase();
                    self.expect_sym(")")?;
                    let alias = self.alias()?;
                    if upper == "MIN" {
                        SelectItem::Min { column, alias }
                    } else {
                        SelectItem::Max { column, alias }
                    }
                }
                other => return Err(syntax(format!("unsupported function {}", other))),
            };
            return Ok(item);
        }
        Ok(SelectItem::Column {
            name: upper,
            alias: self.alias()?,
        })
    }

    fn select(&mut self) -> StrataResult<Statement> {
        let mut items = Vec::new();
        loop {
            items.push(self.select_item()?);
            if !self.accept_sym(",") {
                break;
            }
        }
        self.expect_keyword("FROM")?;
        let table = self.table_name()?;
        let filter = self.filter()?;
        let mut order_by = None;
        if self.accept_keyword("ORDER") {
            self.expect_keyword("BY")?;
            let column = self.ident()?.to_uppercase();
            let desc = if self.accept_keyword("DESC") {
                true
            } else {
                self.accept_keyword("ASC");
                false
            };
            order_by = Some((column, desc));
        }
        let mut limit = None;
        if self.accept_keyword("LIMIT") {
            match self.next() {
                Some(Token::Num(n)) => {
                    limit = Some(n.parse().map_err(|_| syntax(format!("bad limit {}", n)))?)
                }
                Some(Token::Param) => return Err(syntax("LIMIT does not accept parameters")),
                other => return Err(syntax(format!("bad limit {:?}", other))),
            }
        }
        Ok(Statement::Select {
            table,
            items,
            filter,
            order_by,
            limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_tag_table_marks_flags() {
        let stmt = parse(
            "create tag table tag_data(name varchar(100) primary key, time datetime basetime, value double summarized)",
        )
        .unwrap();
        match stmt {
            Statement::CreateTable {
                name,
                table_type,
                columns,
            } => {
                assert_eq!(name, "TAG_DATA");
                assert_eq!(table_type, TableType::Tag);
                assert_eq!(columns.len(), 3);
                assert!(columns[0].flag.contains(ColumnFlag::TAG_NAME));
                assert_eq!(columns[0].length, 100);
                assert!(columns[1].flag.contains(ColumnFlag::BASETIME));
                assert!(columns[2].flag.contains(ColumnFlag::SUMMARIZED));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_insert_with_params() {
        let stmt = parse("INSERT INTO tag_data VALUES(?, ?, ?)").unwrap();
        assert_eq!(stmt.param_count(), 3);
    }

    #[test]
    fn test_parse_select_with_filter_order_limit() {
        let stmt = parse(
            "select _ARRIVAL_TIME, name from sys.logs where _ARRIVAL_TIME > ? and name = 'a' order by _ARRIVAL_TIME limit 21",
        )
        .unwrap();
        match stmt {
            Statement::Select {
                table,
                items,
                filter,
                order_by,
                limit,
            } => {
                assert_eq!(table, "LOGS");
                assert_eq!(items.len(), 2);
                assert_eq!(filter.len(), 2);
                assert_eq!(filter[0].op, CmpOp::Gt);
                assert_eq!(filter[0].value, Expr::Param(0));
                assert_eq!(filter[1].value, Expr::Literal(Value::String("a".into())));
                assert_eq!(order_by, Some(("_ARRIVAL_TIME".into(), false)));
                assert_eq!(limit, Some(21));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_aggregates_and_dictionary_tables() {
        let stmt = parse("select count(*) from M$SYS_TABLES where name = ?").unwrap();
        assert_eq!(stmt.param_count(), 1);
        let stmt = parse("select recent_row_time from V$TAG_DATA_STAT where name = ?").unwrap();
        assert!(matches!(stmt, Statement::Select { ref table, .. } if table == "V$TAG_DATA_STAT"));
        assert!(parse("select max(_ARRIVAL_TIME) from logs").is_ok());
    }

    #[test]
    fn test_string_literal_escapes_and_negative_numbers() {
        let stmt = parse("insert into t values('it''s', -5, 1.5)").unwrap();
        match stmt {
            Statement::Insert { values, .. } => {
                assert_eq!(values[0], Expr::Literal(Value::String("it's".into())));
                assert_eq!(values[1], Expr::Literal(Value::Int64(-5)));
                assert_eq!(values[2], Expr::Literal(Value::Float64(1.5)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("").is_err());
        assert!(parse("update t set a = 1").is_err());
        assert!(parse("select * from").is_err());
        assert!(parse("insert into t values('unterminated)").is_err());
    }
}
