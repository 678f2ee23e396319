//! Verb routing for shell command lines.
//!
//! A line is tokenized by [`parse_command_line`], the verb is checked
//! against [`VERBS`], the tokens are parsed into a [`Command`] and the
//! command runs on a fresh connection. Results go to a host supplied
//! [`CommandOutput`].

use clap::{Args as ClapArgs, Parser, Subcommand};
use strata_access::{
    describe_table, list_indexes, list_tables, list_tags, query_table_type, Conn, ConnFactory,
    IndexListing, Rows, TableDescription, TableInfo,
};
use strata_common::{Context, StrataError, StrataResult, TableType};
use tracing::debug;

use crate::tokenizer::parse_command_line;

pub const VERBS: &[&str] = &["show", "desc", "explain", "sql"];

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_subcommand = true)]
struct CommandLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Dictionary listings
    Show {
        #[command(subcommand)]
        what: ShowCommand,
    },
    /// Describe a table
    Desc {
        /// Include hidden columns
        #[arg(short = 'a', long = "all")]
        all: bool,
        table: String,
    },
    /// Print the execution plan of a statement
    Explain {
        /// Execute the statement and report the rows it produced
        #[arg(short = 'f', long = "full")]
        full: bool,
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true, trailing_var_arg = true)]
        sql: Vec<String>,
    },
    /// Run a statement
    Sql(SqlArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum ShowCommand {
    Tables {
        /// Include tables whose names start with `_`
        #[arg(short = 'a', long = "all")]
        all: bool,
    },
    Indexes,
    Table {
        #[arg(short = 'a', long = "all")]
        all: bool,
        table: String,
    },
    Tags {
        table: String,
    },
}

/// Sink options of `sql`; the flag set matches [`crate::tokenizer::SQL_FLAGS`].
#[derive(Debug, Clone, PartialEq, Eq, ClapArgs)]
pub struct SqlArgs {
    /// Output file, `-` for stdout
    #[arg(short = 'o', long = "output", default_value = "-")]
    pub output: String,

    /// box, csv or json
    #[arg(short = 'f', long = "format", default_value = "box")]
    pub format: String,

    /// Compression of the output file (none supported)
    #[arg(long = "compress", default_value = "")]
    pub compress: String,

    /// csv field delimiter
    #[arg(short = 'd', long = "delimiter", default_value = ",")]
    pub delimiter: String,

    #[arg(long = "rownum", overrides_with = "no_rownum")]
    rownum: bool,
    #[arg(long = "no-rownum", overrides_with = "rownum")]
    no_rownum: bool,

    /// ns, us, ms, s, default, rfc3339 or a strftime pattern
    #[arg(short = 't', long = "timeformat")]
    pub time_format: Option<String>,

    /// UTC, Local or an offset like +09:00
    #[arg(long = "tz")]
    pub tz: Option<String>,

    #[arg(long = "heading", overrides_with = "no_heading")]
    heading: bool,
    #[arg(long = "no-heading", overrides_with = "heading")]
    no_heading: bool,

    #[arg(long = "footer", overrides_with = "no_footer")]
    footer: bool,
    #[arg(long = "no-footer", overrides_with = "footer")]
    no_footer: bool,

    /// Decimal places of floats, negative for full precision
    #[arg(short = 'p', long = "precision", default_value_t = -1, allow_negative_numbers = true)]
    pub precision: i32,

    #[arg(required = true, num_args = 1.., allow_hyphen_values = true, trailing_var_arg = true)]
    pub sql: Vec<String>,
}

impl SqlArgs {
    pub fn rownum(&self) -> bool {
        !self.no_rownum
    }

    pub fn heading(&self) -> bool {
        !self.no_heading
    }

    pub fn footer(&self) -> bool {
        !self.no_footer
    }

    pub fn sql_text(&self) -> String {
        self.sql.join(" ")
    }
}

/// Host side of the dispatcher: renders what a command produced.
pub trait CommandOutput {
    fn show_tables(&mut self, tables: &[TableInfo]) -> StrataResult<()>;
    fn show_indexes(&mut self, indexes: &[IndexListing]) -> StrataResult<()>;
    fn show_tags(&mut self, table: &str, tags: &[String]) -> StrataResult<()>;
    fn describe_table(&mut self, desc: &TableDescription) -> StrataResult<()>;
    fn explain(&mut self, plan: &str) -> StrataResult<()>;
    /// Called for fetchable statements only; the dispatcher closes `rows`.
    fn sql(&mut self, args: &SqlArgs, rows: &mut Rows) -> StrataResult<()>;
    fn message(&mut self, msg: &str) -> StrataResult<()>;
}

/// Parse tokens into a [`Command`]. Unknown verbs are `CommandNotFound`.
pub fn parse_command(tokens: &[String]) -> StrataResult<Command> {
    let verb = tokens.first().ok_or(StrataError::CommandNotFound)?;
    if !VERBS.contains(&verb.as_str()) {
        return Err(StrataError::CommandNotFound);
    }
    let line = CommandLine::try_parse_from(tokens)
        .map_err(|e| StrataError::InvalidArgument(e.to_string().trim().to_string()))?;
    Ok(line.command)
}

pub struct Dispatcher {
    connect: ConnFactory,
}

impl Dispatcher {
    pub fn new(connect: ConnFactory) -> Self {
        Self { connect }
    }

    pub fn exec_line(
        &self,
        ctx: &Context,
        line: &str,
        out: &mut dyn CommandOutput,
    ) -> StrataResult<()> {
        self.exec(ctx, &parse_command_line(line), out)
    }

    /// Run one tokenized command on its own connection.
    pub fn exec(
        &self,
        ctx: &Context,
        tokens: &[String],
        out: &mut dyn CommandOutput,
    ) -> StrataResult<()> {
        let command = parse_command(tokens)?;
        debug!(?command, "dispatch");
        let conn = (self.connect)()?;
        let result = run(&conn, ctx, command, out);
        let closed = conn.close();
        result.and(closed)
    }
}

fn run(conn: &Conn, ctx: &Context, command: Command, out: &mut dyn CommandOutput) -> StrataResult<()> {
    match command {
        Command::Show { what } => match what {
            ShowCommand::Tables { all } => out.show_tables(&list_tables(conn, ctx, all)?),
            ShowCommand::Indexes => out.show_indexes(&list_indexes(conn, ctx)?),
            ShowCommand::Table { all, table } => {
                out.describe_table(&describe_table(conn, ctx, &table, all)?)
            }
            ShowCommand::Tags { table } => {
                let (table_type, _) = query_table_type(conn, ctx, &table)?;
                if table_type != TableType::Tag {
                    return Err(StrataError::InvalidArgument(format!(
                        "table '{}' is not a tag table",
                        table
                    )));
                }
                out.show_tags(&table, &list_tags(conn, ctx, &table)?)
            }
        },
        Command::Desc { all, table } => out.describe_table(&describe_table(conn, ctx, &table, all)?),
        Command::Explain { full, sql } => {
            let mut text = sql.join(" ");
            let mut full = full;
            if let Some(rest) = strip_keyword(&text, "full") {
                full = true;
                text = rest.to_string();
            }
            out.explain(&conn.explain(ctx, &text, full)?)
        }
        Command::Sql(args) => {
            let mut rows = conn.query(ctx, &args.sql_text(), &[])?;
            let result = if rows.is_fetchable() {
                out.sql(&args, &mut rows)
            } else {
                out.message(&rows.message())
            };
            let closed = rows.close();
            result.and(closed)
        }
    }
}

/// `"full select ..."` → `Some("select ...")`, case-insensitive.
fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let (head, rest) = text.split_once(char::is_whitespace)?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(rest.trim_start())
    } else {
        None
    }
}
