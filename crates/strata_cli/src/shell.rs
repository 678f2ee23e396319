//! Interactive shell: a rustyline loop in front of the [`Dispatcher`].

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use strata_access::{IndexListing, Rows, TableDescription, TableInfo};
use strata_common::{Context, StrataError, StrataResult};
use tracing::debug;

use crate::dispatch::{CommandOutput, Dispatcher, SqlArgs, VERBS};
use crate::sink::{open_sink, write_box, SinkOptions};
use crate::tokenizer::parse_command_line;

const PROMPT: &str = "strata> ";

const HELP: &str = "\
commands:
  show tables [-a]           list tables
  show indexes               list indexes
  show table [-a] <table>    describe a table
  show tags <table>          list tag names of a tag table
  desc [-a] <table>          describe a table
  explain [-f] <sql>         print the plan of a statement
  sql [flags] <sql>          run a statement
      -f box|csv|json  -o <file>  -d <delim>  -t <timeformat>  --tz <zone>
      -p <precision>  --[no-]heading  --[no-]footer  --[no-]rownum
  help                       this text
  exit, quit, \\q             leave the shell
any other line runs as SQL";

/// `~/.strata_history`.
pub fn history_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|h| h.join(".strata_history"))
}

/// Writes command results as text to `out`.
pub struct ShellOutput<W: Write> {
    out: W,
    base: SinkOptions,
}

impl<W: Write> ShellOutput<W> {
    pub fn new(out: W, base: SinkOptions) -> Self {
        Self { out, base }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn table(&mut self, header: &[&str], rows: Vec<Vec<String>>) -> StrataResult<()> {
        let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
        write_box(&mut self.out, Some(&header), &rows)?;
        Ok(())
    }
}

impl<W: Write> CommandOutput for ShellOutput<W> {
    fn show_tables(&mut self, tables: &[TableInfo]) -> StrataResult<()> {
        let rows = tables
            .iter()
            .enumerate()
            .map(|(i, t)| {
                vec![
                    (i + 1).to_string(),
                    t.name.clone(),
                    t.id.to_string(),
                    t.type_description(),
                ]
            })
            .collect();
        self.table(&["ROWNUM", "NAME", "ID", "TYPE"], rows)
    }

    fn show_indexes(&mut self, indexes: &[IndexListing]) -> StrataResult<()> {
        let rows = indexes
            .iter()
            .enumerate()
            .map(|(i, x)| {
                vec![
                    (i + 1).to_string(),
                    x.table.clone(),
                    x.name.clone(),
                    x.id.to_string(),
                    x.index_type.to_string(),
                ]
            })
            .collect();
        self.table(&["ROWNUM", "TABLE", "NAME", "ID", "TYPE"], rows)
    }

    fn show_tags(&mut self, _table: &str, tags: &[String]) -> StrataResult<()> {
        let rows = tags
            .iter()
            .enumerate()
            .map(|(i, t)| vec![(i + 1).to_string(), t.clone()])
            .collect();
        self.table(&["ROWNUM", "NAME"], rows)
    }

    fn describe_table(&mut self, desc: &TableDescription) -> StrataResult<()> {
        writeln!(
            self.out,
            "{}.{}.{} ({}, id {})",
            desc.database,
            desc.user,
            desc.name,
            desc.type_description(),
            desc.id
        )?;
        let rows = desc
            .columns
            .iter()
            .map(|c| {
                let mut flags = Vec::new();
                if c.is_tag_name() {
                    flags.push("tag name");
                }
                if c.is_basetime() {
                    flags.push("basetime");
                }
                if c.is_summarized() {
                    flags.push("summarized");
                }
                if c.is_meta_column() {
                    flags.push("meta");
                }
                vec![
                    c.name.clone(),
                    c.data_type.to_string(),
                    c.width().to_string(),
                    flags.join(", "),
                ]
            })
            .collect();
        self.table(&["COLUMN", "TYPE", "LENGTH", "FLAG"], rows)?;
        if !desc.indexes.is_empty() {
            let rows = desc
                .indexes
                .iter()
                .map(|x| vec![x.name.clone(), x.id.to_string(), x.index_type.to_string()])
                .collect();
            self.table(&["INDEX", "ID", "TYPE"], rows)?;
        }
        Ok(())
    }

    fn explain(&mut self, plan: &str) -> StrataResult<()> {
        writeln!(self.out, "{}", plan)?;
        Ok(())
    }

    fn sql(&mut self, args: &SqlArgs, rows: &mut Rows) -> StrataResult<()> {
        let opts = SinkOptions::from_args(args, &self.base)?;
        let mut sink = open_sink(opts, Box::new(&mut self.out))?;
        sink.begin(rows.columns())?;
        let mut nrow = 0u64;
        while let Some(values) = rows.fetch()? {
            nrow += 1;
            sink.row(nrow, &values)?;
        }
        sink.end(&rows.message())?;
        Ok(())
    }

    fn message(&mut self, msg: &str) -> StrataResult<()> {
        writeln!(self.out, "{}", msg)?;
        Ok(())
    }
}

/// Lines whose first word is not a verb run as SQL.
pub fn normalize_line(line: &str) -> String {
    let line = line.trim().trim_end_matches(';').trim_end();
    let verb = line.split_whitespace().next().unwrap_or("");
    if VERBS.contains(&verb) {
        line.to_string()
    } else {
        format!("sql -- {}", line)
    }
}

/// Run one line and print the outcome; `false` ends the session.
pub fn run_line<W: Write>(dispatcher: &Dispatcher, out: &mut ShellOutput<W>, line: &str) -> bool {
    let trimmed = line.trim();
    match trimmed {
        "" => return true,
        "exit" | "quit" | "\\q" => return false,
        "help" | "\\?" => {
            let _ = writeln!(out.out, "{}", HELP);
            return true;
        }
        _ => {}
    }
    let tokens = parse_command_line(&normalize_line(trimmed));
    debug!(?tokens, "shell line");
    if let Err(e) = dispatcher.exec(&Context::background(), &tokens, out) {
        report(&mut out.out, &e);
    }
    let _ = out.out.flush();
    true
}

fn report(out: &mut dyn Write, e: &StrataError) {
    let _ = writeln!(out, "ERR {}", e);
}

/// Read lines until `exit` or end of input.
pub fn run_repl(dispatcher: &Dispatcher, base: SinkOptions) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = history.as_ref().filter(|p| p.exists()) {
        if let Err(e) = rl.load_history(path) {
            debug!("Could not load history: {}", e);
        }
    }
    let mut out = ShellOutput::new(std::io::stdout(), base);

    println!("strata v{}, type help for commands", env!("CARGO_PKG_VERSION"));
    loop {
        let line = match rl.readline(PROMPT) {
            Ok(l) => l,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        };
        if !line.trim().is_empty() {
            let _ = rl.add_history_entry(line.as_str());
        }
        if !run_line(dispatcher, &mut out, &line) {
            break;
        }
    }

    if let Some(path) = history {
        if let Err(e) = rl.save_history(&path) {
            debug!("Could not save history: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_access::{ConnFactory, ConnectOption, Database};
    use strata_common::config::StrataConfig;
    use strata_engine::mem::MemEngine;

    fn dispatcher() -> Dispatcher {
        let db = Database::new(Arc::new(MemEngine::new()), StrataConfig::default()).unwrap();
        db.startup().unwrap();
        let connect: ConnFactory = Arc::new(move || {
            db.connect(&Context::background(), &[ConnectOption::password("sys", "manager")])
        });
        Dispatcher::new(connect)
    }

    fn session(lines: &[&str]) -> String {
        let d = dispatcher();
        let mut out = ShellOutput::new(Vec::new(), SinkOptions::default());
        for line in lines {
            if !run_line(&d, &mut out, line) {
                break;
            }
        }
        String::from_utf8(out.into_inner()).unwrap()
    }

    #[test]
    fn test_normalize_line() {
        assert_eq!(normalize_line("select 1;"), "sql -- select 1");
        assert_eq!(normalize_line("  show tables  "), "show tables");
        assert_eq!(normalize_line("sql -f csv select 1"), "sql -f csv select 1");
    }

    #[test]
    fn test_bare_sql_and_box_output() {
        let text = session(&[
            "create table logs (msg varchar(20))",
            "insert into logs values ('hello world');",
            "select * from logs",
        ]);
        let expected = "\
Created successfully.
a row inserted.
+--------+-------------+
| ROWNUM | MSG         |
+--------+-------------+
| 1      | hello world |
+--------+-------------+
a row fetched.
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_csv_flags() {
        let text = session(&[
            "create table logs (msg varchar(20))",
            "insert into logs values ('a')",
            "sql -f csv --no-rownum select * from logs",
        ]);
        assert!(text.ends_with("MSG\na\n"), "{}", text);
    }

    #[test]
    fn test_errors_are_reported_and_session_continues() {
        let text = session(&["show nothing", "select * from missing", "help"]);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("ERR invalid argument"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("ERR ")).count(), 2);
        assert!(text.contains("commands:"));
    }

    #[test]
    fn test_exit_stops_session() {
        let text = session(&["exit", "help"]);
        assert!(text.is_empty());
    }

    #[test]
    fn test_show_tables_box() {
        let text = session(&["create table logs (msg varchar(20))", "show tables"]);
        assert!(text.contains("| ROWNUM | NAME | ID"), "{}", text);
        assert!(text.contains("| LOGS "), "{}", text);
    }
}
