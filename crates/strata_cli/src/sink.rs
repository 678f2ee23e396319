//! Result sinks for the `sql` command: box, csv and json.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::str::FromStr;

use serde_json::json;
use strata_common::timefmt::{format_datetime, TimeLocation};
use strata_common::{Column, StrataError, StrataResult, Value};

use crate::dispatch::SqlArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Box,
    Csv,
    Json,
}

impl FromStr for Format {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "box" => Ok(Format::Box),
            "csv" => Ok(Format::Csv),
            "json" => Ok(Format::Json),
            other => Err(StrataError::InvalidArgument(format!(
                "unknown format '{}', expected box, csv or json",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// `-` writes to stdout.
    pub output: String,
    pub format: Format,
    pub delimiter: char,
    pub rownum: bool,
    pub heading: bool,
    pub footer: bool,
    /// `ns`, `us`, `ms`, `s`, `default`, `rfc3339` or a strftime pattern.
    pub time_format: String,
    pub tz: TimeLocation,
    /// Decimal places for floats; negative keeps full precision.
    pub precision: i32,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            output: "-".to_string(),
            format: Format::Box,
            delimiter: ',',
            rownum: true,
            heading: true,
            footer: true,
            time_format: "default".to_string(),
            tz: TimeLocation::Utc,
            precision: -1,
        }
    }
}

impl SinkOptions {
    /// Apply the flags of one `sql` command on top of `base`.
    pub fn from_args(args: &SqlArgs, base: &SinkOptions) -> StrataResult<SinkOptions> {
        if !args.compress.is_empty() {
            return Err(StrataError::InvalidArgument(format!(
                "unsupported compression '{}'",
                args.compress
            )));
        }
        let mut delim = args.delimiter.chars();
        let delimiter = match (delim.next(), delim.next()) {
            (Some(c), None) => c,
            _ if args.delimiter == "\\t" => '\t',
            _ => {
                return Err(StrataError::InvalidArgument(format!(
                    "delimiter must be one character, got '{}'",
                    args.delimiter
                )))
            }
        };
        let tz = match &args.tz {
            Some(name) => TimeLocation::parse(name)?,
            None => base.tz,
        };
        Ok(SinkOptions {
            output: args.output.clone(),
            format: args.format.parse()?,
            delimiter,
            rownum: args.rownum(),
            heading: args.heading(),
            footer: args.footer(),
            time_format: args
                .time_format
                .clone()
                .unwrap_or_else(|| base.time_format.clone()),
            tz,
            precision: args.precision,
        })
    }
}

/// Streaming consumer of one result set.
pub trait Sink {
    fn begin(&mut self, columns: &[Column]) -> io::Result<()>;
    fn row(&mut self, nrow: u64, values: &[Value]) -> io::Result<()>;
    /// `message` is the statement summary, e.g. `"3 rows fetched."`.
    fn end(&mut self, message: &str) -> io::Result<()>;
}

/// Build the sink `opts` describes, writing to `opts.output` or `stdout`.
pub fn open_sink<'a>(opts: SinkOptions, stdout: Box<dyn Write + 'a>) -> StrataResult<Box<dyn Sink + 'a>> {
    let out: Box<dyn Write + 'a> = if opts.output.is_empty() || opts.output == "-" {
        stdout
    } else {
        Box::new(BufWriter::new(File::create(&opts.output)?))
    };
    Ok(match opts.format {
        Format::Box => Box::new(BoxSink::new(opts, out)),
        Format::Csv => Box::new(CsvSink { opts, out }),
        Format::Json => Box::new(JsonSink::new(opts, out)),
    })
}

fn render_cell(v: &Value, opts: &SinkOptions, null: &str) -> String {
    match v {
        Value::Null => null.to_string(),
        Value::Datetime(ns) => format_datetime(*ns, &opts.time_format, &opts.tz).to_string(),
        Value::Float32(f) if opts.precision >= 0 => format!("{:.*}", opts.precision as usize, f),
        Value::Float64(f) if opts.precision >= 0 => format!("{:.*}", opts.precision as usize, f),
        other => other.to_string(),
    }
}

fn round(f: f64, precision: i32) -> f64 {
    if precision < 0 {
        return f;
    }
    let scale = 10f64.powi(precision);
    (f * scale).round() / scale
}

fn json_value(v: &Value, opts: &SinkOptions) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Int16(n) => json!(n),
        Value::Int32(n) => json!(n),
        Value::Int64(n) => json!(n),
        Value::Float32(f) => json!(round(f64::from(*f), opts.precision)),
        Value::Float64(f) => json!(round(*f, opts.precision)),
        Value::Datetime(ns) => match format_datetime(*ns, &opts.time_format, &opts.tz) {
            Value::Int64(n) => json!(n),
            other => json!(other.to_string()),
        },
        Value::String(s) => json!(s),
        other => json!(other.to_string()),
    }
}

fn header_names(columns: &[Column], rownum: bool) -> Vec<String> {
    let mut names = Vec::with_capacity(columns.len() + 1);
    if rownum {
        names.push("ROWNUM".to_string());
    }
    names.extend(columns.iter().map(|c| c.name.clone()));
    names
}

// ── box ────────────────────────────────────────────────────────────────

/// Buffers the whole result to size the columns.
pub struct BoxSink<'a> {
    opts: SinkOptions,
    out: Box<dyn Write + 'a>,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl<'a> BoxSink<'a> {
    pub fn new(opts: SinkOptions, out: Box<dyn Write + 'a>) -> Self {
        Self {
            opts,
            out,
            header: Vec::new(),
            rows: Vec::new(),
        }
    }
}

impl Sink for BoxSink<'_> {
    fn begin(&mut self, columns: &[Column]) -> io::Result<()> {
        self.header = header_names(columns, self.opts.rownum);
        Ok(())
    }

    fn row(&mut self, nrow: u64, values: &[Value]) -> io::Result<()> {
        let mut cells = Vec::with_capacity(values.len() + 1);
        if self.opts.rownum {
            cells.push(nrow.to_string());
        }
        cells.extend(values.iter().map(|v| render_cell(v, &self.opts, "NULL")));
        self.rows.push(cells);
        Ok(())
    }

    fn end(&mut self, message: &str) -> io::Result<()> {
        let header = if self.opts.heading {
            Some(self.header.as_slice())
        } else {
            None
        };
        write_box(&mut self.out, header, &self.rows)?;
        if self.opts.footer && !message.is_empty() {
            writeln!(self.out, "{}", message)?;
        }
        self.out.flush()
    }
}

/// Draw `rows` as an ascii box, with an optional header row.
pub fn write_box(out: &mut dyn Write, header: Option<&[String]>, rows: &[Vec<String>]) -> io::Result<()> {
    let ncols = header
        .map(|h| h.len())
        .unwrap_or_else(|| rows.first().map(|r| r.len()).unwrap_or(0));
    if ncols == 0 {
        return Ok(());
    }
    let mut widths = vec![0usize; ncols];
    for line in header.into_iter().chain(rows.iter().map(|r| r.as_slice())) {
        for (i, cell) in line.iter().enumerate().take(ncols) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let border: String = widths
        .iter()
        .map(|w| "-".repeat(w + 2))
        .collect::<Vec<_>>()
        .join("+");
    let border = format!("+{}+", border);
    let write_line = |out: &mut dyn Write, cells: &[String]| -> io::Result<()> {
        let padded: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let cell = cells.get(i).map(String::as_str).unwrap_or("");
                format!(" {}{} ", cell, " ".repeat(w - cell.chars().count()))
            })
            .collect();
        writeln!(out, "|{}|", padded.join("|"))
    };

    writeln!(out, "{}", border)?;
    if let Some(h) = header {
        write_line(out, h)?;
        writeln!(out, "{}", border)?;
    }
    for r in rows {
        write_line(out, r)?;
    }
    writeln!(out, "{}", border)
}

// ── csv ────────────────────────────────────────────────────────────────

pub struct CsvSink<'a> {
    opts: SinkOptions,
    out: Box<dyn Write + 'a>,
}

fn quote_field(value: &str, delimiter: char) -> String {
    let needs_quoting = value.contains(delimiter)
        || value.contains('"')
        || value.contains('\n')
        || value.contains('\r');
    if needs_quoting {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

impl CsvSink<'_> {
    fn write_record(&mut self, fields: &[String]) -> io::Result<()> {
        let d = self.opts.delimiter;
        let line: Vec<String> = fields.iter().map(|f| quote_field(f, d)).collect();
        writeln!(self.out, "{}", line.join(&d.to_string()))
    }
}

impl Sink for CsvSink<'_> {
    fn begin(&mut self, columns: &[Column]) -> io::Result<()> {
        if self.opts.heading {
            let names = header_names(columns, self.opts.rownum);
            self.write_record(&names)?;
        }
        Ok(())
    }

    fn row(&mut self, nrow: u64, values: &[Value]) -> io::Result<()> {
        let mut fields = Vec::with_capacity(values.len() + 1);
        if self.opts.rownum {
            fields.push(nrow.to_string());
        }
        fields.extend(values.iter().map(|v| render_cell(v, &self.opts, "")));
        self.write_record(&fields)
    }

    fn end(&mut self, _message: &str) -> io::Result<()> {
        self.out.flush()
    }
}

// ── json ───────────────────────────────────────────────────────────────

/// `{"data": {"columns", "types", "rows"}, "success", "reason"}`
pub struct JsonSink<'a> {
    opts: SinkOptions,
    out: Box<dyn Write + 'a>,
    columns: Vec<String>,
    types: Vec<String>,
    rows: Vec<serde_json::Value>,
}

impl<'a> JsonSink<'a> {
    pub fn new(opts: SinkOptions, out: Box<dyn Write + 'a>) -> Self {
        Self {
            opts,
            out,
            columns: Vec::new(),
            types: Vec::new(),
            rows: Vec::new(),
        }
    }
}

impl Sink for JsonSink<'_> {
    fn begin(&mut self, columns: &[Column]) -> io::Result<()> {
        self.columns = header_names(columns, self.opts.rownum);
        if self.opts.rownum {
            self.types.push("int64".to_string());
        }
        self.types
            .extend(columns.iter().map(|c| c.data_type.to_string()));
        Ok(())
    }

    fn row(&mut self, nrow: u64, values: &[Value]) -> io::Result<()> {
        let mut cells = Vec::with_capacity(values.len() + 1);
        if self.opts.rownum {
            cells.push(json!(nrow));
        }
        cells.extend(values.iter().map(|v| json_value(v, &self.opts)));
        self.rows.push(serde_json::Value::Array(cells));
        Ok(())
    }

    fn end(&mut self, message: &str) -> io::Result<()> {
        let doc = json!({
            "data": {
                "columns": self.columns,
                "types": self.types,
                "rows": self.rows,
            },
            "success": true,
            "reason": message,
        });
        serde_json::to_writer(&mut self.out, &doc)?;
        writeln!(self.out)?;
        self.out.flush()
    }
}
