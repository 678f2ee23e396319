//! Split a shell line into command tokens.
//!
//! `sql` and `explain` keep their SQL text verbatim: known flags are peeled
//! off the front and everything from the first non-flag token (or after
//! `--`) is one token, always preceded by a `--` token so the argument
//! parser never reads SQL as flags. Other verbs use shell-style splitting
//! with quoted phrases.

use std::sync::OnceLock;

use regex::Regex;

const SPACES: [char; 4] = [' ', '\t', '\n', '\r'];

/// Flags of `sql`; `true` when the flag takes a value.
pub const SQL_FLAGS: &[(&str, bool)] = &[
    ("-o", true),
    ("--output", true),
    ("-f", true),
    ("--format", true),
    ("--compress", true),
    ("-d", true),
    ("--delimiter", true),
    ("--rownum", false),
    ("--no-rownum", false),
    ("-t", true),
    ("--timeformat", true),
    ("--tz", true),
    ("--heading", false),
    ("--no-heading", false),
    ("--footer", false),
    ("--no-footer", false),
    ("-p", true),
    ("--precision", true),
];

pub const EXPLAIN_FLAGS: &[(&str, bool)] = &[("-f", false), ("--full", false)];

fn flag_table(verb: &str) -> Option<&'static [(&'static str, bool)]> {
    match verb {
        "sql" => Some(SQL_FLAGS),
        "explain" => Some(EXPLAIN_FLAGS),
        _ => None,
    }
}

pub fn parse_command_line(line: &str) -> Vec<String> {
    let line = line.trim_start_matches(SPACES);
    if let Some(pos) = line.find(SPACES) {
        let verb = &line[..pos];
        if let Some(flags) = flag_table(verb) {
            return passthrough_tokens(verb, &line[pos..], flags);
        }
    }
    shell_tokens(line)
}

fn passthrough_tokens(verb: &str, rest: &str, flags: &[(&str, bool)]) -> Vec<String> {
    let mut out = vec![verb.to_string()];
    let mut stream = rest;
    loop {
        let Some((tok, remain)) = next_token(stream) else {
            break;
        };
        stream = remain;
        if tok == "--" {
            out.push("--".to_string());
            out.push(stream.trim_matches(SPACES).to_string());
            break;
        }
        if let Some((_, takes_value)) = flags.iter().find(|(f, _)| *f == tok) {
            out.push(tok.to_string());
            if *takes_value {
                let (value, remain) = next_token(stream).unwrap_or(("", ""));
                out.push(value.to_string());
                stream = remain;
            }
            continue;
        }
        let tail = stream.trim_matches(SPACES);
        let text = if tail.is_empty() {
            tok.to_string()
        } else {
            format!("{} {}", tok, tail)
        };
        out.push("--".to_string());
        out.push(strip_outer_quotes(&text));
        break;
    }
    out
}

/// Next whitespace-delimited token and the stream after it.
fn next_token(stream: &str) -> Option<(&str, &str)> {
    let s = stream.trim_start_matches(SPACES);
    if s.is_empty() {
        return None;
    }
    let end = s.find(SPACES).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

fn strip_outer_quotes(text: &str) -> String {
    for (q, escaped) in [('\'', "\\'"), ('"', "\\\"")] {
        if text.len() >= 2 && text.starts_with(q) && text.ends_with(q) {
            let inner = &text[1..text.len() - 1];
            return inner.replace(escaped, &q.to_string());
        }
    }
    text.to_string()
}

fn shell_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'|(\S+)"#).ok())
        .as_ref()
}

fn shell_tokens(line: &str) -> Vec<String> {
    let mut out: Vec<String> = match shell_regex() {
        Some(re) => re
            .captures_iter(line)
            .map(|cap| {
                if let Some(m) = cap.get(1) {
                    m.as_str().replace("\\\"", "\"")
                } else if let Some(m) = cap.get(2) {
                    m.as_str().replace("\\'", "'")
                } else {
                    cap.get(3).map(|m| m.as_str().to_string()).unwrap_or_default()
                }
            })
            .collect(),
        None => line.split_whitespace().map(str::to_string).collect(),
    };
    if let Some(i) = out.iter().position(|t| t == "--") {
        let tail = out.split_off(i + 1).join(" ");
        out.truncate(i);
        out.push(tail);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(line: &str) -> Vec<String> {
        parse_command_line(line)
    }

    #[test]
    fn test_show_tables_flag() {
        assert_eq!(toks("show tables -a"), vec!["show", "tables", "-a"]);
    }

    #[test]
    fn test_sql_quoted_text_with_escapes() {
        assert_eq!(
            toks(r"sql 'select * from tt where A=\'a\''"),
            vec!["sql", "--", "select * from tt where A='a'"]
        );
        assert_eq!(
            toks(r#"sql "select * from tt where A=\"a\"""#),
            vec!["sql", "--", r#"select * from tt where A="a""#]
        );
    }

    #[test]
    fn test_sql_unquoted_text_kept_verbatim() {
        assert_eq!(
            toks("sql select * from tt where A='a b'"),
            vec!["sql", "--", "select * from tt where A='a b'"]
        );
    }

    #[test]
    fn test_sql_flags_then_terminator() {
        assert_eq!(
            toks("sql --format xyz --heading -- select * from example"),
            vec!["sql", "--format", "xyz", "--heading", "--", "select * from example"]
        );
    }

    #[test]
    fn test_sql_flags_without_terminator() {
        assert_eq!(
            toks("sql -f csv --no-heading select name from t"),
            vec!["sql", "-f", "csv", "--no-heading", "--", "select name from t"]
        );
    }

    #[test]
    fn test_explain_full() {
        assert_eq!(
            toks("explain --full select * from example"),
            vec!["explain", "--full", "--", "select * from example"]
        );
        assert_eq!(
            toks("explain select * from example"),
            vec!["explain", "--", "select * from example"]
        );
    }

    #[test]
    fn test_sql_terminator_always_three_tokens() {
        for raw in [
            "select 1",
            "select * from t where a = '--'",
            "  spaced   out  ",
            "-f csv",
            "'quoted'",
        ] {
            let line = format!("sql -- {}", raw);
            let t = toks(&line);
            assert_eq!(t.len(), 3, "{:?}", t);
            assert_eq!(t[0], "sql");
            assert_eq!(t[1], "--");
            assert_eq!(t[2], raw.trim());
        }
    }

    #[test]
    fn test_shell_style_quotes() {
        assert_eq!(
            toks(r#"desc "my table" 'x y'"#),
            vec!["desc", "my table", "x y"]
        );
        assert_eq!(toks(r#"show tags "a\"b""#), vec!["show", "tags", "a\"b"]);
    }

    #[test]
    fn test_shell_terminator_joins_rest() {
        assert_eq!(toks("show -- a b c"), vec!["show", "a b c"]);
    }

    #[test]
    fn test_leading_whitespace_before_verb() {
        assert_eq!(
            toks("  \tsql -f csv select 1"),
            vec!["sql", "-f", "csv", "--", "select 1"]
        );
        assert_eq!(toks("\n explain select 1"), vec!["explain", "--", "select 1"]);
    }

    #[test]
    fn test_sql_starting_with_comment() {
        assert_eq!(
            toks("sql -- -- first\nselect 1"),
            vec!["sql", "--", "-- first\nselect 1"]
        );
        assert_eq!(
            toks("sql -f csv -- -- note\nselect 1"),
            vec!["sql", "-f", "csv", "--", "-- note\nselect 1"]
        );
    }

    #[test]
    fn test_verb_only() {
        assert_eq!(toks("sql"), vec!["sql"]);
        assert!(toks("   ").is_empty());
    }
}
