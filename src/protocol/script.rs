//! Poll script parser
//!
//! One command per line; blank lines and `#` comments are skipped.
//!
//! ```text
//! XMIT "text with \r escapes and $VAR substitutions"
//! WAIT  <seconds> [, "pattern1" ["pattern2" ...]]
//! WAITR <seconds> [, "pattern" ...]     # no match is an error
//! WAITX <seconds> [, "pattern" ...]     # a match is an error
//! LOOPWAIT <maxIterations>
//! ENDLOOP
//! CAPTURE [true|false]
//! STARTFORMAT "date pattern"
//! FLUSH
//! DATASIM
//! ```
//!
//! Strings are kept as written; escapes and variables are resolved when the
//! command runs.

use crate::constants::MAX_WAIT_SECS;
use crate::error::{PollError, Result};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// How a WAIT treats its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Outcome only matters to an enclosing loop
    Plain,
    /// `WAITR`: timing out is an error
    Required,
    /// `WAITX`: matching is an error
    Exclude,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Xmit(String),
    Wait {
        timeout: Duration,
        kind: WaitKind,
        patterns: Vec<String>,
    },
    LoopWait {
        max: u32,
    },
    /// Indexes of the loop's `LOOPWAIT` and of the last `WAIT` inside it
    EndLoop {
        loop_index: usize,
        wait_index: usize,
    },
    Capture(bool),
    StartFormat(String),
    Flush,
    DataSim,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xmit(s) => write!(f, "XMIT \"{}\"", s),
            Self::Wait {
                timeout,
                kind,
                patterns,
            } => {
                let kw = match kind {
                    WaitKind::Plain => "WAIT",
                    WaitKind::Required => "WAITR",
                    WaitKind::Exclude => "WAITX",
                };
                write!(f, "{} {}", kw, timeout.as_secs_f64())?;
                if !patterns.is_empty() {
                    let quoted: Vec<String> =
                        patterns.iter().map(|p| format!("\"{}\"", p)).collect();
                    write!(f, ", {}", quoted.join(" "))?;
                }
                Ok(())
            }
            Self::LoopWait { max } => write!(f, "LOOPWAIT {}", max),
            Self::EndLoop {
                loop_index,
                wait_index,
            } => write!(f, "ENDLOOP (loop #{}, wait #{})", loop_index, wait_index),
            Self::Capture(on) => write!(f, "CAPTURE {}", on),
            Self::StartFormat(s) => write!(f, "STARTFORMAT \"{}\"", s),
            Self::Flush => f.write_str("FLUSH"),
            Self::DataSim => f.write_str("DATASIM"),
        }
    }
}

/// A command and the script line it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptLine {
    pub line_no: usize,
    pub command: Command,
}

/// Parsed, immutable script
#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub lines: Vec<ScriptLine>,
}

impl Script {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Read and parse a script file
pub fn load(path: &Path) -> Result<Script> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        PollError::login(format!("cannot read poll script '{}': {}", path.display(), e))
    })?;
    parse(&path.display().to_string(), &text)
}

/// Parse script text; `name` is used in error messages
pub fn parse(name: &str, text: &str) -> Result<Script> {
    let mut lines = Vec::new();
    let mut open_loop: Option<usize> = None;
    let mut last_wait: Option<usize> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let err = |msg: String| PollError::login(format!("script '{}':{}: {}", name, line_no, msg));

        let mut tokens = line
            .split(|c: char| c == ' ' || c == ',' || c == '\t')
            .filter(|t| !t.is_empty());
        let keyword = tokens.next().unwrap_or_default().to_ascii_lowercase();
        let index = lines.len();

        let command = match keyword.as_str() {
            "xmit" => Command::Xmit(
                outer_quoted(line).ok_or_else(|| err("XMIT requires a string in double quotes".into()))?,
            ),
            "startformat" => Command::StartFormat(
                outer_quoted(line)
                    .ok_or_else(|| err("STARTFORMAT requires a format in double quotes".into()))?,
            ),
            "capture" => Command::Capture(tokens.next().map(parse_bool).unwrap_or(true)),
            "wait" | "waitr" | "waitx" => {
                let secs = tokens
                    .next()
                    .ok_or_else(|| err(format!("expected number of seconds after {}", keyword)))?;
                let secs: f64 = secs
                    .parse()
                    .ok()
                    .filter(|s: &f64| (0.0..=MAX_WAIT_SECS).contains(s))
                    .ok_or_else(|| err(format!("invalid number of seconds '{}'", secs)))?;
                let kind = match keyword.as_str() {
                    "waitr" => WaitKind::Required,
                    "waitx" => WaitKind::Exclude,
                    _ => WaitKind::Plain,
                };
                if open_loop.is_some() {
                    last_wait = Some(index);
                }
                Command::Wait {
                    timeout: Duration::from_secs_f64(secs),
                    kind,
                    patterns: match line.find(',') {
                        Some(comma) => quoted_strings(&line[comma..]),
                        None => Vec::new(),
                    },
                }
            }
            "loopwait" => {
                if open_loop.is_some() {
                    return Err(err("nested LOOPWAIT".into()));
                }
                let n = tokens
                    .next()
                    .ok_or_else(|| err("expected number of iterations after LOOPWAIT".into()))?;
                let max: u32 = n
                    .parse()
                    .ok()
                    .filter(|m| *m > 0)
                    .ok_or_else(|| err(format!("invalid number of iterations '{}'", n)))?;
                open_loop = Some(index);
                last_wait = None;
                Command::LoopWait { max }
            }
            "endloop" => {
                let loop_index = open_loop.ok_or_else(|| err("ENDLOOP without prior LOOPWAIT".into()))?;
                let wait_index =
                    last_wait.ok_or_else(|| err("LOOPWAIT ... ENDLOOP must contain a WAIT".into()))?;
                open_loop = None;
                last_wait = None;
                Command::EndLoop {
                    loop_index,
                    wait_index,
                }
            }
            "flush" => Command::Flush,
            "datasim" => Command::DataSim,
            other => return Err(err(format!("unknown command '{}'", other))),
        };
        lines.push(ScriptLine { line_no, command });
    }

    if let Some(idx) = open_loop {
        return Err(PollError::login(format!(
            "script '{}':{}: LOOPWAIT without ENDLOOP",
            name, lines[idx].line_no
        )));
    }
    Ok(Script {
        name: name.to_string(),
        lines,
    })
}

/// Text between the first and the last double quote
fn outer_quoted(line: &str) -> Option<String> {
    let x = line.find('"')?;
    let y = line.rfind('"')?;
    (y > x).then(|| line[x + 1..y].to_string())
}

/// Every double-quoted string; `\"` does not end a string
fn quoted_strings(s: &str) -> Vec<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while let Some(start) = s[i..].find('"').map(|p| p + i) {
        let mut end = start + 1;
        while end < bytes.len() && (bytes[end] != b'"' || bytes[end - 1] == b'\\') {
            end += 1;
        }
        out.push(s[start + 1..end].to_string());
        if end + 1 >= bytes.len() {
            break;
        }
        i = end + 1;
    }
    out
}

fn parse_bool(token: &str) -> bool {
    let t = token.to_ascii_lowercase();
    t.starts_with('t') || t.starts_with('y') || t == "1" || t == "on"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(text: &str) -> Vec<Command> {
        parse("test.poll", text)
            .unwrap()
            .lines
            .into_iter()
            .map(|l| l.command)
            .collect()
    }

    fn parse_error(text: &str) -> String {
        match parse("test.poll", text) {
            Err(e @ PollError::Login { .. }) => e.to_string(),
            other => panic!("expected login error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_full_script() {
        let cmds = commands(
            r#"
# Sutron-style logger
XMIT "\r"
WAIT 2.5, "login:" "LOGIN:"
XMIT "$USERNAME\r"
LOOPWAIT 3
XMIT "\r"
WAIT 1, ">"
ENDLOOP
STARTFORMAT "yyyy/MM/dd HH:mm"
CAPTURE
XMIT "DUMP $START\r"
WAITR 30, "END"
CAPTURE false
FLUSH
WAITX 1, "ERROR"
"#,
        );
        assert_eq!(cmds.len(), 14);
        assert_eq!(cmds[0], Command::Xmit("\\r".into()));
        assert_eq!(
            cmds[1],
            Command::Wait {
                timeout: Duration::from_millis(2500),
                kind: WaitKind::Plain,
                patterns: vec!["login:".into(), "LOGIN:".into()],
            }
        );
        assert_eq!(
            cmds[6],
            Command::EndLoop {
                loop_index: 3,
                wait_index: 5
            }
        );
        assert_eq!(cmds[8], Command::Capture(true));
        assert_eq!(cmds[11], Command::Capture(false));
        assert!(matches!(
            cmds[10],
            Command::Wait {
                kind: WaitKind::Required,
                ..
            }
        ));
        assert!(matches!(
            cmds[13],
            Command::Wait {
                kind: WaitKind::Exclude,
                ..
            }
        ));
    }

    #[test]
    fn test_wait_without_patterns_is_delay() {
        assert_eq!(
            commands("WAIT 3"),
            vec![Command::Wait {
                timeout: Duration::from_secs(3),
                kind: WaitKind::Plain,
                patterns: vec![],
            }]
        );
    }

    #[test]
    fn test_escaped_quote_in_pattern() {
        let cmds = commands(r#"WAIT 1, "say \"hi\"" "x""#);
        match &cmds[0] {
            Command::Wait { patterns, .. } => {
                assert_eq!(patterns, &vec![r#"say \"hi\""#.to_string(), "x".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_errors_carry_file_and_line() {
        let msg = parse_error("XMIT \"ok\"\n\nXMIT missing quotes\n");
        assert!(msg.contains("test.poll':3"), "{}", msg);
        assert!(parse_error("WAIT soon").contains("invalid number of seconds"));
        assert!(parse_error("WAIT 1e20, \"x\"").contains("invalid number of seconds '1e20'"));
        assert!(parse_error("WAITR -1").contains("invalid number of seconds"));
        assert!(parse_error("WAIT NaN").contains("invalid number of seconds"));
        assert!(parse_error("ENDLOOP").contains("without prior LOOPWAIT"));
        assert!(parse_error("LOOPWAIT 2\nXMIT \"x\"\nENDLOOP").contains("must contain a WAIT"));
        assert!(parse_error("LOOPWAIT 2\nWAIT 1, \"x\"").contains("without ENDLOOP"));
        assert!(parse_error("LOOPWAIT 0").contains("invalid number of iterations"));
        assert!(parse_error("DIAL 555").contains("unknown command"));
    }

    #[test]
    fn test_missing_script_is_login_error() {
        assert!(matches!(
            load(Path::new("/nonexistent/x.poll")),
            Err(PollError::Login { .. })
        ));
    }
}
