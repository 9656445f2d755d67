//! Script interpreter
//!
//! `login` loads and parses the logger type's script. `get_data` starts a
//! `StreamReader` on the port's input, runs the commands in order and builds
//! the message from the captured bytes. Commands are plain data; the loop
//! counters and last WAIT outcomes live in the per-run context.

use super::expand::{expand_vars, format_java_date, unescape};
use super::script::{self, Command, Script, WaitKind};
use super::{LoggerProtocol, RetrievedMessage};
use crate::error::{PollError, Result};
use crate::port::IoPort;
use crate::reader::{PatternMatcher, StreamEnd, StreamReader};
use crate::station::StationTarget;
use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Timelike, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub struct PollScriptProtocol {
    script_path: PathBuf,
    lines_per_hour: Option<u32>,
    shutdown: Arc<AtomicBool>,
    script: Option<Script>,
    /// Substitution variables, keys upper-cased
    vars: HashMap<String, String>,
    reader: Option<StreamReader>,
}

/// Mutable state of one script run
#[derive(Default)]
struct RunContext {
    /// Completed iterations per LOOPWAIT index
    loop_counts: HashMap<usize, u32>,
    /// Outcome of the most recent execution of each WAIT index
    wait_matched: HashMap<usize, bool>,
}

impl PollScriptProtocol {
    pub fn new(script_path: impl Into<PathBuf>, lines_per_hour: Option<u32>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            script_path: script_path.into(),
            lines_per_hour,
            shutdown,
            script: None,
            vars: HashMap::new(),
            reader: None,
        }
    }

    fn set_var(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.to_ascii_uppercase(), value.into());
    }

    fn expand(&self, text: &str) -> Vec<u8> {
        unescape(&expand_vars(text, |name| {
            self.vars.get(&name.to_ascii_uppercase()).cloned()
        }))
    }

    /// Session variables from the station descriptor
    fn load_vars(&mut self, target: &StationTarget) {
        self.vars.clear();
        let props: Vec<(String, String)> = target
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in props {
            self.set_var(&k, v);
        }
        if !self.vars.contains_key("SITENAME") {
            self.set_var("SITENAME", target.name.clone());
        }
        self.set_var("MEDIUMID", target.medium_id.clone());
        if let Some(user) = target.username.as_deref().filter(|u| !u.trim().is_empty()) {
            self.set_var("USERNAME", user);
        }
        if let Some(pass) = target.password.as_deref().filter(|p| !p.trim().is_empty()) {
            self.set_var("PASSWORD", pass);
        }
    }

    /// Values that depend on the retrieval window
    fn load_window_vars(&mut self, since: DateTime<Utc>, now: DateTime<Utc>) {
        let minutes = (now - since).num_minutes().max(0);
        let hours = ((minutes + 59) / 60).max(1);
        self.set_var("HOURS", hours.to_string());
        if let Some(lph) = self.lines_per_hour {
            self.set_var("LINES", (hours * i64::from(lph)).to_string());
        }
    }

    async fn run(
        &mut self,
        script: &Script,
        port: &mut IoPort,
        reader: &StreamReader,
        target: &StationTarget,
        since: DateTime<Utc>,
    ) -> Result<()> {
        let mut ctx = RunContext::default();
        let mut pc = 0;

        while pc < script.lines.len() {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(PollError::protocol("shutdown requested"));
            }
            check_stream(reader)?;

            let line = &script.lines[pc];
            let at = |msg: String| {
                PollError::protocol(format!("{}:{}: {}", script.name, line.line_no, msg))
            };
            trace!(station = %target.name, "{}: {}", line.line_no, line.command);

            match &line.command {
                Command::Xmit(text) => {
                    let data = self.expand(text);
                    port.write_all(&data)
                        .await
                        .map_err(|e| at(format!("write to station failed: {}", e)))?;
                }
                Command::Wait {
                    timeout,
                    kind,
                    patterns,
                } => {
                    let mut matchers: Vec<PatternMatcher> = patterns
                        .iter()
                        .map(|p| PatternMatcher::new(self.expand(p)))
                        .collect();
                    let matched = reader.wait(*timeout, &mut matchers).await;
                    ctx.wait_matched.insert(pc, matched);

                    if !matched {
                        check_stream(reader)?;
                    }
                    match kind {
                        WaitKind::Required if !matched => {
                            return Err(at(format!(
                                "no match for {:?} within {}s",
                                patterns,
                                timeout.as_secs_f64()
                            )))
                        }
                        WaitKind::Exclude if matched && !patterns.is_empty() => {
                            return Err(at(format!("station sent excluded {:?}", patterns)))
                        }
                        _ => {}
                    }
                }
                Command::LoopWait { .. } => {
                    ctx.loop_counts.insert(pc, 0);
                }
                Command::EndLoop {
                    loop_index,
                    wait_index,
                } => {
                    if !ctx.wait_matched.get(wait_index).copied().unwrap_or(false) {
                        let max = match script.lines[*loop_index].command {
                            Command::LoopWait { max } => max,
                            _ => return Err(at("ENDLOOP does not close a LOOPWAIT".into())),
                        };
                        let count = ctx.loop_counts.entry(*loop_index).or_insert(0);
                        *count += 1;
                        if *count >= max {
                            return Err(at(format!("no match after {} loop iterations", max)));
                        }
                        debug!(station = %target.name, "loop iteration {}/{}", *count + 1, max);
                        pc = loop_index + 1;
                        continue;
                    }
                }
                Command::Capture(on) => reader.set_capture(*on),
                Command::StartFormat(fmt) => {
                    let start = format_java_date(fmt, &target.local_time(since));
                    self.set_var("START", start);
                }
                Command::Flush => reader.flush(),
                Command::DataSim => {
                    reader.inject_captured(&simulated_data(target, since, Utc::now()));
                }
            }
            pc += 1;
        }
        Ok(())
    }
}

fn check_stream(reader: &StreamReader) -> Result<()> {
    match reader.end() {
        None => Ok(()),
        Some(StreamEnd::Closed) => Err(PollError::protocol("input stream from station closed")),
        Some(StreamEnd::Error(e)) => Err(PollError::protocol(format!("input error: {}", e))),
        Some(StreamEnd::Overflow) => Err(PollError::protocol("session data exceeded buffer limit")),
    }
}

/// One line per hour from `since` to `now`, in station time
fn simulated_data(target: &StationTarget, since: DateTime<Utc>, now: DateTime<Utc>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut t = since
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(since);
    let mut n = 0u32;
    while t <= now {
        let local = target.local_time(t);
        out.extend_from_slice(
            format!("{},{},{:.2}\r\n", local.format("%Y/%m/%d %H:%M:%S"), target.name, 10.0 + f64::from(n % 24) * 0.25).as_bytes(),
        );
        t += TimeDelta::hours(1);
        n += 1;
    }
    out
}

#[async_trait]
impl LoggerProtocol for PollScriptProtocol {
    async fn login(&mut self, _port: &mut IoPort, target: &StationTarget) -> Result<()> {
        let script = script::load(&self.script_path)?;
        debug!(
            station = %target.name,
            "loaded script {} ({} commands)",
            self.script_path.display(),
            script.len()
        );
        self.script = Some(script);
        self.load_vars(target);
        Ok(())
    }

    async fn get_data(
        &mut self,
        port: &mut IoPort,
        target: &StationTarget,
        since: DateTime<Utc>,
    ) -> Result<RetrievedMessage> {
        let script = self
            .script
            .take()
            .ok_or_else(|| PollError::protocol("get_data before login"))?;
        let input = port
            .take_input()
            .ok_or_else(|| PollError::protocol("port has no input stream"))?;

        let session_start = Utc::now();
        self.load_window_vars(since, session_start);
        let reader = StreamReader::spawn(input, port.port_name(), port.session_log().cloned());

        let result = self.run(&script, port, &reader, target, since).await;
        let captured = reader.captured_data();
        self.reader = Some(reader);
        self.script = Some(script);
        result?;

        let session_end = Utc::now();
        debug!(
            station = %target.name,
            "script complete, {} bytes captured", captured.len()
        );
        Ok(RetrievedMessage::assemble(target, session_start, session_end, &captured))
    }

    async fn goodbye(&mut self, _port: &mut IoPort, _target: &StationTarget) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self, port: &mut IoPort) {
        if let Some(reader) = self.reader.take() {
            if let Some(input) = reader.join().await {
                port.restore_input(input);
            }
        }
    }
}
