//! Operator Console
//!
//! Line-oriented commands read from stdin, one per line. Arms are numbered
//! from 1 as the operator sees them.
//!
//! ```text
//! send <arm>                     diff one arm and queue the report
//! set <arm> <attribute> <value>  select a value (or change/random) and enable
//! enable <arm> <attribute>       include the attribute in diffs
//! disable <arm> <attribute>      leave the attribute out of diffs
//! swap                           press the swap pedal
//! auto on|off                    toggle auto-send
//! swap-auto on|off               toggle swap-pedal-auto
//! interval <ms>                  scheduler interval for the next start
//! status                         server, scheduler and arm summary
//! start | stop                   start or stop the server
//! help                           this list
//! quit                           shut down
//! ```

use std::fmt::Write as _;
use std::str::FromStr;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use armbench_core::{arm_label, Bench, BenchConfig, ATTRIBUTES, NUM_ARMS};

/// Help text printed by `help` and on unknown input
pub const HELP: &str = "\
commands:
  send <arm>                     diff one arm and queue the report
  set <arm> <attribute> <value>  select a value (or change/random) and enable
  enable <arm> <attribute>       include the attribute in diffs
  disable <arm> <attribute>      leave the attribute out of diffs
  swap                           press the swap pedal
  auto on|off                    toggle auto-send
  swap-auto on|off               toggle swap-pedal-auto
  interval <ms>                  scheduler interval for the next start
  status                         server, scheduler and arm summary
  start | stop                   start or stop the server
  help                           this list
  quit                           shut down";

/// Errors raised while parsing a console line
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    /// Empty line
    #[error("empty command")]
    Empty,

    /// First word is not a command
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// Wrong arguments for a known command
    #[error("usage: {0}")]
    Usage(&'static str),

    /// Arm number outside 1..=NUM_ARMS
    #[error("arm must be 1..={NUM_ARMS}, got {0:?}")]
    InvalidArm(String),
}

/// One parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `send <arm>` (zero-based arm)
    Send(usize),
    /// `set <arm> <attribute> <value>`
    Set {
        /// Zero-based arm
        arm: usize,
        /// Attribute name
        attribute: String,
        /// Value text, may contain spaces
        value: String,
    },
    /// `enable|disable <arm> <attribute>`
    Enable {
        /// Zero-based arm
        arm: usize,
        /// Attribute name
        attribute: String,
        /// New enabled flag
        enabled: bool,
    },
    /// `swap`
    Swap,
    /// `auto on|off`
    AutoSend(bool),
    /// `swap-auto on|off`
    SwapPedalAuto(bool),
    /// `interval <ms>`
    Interval(String),
    /// `status`
    Status,
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `help`
    Help,
    /// `quit`
    Quit,
}

fn parse_arm(text: Option<&str>, usage: &'static str) -> Result<usize, ConsoleError> {
    let text = text.ok_or(ConsoleError::Usage(usage))?;
    match text.parse::<usize>() {
        Ok(n) if (1..=NUM_ARMS).contains(&n) => Ok(n - 1),
        _ => Err(ConsoleError::InvalidArm(text.to_string())),
    }
}

fn parse_toggle(text: Option<&str>, usage: &'static str) -> Result<bool, ConsoleError> {
    match text.map(str::to_ascii_lowercase).as_deref() {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => Err(ConsoleError::Usage(usage)),
    }
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or(ConsoleError::Empty)?.to_ascii_lowercase();

        let parsed = match command.as_str() {
            "send" => Self::Send(parse_arm(words.next(), "send <arm>")?),
            "set" => {
                const USAGE: &str = "set <arm> <attribute> <value>";
                let arm = parse_arm(words.next(), USAGE)?;
                let attribute = words.next().ok_or(ConsoleError::Usage(USAGE))?.to_string();
                let value = words.collect::<Vec<_>>().join(" ");
                if value.is_empty() {
                    return Err(ConsoleError::Usage(USAGE));
                }
                return Ok(Self::Set {
                    arm,
                    attribute,
                    value,
                });
            }
            "enable" | "disable" => {
                const USAGE: &str = "enable|disable <arm> <attribute>";
                let arm = parse_arm(words.next(), USAGE)?;
                let attribute = words.next().ok_or(ConsoleError::Usage(USAGE))?.to_string();
                Self::Enable {
                    arm,
                    attribute,
                    enabled: command == "enable",
                }
            }
            "swap" => Self::Swap,
            "auto" => Self::AutoSend(parse_toggle(words.next(), "auto on|off")?),
            "swap-auto" => Self::SwapPedalAuto(parse_toggle(words.next(), "swap-auto on|off")?),
            "interval" => Self::Interval(
                words
                    .next()
                    .ok_or(ConsoleError::Usage("interval <ms>"))?
                    .to_string(),
            ),
            "status" => Self::Status,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(ConsoleError::UnknownCommand(other.to_string())),
        };

        if words.next().is_some() {
            return Err(ConsoleError::Usage("unexpected extra arguments"));
        }
        Ok(parsed)
    }
}

/// Whether the console keeps reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next line
    Continue,
    /// Shut down
    Quit,
}

/// Run one command against the bench, returning the reply text
pub async fn execute(
    bench: &Bench,
    config: &BenchConfig,
    command: ConsoleCommand,
) -> Result<(Flow, String)> {
    let reply = match command {
        ConsoleCommand::Send(arm) => match bench.send_arm_state(arm)? {
            Some(report) => format!(
                "{}: queued {} attribute(s)",
                arm_label(arm),
                report.changes.len()
            ),
            None => format!("{}: nothing changed", arm_label(arm)),
        },
        ConsoleCommand::Set {
            arm,
            attribute,
            value,
        } => {
            let selection = bench.set_attribute_selection(arm, &attribute, &value, true)?;
            format!("{}: {attribute} = {selection:?}", arm_label(arm))
        }
        ConsoleCommand::Enable {
            arm,
            attribute,
            enabled,
        } => {
            bench.set_enabled(arm, &attribute, enabled)?;
            let state = if enabled { "enabled" } else { "disabled" };
            format!("{}: {attribute} {state}", arm_label(arm))
        }
        ConsoleCommand::Swap => {
            let (first, second) = bench.swap_pedal()?;
            format!(
                "swap pedal: {} report(s) queued",
                usize::from(first.is_some()) + usize::from(second.is_some())
            )
        }
        ConsoleCommand::AutoSend(true) => {
            let arms = bench.scheduler().start_auto_send()?;
            let labels: Vec<String> = arms.into_iter().map(arm_label).collect();
            format!("auto-send over {}", labels.join(", "))
        }
        ConsoleCommand::AutoSend(false) => {
            bench.scheduler().stop_auto_send().await?;
            "auto-send off".to_string()
        }
        ConsoleCommand::SwapPedalAuto(true) => {
            bench.scheduler().start_swap_pedal_auto()?;
            "swap-pedal-auto on".to_string()
        }
        ConsoleCommand::SwapPedalAuto(false) => {
            bench.scheduler().stop_swap_pedal_auto().await?;
            "swap-pedal-auto off".to_string()
        }
        ConsoleCommand::Interval(text) => {
            let interval = bench.scheduler().set_interval_text(&text);
            format!("interval {} ms", interval.as_millis())
        }
        ConsoleCommand::Status => status_report(bench),
        ConsoleCommand::Start => {
            let addr = bench.start(&config.ip, &config.port).await?;
            format!("listening on {addr}")
        }
        ConsoleCommand::Stop => {
            bench.stop().await?;
            "server stopped".to_string()
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => return Ok((Flow::Quit, "bye".to_string())),
    };
    Ok((Flow::Continue, reply))
}

/// Server, scheduler and per-arm summary
pub fn status_report(bench: &Bench) -> String {
    let mut out = String::new();
    let server = bench.server();
    match server.local_addr() {
        Some(addr) => {
            let peer = server
                .slot()
                .current()
                .map_or_else(|| "none".to_string(), |c| c.peer_addr().to_string());
            let _ = writeln!(out, "server: listening on {addr}, peer {peer}");
        }
        None => out.push_str("server: stopped\n"),
    }
    let scheduler = bench.scheduler();
    let _ = writeln!(
        out,
        "auto-send: {}, swap-pedal-auto: {}, interval: {} ms, queued: {}",
        on_off(scheduler.is_auto_sending()),
        on_off(scheduler.is_swap_pedal_auto()),
        scheduler.interval().as_millis(),
        bench.queue().len()
    );

    for arm in 0..bench.store().arm_count() {
        let Ok(state) = bench.store().snapshot(arm) else {
            continue;
        };
        let enabled: Vec<String> = state
            .iter()
            .filter(|(_, entry)| entry.enabled)
            .map(|(idx, entry)| {
                let attr = &ATTRIBUTES[idx];
                let last = entry
                    .last_emitted
                    .and_then(|i| attr.value_at(i))
                    .unwrap_or("-");
                format!("{attr}={} (last {last})", entry.selection.label(attr))
            })
            .collect();
        let summary = if enabled.is_empty() {
            "no enabled attributes".to_string()
        } else {
            enabled.join(", ")
        };
        let _ = writeln!(out, "{}: {summary}", arm_label(arm));
    }
    out.trim_end().to_string()
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Read commands from stdin until `quit` or end of input
pub async fn run(bench: &Bench, config: &BenchConfig) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    while let Some(line) = lines.next_line().await? {
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(ConsoleError::Empty) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        debug!(command = ?command, "Console command");

        match execute(bench, config, command).await {
            Ok((Flow::Quit, reply)) => {
                println!("{reply}");
                break;
            }
            Ok((Flow::Continue, reply)) => println!("{reply}"),
            Err(e) => {
                warn!(error = %e, "Console command failed");
                println!("error: {e}");
            }
        }
    }
    Ok(())
}
