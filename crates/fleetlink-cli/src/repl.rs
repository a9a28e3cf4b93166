//! REPL – Read-Eval-Print Loop for the fleetlink operator console.
//!
//! Supported slash-commands:
//!   /order <device> <template> [key=value ...]   – dispatch a templated order
//!   /instant <device> <actionType> [key=value ...] – send one instant action
//!   /factsheet <device>                          – request a factsheet
//!   /init <device> <x> <y> <theta> <map>         – initialise the robot pose
//!   /cancel <orderId>                            – cancel an order record
//!   /started | /completed <orderId>              – report order progress
//!   /failed <orderId> [reason]                   – report an order failure
//!   /status <orderId>                            – show one order record
//!   /orders <device> [limit] [offset]            – list a robot's orders
//!   /counts [device]                             – record counts per status
//!   /devices                                     – robots currently online
//!   /templates                                   – loaded order templates
//!   /fail-pending [reason]                       – fail every pending command
//!   /help                                        – show this list
//!   /quit | /exit                                – gracefully exit the CLI
//!
//! Dispatching commands accept `--via <queue|http|stream>` anywhere on the
//! line.  Parameter values are read as JSON and fall back to plain strings.

use colored::Colorize;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fleetlink_runtime::{ExecutionResult, TemplateRepository as _};
use fleetlink_store::OrderRecord;
use fleetlink_types::{
    Action, BlockingType, BridgeError, OrderStatus, Pose, RequestContext, TransportKind,
};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::Bridge;

const DEFAULT_PAGE_SIZE: usize = 20;
const OPERATOR_FAILURE: &str = "failed by operator";
const OPERATOR_FAIL_PENDING: &str = "failed by operator request";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Order {
        device_id: String,
        template_id: String,
        overrides: HashMap<String, Value>,
        transport: Option<TransportKind>,
    },
    Instant {
        device_id: String,
        action_type: String,
        parameters: Vec<(String, Value)>,
        transport: Option<TransportKind>,
    },
    Factsheet {
        device_id: String,
        transport: Option<TransportKind>,
    },
    InitPosition {
        device_id: String,
        pose: Pose,
        transport: Option<TransportKind>,
    },
    Cancel(String),
    Started(String),
    Completed(String),
    Failed {
        order_id: String,
        reason: String,
    },
    Status(String),
    Orders {
        device_id: String,
        limit: usize,
        offset: usize,
    },
    Counts(Option<String>),
    Devices,
    Templates,
    FailPending(String),
    Quit,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(bridge: &Arc<Bridge>, rt: &Handle, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "fleetlink>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(Command::Help) => cmd_help(),
            Ok(command) => execute(bridge, rt, command),
            Err(e) => {
                println!("{} {}. Type {} for available commands.", "✗".red(), e, "/help".bold());
            }
        }
    }
}

/// Parse one console line.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut tokens: Vec<&str> = line.split_whitespace().collect();
    let transport = take_transport(&mut tokens)?;
    let (head, args) = tokens.split_first().ok_or_else(|| "empty command".to_string())?;

    let command = match *head {
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        "/order" => {
            let [device_id, template_id, rest @ ..] = args else {
                return Err(usage("/order <device> <template> [key=value ...]"));
            };
            let overrides = rest
                .iter()
                .map(|t| parse_assignment(t))
                .collect::<Result<HashMap<_, _>, _>>()?;
            return Ok(Command::Order {
                device_id: device_id.to_string(),
                template_id: template_id.to_string(),
                overrides,
                transport,
            });
        }
        "/instant" => {
            let [device_id, action_type, rest @ ..] = args else {
                return Err(usage("/instant <device> <actionType> [key=value ...]"));
            };
            let parameters = rest
                .iter()
                .map(|t| parse_assignment(t))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Command::Instant {
                device_id: device_id.to_string(),
                action_type: action_type.to_string(),
                parameters,
                transport,
            });
        }
        "/factsheet" => {
            let [device_id] = args else {
                return Err(usage("/factsheet <device>"));
            };
            return Ok(Command::Factsheet {
                device_id: device_id.to_string(),
                transport,
            });
        }
        "/init" => {
            let [device_id, x, y, theta, map_id] = args else {
                return Err(usage("/init <device> <x> <y> <theta> <map>"));
            };
            return Ok(Command::InitPosition {
                device_id: device_id.to_string(),
                pose: Pose {
                    x: parse_number("x", x)?,
                    y: parse_number("y", y)?,
                    theta: parse_number("theta", theta)?,
                    map_id: map_id.to_string(),
                    last_node_id: None,
                },
                transport,
            });
        }
        "/cancel" => Command::Cancel(single_id(args, "/cancel <orderId>")?),
        "/started" => Command::Started(single_id(args, "/started <orderId>")?),
        "/completed" => Command::Completed(single_id(args, "/completed <orderId>")?),
        "/failed" => {
            let [order_id, reason @ ..] = args else {
                return Err(usage("/failed <orderId> [reason]"));
            };
            Command::Failed {
                order_id: order_id.to_string(),
                reason: join_or(reason, OPERATOR_FAILURE),
            }
        }
        "/status" => Command::Status(single_id(args, "/status <orderId>")?),
        "/orders" => {
            let (device_id, limit, offset) = match args {
                [d] => (d, DEFAULT_PAGE_SIZE, 0),
                [d, l] => (d, parse_count("limit", l)?, 0),
                [d, l, o] => (d, parse_count("limit", l)?, parse_count("offset", o)?),
                _ => return Err(usage("/orders <device> [limit] [offset]")),
            };
            Command::Orders {
                device_id: device_id.to_string(),
                limit,
                offset,
            }
        }
        "/counts" => match args {
            [] => Command::Counts(None),
            [device_id] => Command::Counts(Some(device_id.to_string())),
            _ => return Err(usage("/counts [device]")),
        },
        "/devices" => Command::Devices,
        "/templates" => Command::Templates,
        "/fail-pending" => Command::FailPending(join_or(args, OPERATOR_FAIL_PENDING)),
        other => return Err(format!("unknown command '{other}'")),
    };

    if transport.is_some() {
        return Err(format!("{head} does not send anything; drop --via"));
    }
    Ok(command)
}

/// Remove `--via <kind>` from `tokens` and parse the kind.
fn take_transport(tokens: &mut Vec<&str>) -> Result<Option<TransportKind>, String> {
    let Some(pos) = tokens.iter().position(|t| *t == "--via") else {
        return Ok(None);
    };
    let Some(raw) = tokens.get(pos + 1).copied() else {
        return Err("--via needs a transport (queue, http or stream)".to_string());
    };
    let kind = raw.parse::<TransportKind>().map_err(|e| e.to_string())?;
    tokens.drain(pos..=pos + 1);
    Ok(Some(kind))
}

/// `key=value`; the value is JSON when it parses as JSON, else a string.
fn parse_assignment(token: &str) -> Result<(String, Value), String> {
    match token.split_once('=') {
        Some((key, raw)) if !key.is_empty() => {
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.to_string(), value))
        }
        _ => Err(format!("expected key=value, got '{token}'")),
    }
}

fn parse_number(name: &str, raw: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .map_err(|_| format!("{name} must be a number, got '{raw}'"))
}

fn parse_count(name: &str, raw: &str) -> Result<usize, String> {
    raw.parse::<usize>()
        .map_err(|_| format!("{name} must be a non-negative integer, got '{raw}'"))
}

fn single_id(args: &[&str], usage_line: &str) -> Result<String, String> {
    match args {
        [id] => Ok(id.to_string()),
        _ => Err(usage(usage_line)),
    }
}

fn join_or(words: &[&str], default: &str) -> String {
    if words.is_empty() {
        default.to_string()
    } else {
        words.join(" ")
    }
}

fn usage(line: &str) -> String {
    format!("usage: {line}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn execute(bridge: &Bridge, rt: &Handle, command: Command) {
    let engine = &bridge.engine;
    let ctx = RequestContext::background();
    match command {
        Command::Order {
            device_id,
            template_id,
            overrides,
            transport,
        } => print_dispatch(rt.block_on(engine.execute_order(
            &ctx,
            &template_id,
            &device_id,
            &overrides,
            transport,
        ))),
        Command::Instant {
            device_id,
            action_type,
            parameters,
            transport,
        } => {
            let action_id = format!("{action_type}-{}", uuid::Uuid::new_v4());
            let action = parameters.into_iter().fold(
                Action::new(&action_type, &action_id, BlockingType::Hard),
                |action, (key, value)| action.with_parameter(key, value),
            );
            let text = format!("{action_type} ({action_id})");
            print_dispatch(rt.block_on(engine.execute_instant_actions(
                &ctx,
                &device_id,
                vec![action],
                &text,
                transport,
            )))
        }
        Command::Factsheet {
            device_id,
            transport,
        } => print_dispatch(rt.block_on(engine.request_factsheet(&ctx, &device_id, transport))),
        Command::InitPosition {
            device_id,
            pose,
            transport,
        } => print_dispatch(rt.block_on(engine.init_position(&ctx, &device_id, pose, transport))),
        Command::Cancel(order_id) => print_record(rt.block_on(engine.cancel_order(&order_id))),
        Command::Started(order_id) => print_record(rt.block_on(engine.mark_started(&order_id))),
        Command::Completed(order_id) => {
            print_record(rt.block_on(engine.mark_completed(&order_id)))
        }
        Command::Failed { order_id, reason } => {
            print_record(rt.block_on(engine.mark_failed(&order_id, &reason)))
        }
        Command::Status(order_id) => print_record(rt.block_on(engine.get_order(&order_id))),
        Command::Orders {
            device_id,
            limit,
            offset,
        } => match rt.block_on(engine.list_orders_by_device(&device_id, limit, offset)) {
            Ok(records) if records.is_empty() => println!("  No orders for {}.", device_id.bold()),
            Ok(records) => records.iter().for_each(print_record_line),
            Err(e) => print_error(&e),
        },
        Command::Counts(device_id) => {
            for status in [
                OrderStatus::Created,
                OrderStatus::Sent,
                OrderStatus::Started,
                OrderStatus::Completed,
                OrderStatus::Failed,
                OrderStatus::Cancelled,
            ] {
                match rt.block_on(engine.count_orders_by_status(status, device_id.as_deref())) {
                    Ok(n) => println!("  {:<10} {}", status.as_str(), n),
                    Err(e) => return print_error(&e),
                }
            }
        }
        Command::Devices => cmd_devices(bridge),
        Command::Templates => {
            let ids = bridge.templates.template_ids();
            if ids.is_empty() {
                println!("  No order templates loaded.");
            }
            for id in ids {
                println!("  • {}", id.bold());
            }
        }
        Command::FailPending(reason) => {
            let failed = rt.block_on(engine.fail_all_pending(&reason));
            println!("  {} {} pending command(s) failed.", "✓".green(), failed.len());
        }
        Command::Help | Command::Quit => {}
    }
}

fn cmd_help() {
    println!();
    println!("{}", "fleetlink Commands".bold().underline());
    println!("  {} – dispatch a templated order", "/order <device> <template> [k=v ...]".bold().cyan());
    println!("  {} – send one instant action", "/instant <device> <actionType> [k=v ...]".bold().cyan());
    println!("  {} – request a factsheet", "/factsheet <device>".bold().cyan());
    println!("  {} – initialise the robot pose", "/init <device> <x> <y> <theta> <map>".bold().cyan());
    println!("  {} – cancel an order record", "/cancel <orderId>".bold().cyan());
    println!("  {} – report order progress", "/started | /completed <orderId>".bold().cyan());
    println!("  {} – report an order failure", "/failed <orderId> [reason]".bold().cyan());
    println!("  {} – show one order record", "/status <orderId>".bold().cyan());
    println!("  {} – list a robot's orders", "/orders <device> [limit] [offset]".bold().cyan());
    println!("  {} – record counts per status", "/counts [device]".bold().cyan());
    println!("  {} – robots currently online", "/devices".bold().cyan());
    println!("  {} – loaded order templates", "/templates".bold().cyan());
    println!("  {} – fail every pending command", "/fail-pending [reason]".bold().cyan());
    println!("  {} – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
    println!("  Dispatching commands accept {}.", "--via <queue|http|stream>".bold());
    println!();
}

fn cmd_devices(bridge: &Bridge) {
    let broker = if bridge.broker_connected() { "connected".green() } else { "disconnected".yellow() };
    println!("  Broker: {broker}");
    let devices = bridge.presence.online_devices();
    if devices.is_empty() {
        println!("  No robots online.");
    }
    for device in devices {
        let seen = bridge
            .presence
            .last_seen(&device)
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!("  • {} {}", device.bold(), seen.dimmed());
    }
}

fn print_dispatch(result: Result<ExecutionResult, BridgeError>) {
    match result {
        Ok(sent) => println!(
            "  {} {} sent to {} via {} (header {})\n    {}",
            "✓".green(),
            sent.order_id.bold(),
            sent.device_id,
            sent.transport,
            sent.header_id,
            sent.destination.dimmed()
        ),
        Err(e) => print_error(&e),
    }
}

fn print_record(result: Result<OrderRecord, BridgeError>) {
    match result {
        Ok(record) => print_record_line(&record),
        Err(e) => print_error(&e),
    }
}

fn print_record_line(record: &OrderRecord) {
    let status = match record.status {
        OrderStatus::Completed => record.status.as_str().green(),
        OrderStatus::Failed | OrderStatus::Cancelled => record.status.as_str().red(),
        _ => record.status.as_str().yellow(),
    };
    println!(
        "  {} {} {} rev {} {}{}",
        record.order_id.bold(),
        record.device_id,
        status,
        record.order_revision,
        record.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        record
            .error_message
            .as_deref()
            .map(|m| format!(" – {m}"))
            .unwrap_or_default()
    );
}

fn print_error(e: &BridgeError) {
    println!("  {} {}", "✗".red(), e);
}
