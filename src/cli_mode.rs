//! Interactive and one-shot command modes
//!
//! Commands are routed through the cluster client, so keys land on their
//! owning node no matter which seed the prompt was started against.

use std::io::{self, BufRead, Write};

use serde_json::{json, Map, Number, Value};

use valkey_cluster_client::client::ConnectionPool;
use valkey_cluster_client::cluster::SlotMap;
use valkey_cluster_client::config::OutputFormat;
use valkey_cluster_client::{ClusterClient, Command, RespValue};

/// Run one command from the trailing arguments and print the reply
pub fn run_command<P: ConnectionPool>(
    client: &ClusterClient<P>,
    command_args: &[String],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let reply = client.execute(&Command::from_args(command_args))?;
    print_response(&reply, format);
    Ok(())
}

/// Run the Read-Eval-Print Loop
pub fn run_repl<P: ConnectionPool>(
    client: &ClusterClient<P>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let prompt = client
        .topology()
        .seeds()
        .first()
        .map(|seed| seed.to_string())
        .unwrap_or_else(|| "cluster".to_string());
    eprintln!("Type 'help' for available commands, 'quit' or Ctrl-D to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("{}> ", prompt);
        stdout.flush()?;

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                // EOF (Ctrl-D)
                println!();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                continue;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.to_lowercase().as_str() {
            "quit" | "exit" => break,
            "help" => {
                print_help();
                continue;
            }
            "clear" => {
                print!("\x1b[2J\x1b[H");
                stdout.flush()?;
                continue;
            }
            "topology" => {
                print_topology(&client.slot_map(), format);
                continue;
            }
            "refresh" => {
                match client.refresh_topology() {
                    Ok(map) => println!("Topology refreshed, epoch {}", map.epoch()),
                    Err(e) => eprintln!("(error) {}", e),
                }
                continue;
            }
            _ => {}
        }

        let args = parse_command_line(line);
        if args.is_empty() {
            continue;
        }

        match client.execute(&Command::from_args(&args)) {
            Ok(reply) => print_response(&reply, format),
            Err(e) => eprintln!("(error) {}", e),
        }
    }

    Ok(())
}

/// Parse a command line into arguments, handling quotes
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut quoted = false;
    let mut escape_next = false;

    for ch in line.chars() {
        if escape_next {
            current.push(match ch {
                'n' if in_double_quote => '\n',
                't' if in_double_quote => '\t',
                other => other,
            });
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if !in_single_quote => escape_next = true,
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                quoted = true;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                quoted = true;
            }
            ' ' | '\t' if !in_single_quote && !in_double_quote => {
                if !current.is_empty() || quoted {
                    args.push(std::mem::take(&mut current));
                    quoted = false;
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() || quoted {
        args.push(current);
    }

    args
}

pub fn print_response(reply: &RespValue, format: OutputFormat) {
    match format {
        OutputFormat::Text => print!("{}", format_text(reply)),
        OutputFormat::Json => println!("{}", to_json(reply)),
    }
}

/// valkey-cli style rendering, one line per scalar
pub fn format_text(reply: &RespValue) -> String {
    let mut out = String::new();
    write_text(reply, 0, &mut out);
    out
}

fn write_text(reply: &RespValue, indent: usize, out: &mut String) {
    let prefix = "  ".repeat(indent);
    match reply {
        RespValue::Array(items) | RespValue::Set(items) | RespValue::Push(items) => {
            if items.is_empty() {
                out.push_str(&format!("{}(empty array)\n", prefix));
            }
            for (i, item) in items.iter().enumerate() {
                write_item(&format!("{}{})", prefix, i + 1), item, indent, out);
            }
        }
        RespValue::Map(entries) => {
            if entries.is_empty() {
                out.push_str(&format!("{}(empty map)\n", prefix));
            }
            for (i, (key, value)) in entries.iter().enumerate() {
                let label = format!("{}{}# {} =>", prefix, i + 1, scalar_text(key));
                write_item(&label, value, indent, out);
            }
        }
        RespValue::Attribute { value, .. } => write_text(value, indent, out),
        RespValue::BulkString(data) | RespValue::Verbatim { data, .. }
            if indent == 0 && is_multiline(data) =>
        {
            // INFO-style payloads print as-is
            for line in String::from_utf8_lossy(data).lines() {
                out.push_str(line);
                out.push('\n');
            }
        }
        scalar => {
            out.push_str(&prefix);
            out.push_str(&scalar_text(scalar));
            out.push('\n');
        }
    }
}

fn write_item(label: &str, item: &RespValue, indent: usize, out: &mut String) {
    match item.clone().into_inner() {
        nested @ (RespValue::Array(_)
        | RespValue::Set(_)
        | RespValue::Push(_)
        | RespValue::Map(_)) => {
            out.push_str(label);
            out.push('\n');
            write_text(&nested, indent + 1, out);
        }
        scalar => {
            out.push_str(label);
            out.push(' ');
            out.push_str(&scalar_text(&scalar));
            out.push('\n');
        }
    }
}

fn is_multiline(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok_and(|s| s.contains('\n'))
}

fn scalar_text(reply: &RespValue) -> String {
    match reply {
        RespValue::Null => "(nil)".to_string(),
        RespValue::SimpleString(s) => s.clone(),
        RespValue::Error(e) => format!("(error) {}", e),
        RespValue::Integer(n) => format!("(integer) {}", n),
        RespValue::Double(d) => format!("(double) {}", d),
        RespValue::Boolean(b) => format!("({})", b),
        RespValue::BigNumber(n) => format!("(big number) {}", n),
        RespValue::BulkString(data) | RespValue::Verbatim { data, .. } => {
            match std::str::from_utf8(data) {
                Ok(s) => format!("\"{}\"", s),
                Err(_) => format!("(binary) {} bytes", data.len()),
            }
        }
        RespValue::Attribute { value, .. } => scalar_text(value),
        RespValue::Array(_) | RespValue::Set(_) | RespValue::Push(_) | RespValue::Map(_) => {
            format!("({})", reply.kind())
        }
    }
}

/// JSON rendering; error replies become `{"error": "..."}`
pub fn to_json(reply: &RespValue) -> Value {
    match reply {
        RespValue::Null => Value::Null,
        RespValue::SimpleString(s) | RespValue::BigNumber(s) => Value::String(s.clone()),
        RespValue::BulkString(data) | RespValue::Verbatim { data, .. } => {
            Value::String(String::from_utf8_lossy(data).into_owned())
        }
        RespValue::Error(e) => json!({ "error": e.to_string() }),
        RespValue::Integer(n) => Value::Number((*n).into()),
        RespValue::Double(d) => Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(d.to_string())),
        RespValue::Boolean(b) => Value::Bool(*b),
        RespValue::Array(items) | RespValue::Set(items) | RespValue::Push(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        RespValue::Map(entries) => {
            let mut object = Map::new();
            for (key, value) in entries {
                let key = match key.as_str() {
                    Some(s) => s.to_string(),
                    None => to_json(key).to_string(),
                };
                object.insert(key, to_json(value));
            }
            Value::Object(object)
        }
        RespValue::Attribute { value, .. } => to_json(value),
    }
}

/// Slot ranges with their primary and replicas
pub fn format_topology(map: &SlotMap) -> String {
    let mut out = format!(
        "epoch {}, {} nodes, coverage {:?}\n",
        map.epoch(),
        map.nodes().len(),
        map.coverage()
    );
    for (start, end, node) in map.slot_ranges() {
        let replicas: Vec<String> = map
            .replicas_for_slot(start)
            .iter()
            .map(|r| r.address.to_string())
            .collect();
        out.push_str(&format!("{:>5}-{:<5} {}", start, end, node.address));
        if !replicas.is_empty() {
            out.push_str(&format!(" replicas: {}", replicas.join(", ")));
        }
        out.push('\n');
    }
    out
}

pub fn topology_json(map: &SlotMap) -> Value {
    let ranges: Vec<Value> = map
        .slot_ranges()
        .into_iter()
        .map(|(start, end, node)| {
            let replicas: Vec<String> = map
                .replicas_for_slot(start)
                .iter()
                .map(|r| r.address.to_string())
                .collect();
            json!({
                "start": start,
                "end": end,
                "primary": node.address.to_string(),
                "id": node.id,
                "replicas": replicas,
            })
        })
        .collect();
    json!({
        "epoch": map.epoch(),
        "nodes": map.nodes().len(),
        "slots": ranges,
    })
}

pub fn print_topology(map: &SlotMap, format: OutputFormat) {
    match format {
        OutputFormat::Text => print!("{}", format_topology(map)),
        OutputFormat::Json => println!("{}", topology_json(map)),
    }
}

fn print_help() {
    println!(
        r#"
valkey-cluster-cli
==================

Type any Valkey/Redis command. Keyed commands are sent to the node that
owns the key's slot; MOVED and ASK redirects are followed.

Built-in commands:
  help       Show this help message
  topology   Show the current slot map
  refresh    Re-fetch CLUSTER NODES
  clear      Clear the screen
  quit       Exit the CLI (or use Ctrl-D)
  exit       Exit the CLI

Tip: Use quotes for values with spaces: SET key "hello world"
     Use hash tags to keep keys together: MSET {{user}}:a 1 {{user}}:b 2
"#
    );
}
