//! Parser and renderer for `netsh interface portproxy show all` output
//!
//! ```text
//! Listen on ipv4:             Connect to ipv4:
//!
//! Address         Port        Address         Port
//! --------------- ----------  --------------- ----------
//! 0.0.0.0         1813        192.168.123.214 1813
//! ```

use portproxy_proto::{Protocol, Rule};
use std::fmt::Write;
use tracing::debug;

/// Parse every rule in the tool's tabular output.
///
/// Section headers select the protocol of the rows that follow. Rows are
/// only read after a separator line, and only rows of exactly four fields
/// with valid ports are kept.
pub fn parse_show_all(output: &str) -> Vec<Rule> {
    let mut rules = Vec::new();
    let mut protocol = Protocol::default();
    let mut in_data = false;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(section) = section_protocol(line) {
            protocol = section;
            in_data = false;
            continue;
        }

        if line.contains("Address") && line.contains("Port") {
            in_data = false;
            continue;
        }

        if line.starts_with("---") {
            in_data = true;
            continue;
        }

        if !in_data {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let [listen_address, listen_port, connect_address, connect_port] = fields[..] else {
            debug!(line, "Skipping row without four fields");
            continue;
        };

        match (listen_port.parse::<u16>(), connect_port.parse::<u16>()) {
            (Ok(listen_port), Ok(connect_port)) => rules.push(Rule::new(
                listen_address,
                listen_port,
                connect_address,
                connect_port,
                protocol,
            )),
            _ => debug!(line, "Skipping row with invalid port"),
        }
    }

    rules
}

fn section_protocol(line: &str) -> Option<Protocol> {
    let lower = line.to_ascii_lowercase();
    let listen = lower.find("listen on ipv")?;
    let connect = lower.find("connect to ipv")?;

    let family = |at: usize, prefix: &str| lower[at + prefix.len()..].starts_with('6');
    Some(Protocol::from_families(
        family(listen, "listen on ipv"),
        family(connect, "connect to ipv"),
    ))
}

/// Render rules the way `show all` prints them, one section per protocol
pub fn render_show_all(rules: &[Rule]) -> String {
    let mut out = String::new();

    for protocol in Protocol::ALL {
        let section: Vec<&Rule> = rules.iter().filter(|r| r.protocol == protocol).collect();
        if section.is_empty() {
            continue;
        }

        let listen = if protocol.listen_is_v6() { "ipv6" } else { "ipv4" };
        let connect = if protocol.connect_is_v6() { "ipv6" } else { "ipv4" };

        let _ = writeln!(out);
        let _ = writeln!(out, "Listen on {}:             Connect to {}:", listen, connect);
        let _ = writeln!(out);
        let _ = writeln!(out, "{:<15} {:<11} {:<15} {}", "Address", "Port", "Address", "Port");
        let _ = writeln!(out, "{} {}  {} {}", "-".repeat(15), "-".repeat(10), "-".repeat(15), "-".repeat(10));
        for rule in section {
            let _ = writeln!(
                out,
                "{:<15} {:<11} {:<15} {}",
                rule.listen_address, rule.listen_port, rule.connect_address, rule.connect_port
            );
        }
    }

    out
}
