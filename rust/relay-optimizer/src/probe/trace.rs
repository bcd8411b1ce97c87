//! Hop tracing through the platform `traceroute` tool

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::route::millis_to_duration;
use super::{Hop, HopNode, ProbeError};
use crate::config::NetTestConfig;

/// Invocation settings of the trace tool
#[derive(Debug, Clone)]
pub struct TraceCommand {
    program: String,
    max_hops: u32,
    queries: u32,
    wait: Duration,
}

impl TraceCommand {
    pub fn from_config(config: &NetTestConfig) -> Self {
        Self {
            program: config.trace_command.clone(),
            max_hops: config.trace_max_hops,
            queries: config.trace_queries,
            wait: config.trace_wait(),
        }
    }

    pub async fn run(&self, ip: IpAddr) -> Result<Vec<Hop>, ProbeError> {
        let args = [
            "-n".to_string(),
            "-q".to_string(),
            self.queries.to_string(),
            "-w".to_string(),
            self.wait.as_secs().max(1).to_string(),
            "-m".to_string(),
            self.max_hops.to_string(),
            ip.to_string(),
        ];
        debug!("running {} {}", self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Worst case: every hop waits for every query
        let limit = self.wait * self.queries.max(1) * self.max_hops.max(1) + Duration::from_secs(5);
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::Timeout(limit))??;

        parse_trace_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse numeric `traceroute` output into hops
///
/// ```text
/// traceroute to 1.1.1.1 (1.1.1.1), 30 hops max, 60 byte packets
///  1  192.168.1.1  0.512 ms  0.498 ms  0.470 ms
///  2  * * *
///  3  10.0.0.1  5.120 ms  10.0.0.2  5.310 ms  5.207 ms
/// ```
pub fn parse_trace_output(output: &str) -> Result<Vec<Hop>, ProbeError> {
    let mut hops = Vec::new();

    for line in output.lines() {
        let mut tokens = line.split_whitespace().peekable();
        let distance = match tokens.peek().and_then(|t| t.parse::<u32>().ok()) {
            Some(d) => d,
            // Header and wrapped lines
            None => continue,
        };
        tokens.next();

        let mut nodes: Vec<HopNode> = Vec::new();
        while let Some(token) = tokens.next() {
            if let Ok(addr) = token.parse::<IpAddr>() {
                nodes.push(HopNode { addr, rtts: Vec::new() });
                continue;
            }

            if let Ok(ms) = token.parse::<f64>() {
                if tokens.peek() == Some(&"ms") {
                    tokens.next();
                }
                if let Some(node) = nodes.last_mut() {
                    node.rtts.push(millis_to_duration(ms));
                }
            }
            // "*" and annotations such as "!H" carry no sample
        }

        hops.push(Hop { distance, nodes });
    }

    if hops.is_empty() && !output.trim().is_empty() && !output.contains("traceroute to") {
        return Err(ProbeError::Parse {
            tool: "traceroute",
            reason: "no hop lines".to_string(),
        });
    }

    Ok(hops)
}
