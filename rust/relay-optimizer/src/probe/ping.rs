//! ICMP echo through the platform `ping` tool
//!
//! Runs unprivileged (datagram ICMP sockets), numeric output, a fixed count of
//! fixed-size requests and a per-run deadline. The summary lines are parsed;
//! `ping` exits non-zero on loss, so the exit status is not trusted.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::route::millis_to_duration;
use super::{PingStats, ProbeError};
use crate::config::NetTestConfig;

/// Invocation settings of the ping tool
#[derive(Debug, Clone)]
pub struct PingCommand {
    program: String,
    count: u32,
    payload_size: u32,
    deadline: Duration,
}

impl PingCommand {
    pub fn from_config(config: &NetTestConfig) -> Self {
        Self {
            program: config.ping_command.clone(),
            count: config.ping_count,
            payload_size: config.ping_payload_size,
            deadline: config.ping_deadline(),
        }
    }

    fn args(&self, address: &str) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-c".to_string(),
            self.count.to_string(),
            "-s".to_string(),
            self.payload_size.to_string(),
            "-w".to_string(),
            self.deadline.as_secs().max(1).to_string(),
            address.to_string(),
        ]
    }

    pub async fn run(&self, address: &str) -> Result<PingStats, ProbeError> {
        let args = self.args(address);
        debug!("running {} {}", self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Grace period on top of the tool's own deadline
        let limit = self.deadline + Duration::from_secs(5);
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::Timeout(limit))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_output(&stdout)
    }
}

/// Parse the summary of a `ping` run (iputils and busybox formats)
///
/// ```text
/// 5 packets transmitted, 5 received, 0% packet loss, time 4005ms
/// rtt min/avg/max/mdev = 10.216/11.480/12.907/0.912 ms
/// ```
pub fn parse_ping_output(output: &str) -> Result<PingStats, ProbeError> {
    let loss = output
        .lines()
        .find(|line| line.contains("packet loss"))
        .and_then(parse_loss_line)
        .ok_or_else(|| ProbeError::Parse {
            tool: "ping",
            reason: "no packet loss summary".to_string(),
        })?;

    let avg_rtt = output
        .lines()
        .find(|line| {
            let line = line.trim_start();
            line.starts_with("rtt") || line.starts_with("round-trip")
        })
        .and_then(parse_rtt_line);

    let avg_rtt = match avg_rtt {
        Some(avg) => avg,
        // No replies means no rtt line
        None if loss >= 100.0 => Duration::ZERO,
        None => {
            return Err(ProbeError::Parse {
                tool: "ping",
                reason: "no round-trip summary".to_string(),
            })
        }
    };

    Ok(PingStats {
        avg_rtt,
        packet_loss: loss,
    })
}

fn parse_loss_line(line: &str) -> Option<f64> {
    line.split(',')
        .map(str::trim)
        .find(|part| part.ends_with("packet loss"))
        .and_then(|part| part.split_whitespace().next())
        .and_then(|pct| pct.trim_end_matches('%').parse::<f64>().ok())
}

fn parse_rtt_line(line: &str) -> Option<Duration> {
    let (_, values) = line.split_once('=')?;
    let avg_ms = values.trim().split('/').nth(1)?.trim().parse::<f64>().ok()?;
    Some(millis_to_duration(avg_ms))
}
