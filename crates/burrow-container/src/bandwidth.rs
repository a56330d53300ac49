//! Bandwidth limits via the container's traffic-shaping scripts.
//!
//! Limits are applied by `net_rate.sh`; current values are read back by
//! parsing `tc` output from `net.sh get_egress_info` /
//! `get_ingress_info`. Rates are reported in bits and converted to
//! bytes per second; the K/M/G suffixes are powers of 1024.

use crate::ContainerError;
use burrow_schema::types::{BandwidthLimits, BandwidthStat};
use burrow_system::{Cmd, CommandRunner};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;

lazy_static! {
    static ref IN_RATE_PATTERN: Regex = Regex::new(
        r"qdisc tbf [0-9a-f]+: root refcnt \d+ rate (\d+)([KMG]?)bit burst (\d+)([KMG]?)b"
    )
    .unwrap();
    static ref OUT_RATE_PATTERN: Regex =
        Regex::new(r"police 0x[0-9a-f]+ rate (\d+)([KMG]?)bit burst (\d+)([KMG]?)b").unwrap();
}

pub struct BandwidthManager {
    container_path: PathBuf,
    container_id: String,
    runner: Arc<dyn CommandRunner>,
}

impl BandwidthManager {
    pub fn new(
        container_path: PathBuf,
        container_id: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            container_path,
            container_id: container_id.into(),
            runner,
        }
    }

    pub fn set_limits(&self, limits: BandwidthLimits) -> Result<(), ContainerError> {
        let script = self.container_path.join("net_rate.sh");
        let mut cmd = Cmd::new(script.to_string_lossy().into_owned()).env(vec![
            format!("BURST={}", limits.burst_rate_in_bytes_per_second),
            format!("RATE={}", limits.rate_in_bytes_per_second * 8),
        ]);
        self.runner.run(&mut cmd)?;
        Ok(())
    }

    pub fn get_limits(&self) -> Result<BandwidthStat, ContainerError> {
        let mut stat = BandwidthStat::default();

        let egress = self.run_net_script("get_egress_info")?;
        if let Some((rate, burst)) = parse_rate(&IN_RATE_PATTERN, &egress)? {
            stat.in_rate = rate / 8;
            stat.in_burst = burst;
        }

        let ingress = self.run_net_script("get_ingress_info")?;
        if let Some((rate, burst)) = parse_rate(&OUT_RATE_PATTERN, &ingress)? {
            stat.out_rate = rate / 8;
            stat.out_burst = burst;
        }

        Ok(stat)
    }

    fn run_net_script(&self, action: &str) -> Result<String, ContainerError> {
        let script = self.container_path.join("net.sh");
        let mut cmd = Cmd::new(script.to_string_lossy().into_owned())
            .arg(action)
            .env(vec![format!("ID={}", self.container_id)]);
        self.runner.run(&mut cmd)?;
        Ok(cmd.stdout_str())
    }
}

/// Extract (rate, burst) in bytes from `tc` output, `None` when the
/// interface carries no limit.
fn parse_rate(pattern: &Regex, output: &str) -> Result<Option<(u64, u64)>, ContainerError> {
    let captures = match pattern.captures(output) {
        Some(captures) => captures,
        None => return Ok(None),
    };

    let number = |index: usize| -> Result<u64, ContainerError> {
        captures[index]
            .parse()
            .map_err(|_| ContainerError::UnparseableRate(output.to_owned()))
    };

    let rate = convert_units(number(1)?, &captures[2]);
    let burst = convert_units(number(3)?, &captures[4]);
    Ok(Some((rate, burst)))
}

fn convert_units(value: u64, unit: &str) -> u64 {
    match unit {
        "K" => value * 1024,
        "M" => value * 1024u64.pow(2),
        "G" => value * 1024u64.pow(3),
        _ => value,
    }
}
