//! Stdout parsers for each predefined command. A parser failure never
//! flips the command's status away from `Success`; callers fall back to
//! `{ "raw_output": <stdout> }`.

use std::collections::HashMap;

use serde_json::{json, Value};

pub type ParseResult = Result<Value, String>;

pub fn parse_uptime(stdout: &str) -> ParseResult {
    // " 10:03:23 up 4 days, 21:12,  2 users,  load average: 0.10, 0.05, 0.01"
    let idx = stdout
        .find("load average:")
        .ok_or_else(|| "no 'load average:' marker".to_string())?;
    let tail = &stdout[idx + "load average:".len()..];
    let parts: Vec<f64> = tail
        .split(',')
        .filter_map(|s| s.trim().parse::<f64>().ok())
        .collect();
    if parts.len() < 3 {
        return Err("expected three load averages".into());
    }
    let uptime_str = stdout
        .split("up")
        .nth(1)
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    Ok(json!({
        "load_avg_1": parts[0],
        "load_avg_5": parts[1],
        "load_avg_15": parts[2],
        "uptime": uptime_str,
    }))
}

pub fn parse_free_b(stdout: &str) -> ParseResult {
    let mut out = serde_json::Map::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let label = match fields.next() {
            Some(l) => l.trim_end_matches(':'),
            None => continue,
        };
        let nums: Vec<f64> = fields.filter_map(|f| f.parse::<f64>().ok()).collect();
        if label == "Mem" && nums.len() >= 6 {
            out.insert("mem_total".into(), json!(nums[0]));
            out.insert("mem_used".into(), json!(nums[1]));
            out.insert("mem_free".into(), json!(nums[2]));
            out.insert("mem_available".into(), json!(nums[5]));
        } else if label == "Swap" && nums.len() >= 3 {
            out.insert("swap_total".into(), json!(nums[0]));
            out.insert("swap_used".into(), json!(nums[1]));
            out.insert("swap_free".into(), json!(nums[2]));
        }
    }
    if out.is_empty() {
        return Err("no Mem/Swap lines found".into());
    }
    Ok(Value::Object(out))
}

pub fn parse_meminfo(stdout: &str) -> ParseResult {
    let mut out = HashMap::new();
    for line in stdout.lines() {
        let mut parts = line.splitn(2, ':');
        let key = match parts.next() {
            Some(k) => k.trim(),
            None => continue,
        };
        let rest = match parts.next() {
            Some(r) => r.trim(),
            None => continue,
        };
        let kb: f64 = match rest.split_whitespace().next().and_then(|n| n.parse().ok()) {
            Some(v) => v,
            None => continue,
        };
        out.insert(key.to_string(), kb * 1024.0);
    }
    if out.is_empty() {
        Err("empty /proc/meminfo".into())
    } else {
        Ok(json!(out))
    }
}

/// Fields of the aggregate `cpu` line in `/proc/stat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuStatSnapshot {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuStatSnapshot {
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }
}

pub fn parse_proc_stat_cpu(stdout: &str) -> Result<CpuStatSnapshot, String> {
    let line = stdout
        .lines()
        .find(|l| l.trim_start().starts_with("cpu "))
        .ok_or_else(|| "no aggregate 'cpu' line".to_string())?;
    let nums: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse::<u64>().ok())
        .collect();
    if nums.len() < 8 {
        return Err("expected at least 8 cpu fields".into());
    }
    Ok(CpuStatSnapshot {
        user: nums[0],
        nice: nums[1],
        system: nums[2],
        idle: nums[3],
        iowait: nums[4],
        irq: nums[5],
        softirq: nums[6],
        steal: nums[7],
    })
}

#[derive(Debug, Clone)]
pub struct FilesystemUsage {
    pub device: String,
    pub mount_point: String,
    pub total_bytes: f64,
    pub used_bytes: f64,
    pub available_bytes: f64,
}

pub fn parse_df_b1(stdout: &str) -> Result<Vec<FilesystemUsage>, String> {
    let mut out = Vec::new();
    for line in stdout.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let device = fields[0];
        if !device.starts_with("/dev/") {
            continue;
        }
        let (total, used, available) = match (
            fields[1].parse::<f64>(),
            fields[2].parse::<f64>(),
            fields[3].parse::<f64>(),
        ) {
            (Ok(t), Ok(u), Ok(a)) => (t, u, a),
            _ => continue,
        };
        out.push(FilesystemUsage {
            device: device.to_string(),
            mount_point: fields[5].to_string(),
            total_bytes: total,
            used_bytes: used,
            available_bytes: available,
        });
    }
    if out.is_empty() {
        Err("no /dev/* filesystems found".into())
    } else {
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiskStatSnapshot {
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
    pub io_time_ms: u64,
}

pub fn parse_proc_diskstats(stdout: &str) -> Result<HashMap<String, DiskStatSnapshot>, String> {
    let mut out = HashMap::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            continue;
        }
        let device = fields[2];
        if device.chars().last().map_or(false, |c| c.is_ascii_digit()) && device.starts_with("loop") {
            continue;
        }
        let parse = |i: usize| fields.get(i).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
        out.insert(
            device.to_string(),
            DiskStatSnapshot {
                reads_completed: parse(3),
                sectors_read: parse(5),
                writes_completed: parse(7),
                sectors_written: parse(9),
                io_time_ms: parse(12),
            },
        );
    }
    if out.is_empty() {
        Err("no disk devices found in /proc/diskstats".into())
    } else {
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetDevSnapshot {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

pub fn parse_proc_net_dev(stdout: &str) -> Result<HashMap<String, NetDevSnapshot>, String> {
    let mut out = HashMap::new();
    for line in stdout.lines().skip(2) {
        let mut parts = line.splitn(2, ':');
        let iface = match parts.next() {
            Some(i) => i.trim(),
            None => continue,
        };
        let rest = match parts.next() {
            Some(r) => r,
            None => continue,
        };
        let fields: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|f| f.parse::<u64>().ok())
            .collect();
        if fields.len() < 16 {
            continue;
        }
        out.insert(
            iface.to_string(),
            NetDevSnapshot {
                rx_bytes: fields[0],
                rx_packets: fields[1],
                rx_errors: fields[2],
                rx_dropped: fields[3],
                tx_bytes: fields[8],
                tx_packets: fields[9],
                tx_errors: fields[10],
                tx_dropped: fields[11],
            },
        );
    }
    if out.is_empty() {
        Err("no interfaces found in /proc/net/dev".into())
    } else {
        Ok(out)
    }
}

pub fn parse_lscpu(stdout: &str) -> ParseResult {
    let mut out = serde_json::Map::new();
    for line in stdout.lines() {
        let mut parts = line.splitn(2, ':');
        let key = match parts.next() {
            Some(k) => k.trim(),
            None => continue,
        };
        let value = match parts.next() {
            Some(v) => v.trim(),
            None => continue,
        };
        match key {
            "CPU(s)" => {
                if let Ok(n) = value.parse::<u32>() {
                    out.insert("cores".into(), json!(n));
                }
            }
            "Model name" => {
                out.insert("model_name".into(), json!(value));
            }
            "Architecture" => {
                out.insert("architecture".into(), json!(value));
            }
            "CPU max MHz" => {
                if let Ok(f) = value.parse::<f64>() {
                    out.insert("max_mhz".into(), json!(f));
                }
            }
            _ => {}
        }
    }
    if out.is_empty() {
        Err("no recognized lscpu fields".into())
    } else {
        Ok(Value::Object(out))
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceAddr {
    pub family: String,
    pub address: String,
    pub scope: String,
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub state: String,
    pub mtu: Option<u32>,
    pub addrs: Vec<InterfaceAddr>,
}

pub fn parse_ip_addr(stdout: &str) -> Result<Vec<InterfaceInfo>, String> {
    let mut out = Vec::new();
    let mut current: Option<InterfaceInfo> = None;
    for line in stdout.lines() {
        if !line.starts_with(' ') {
            if let Some(iface) = current.take() {
                out.push(iface);
            }
            let mut parts = line.splitn(3, ':');
            let _idx = parts.next();
            let name = parts.next().unwrap_or("").trim().to_string();
            if name.is_empty() {
                continue;
            }
            let state = if line.contains("state UP") {
                "up"
            } else if line.contains("state DOWN") {
                "down"
            } else {
                "unknown"
            }
            .to_string();
            let mtu = line
                .split("mtu")
                .nth(1)
                .and_then(|s| s.split_whitespace().next())
                .and_then(|s| s.parse::<u32>().ok());
            current = Some(InterfaceInfo {
                name,
                state,
                mtu,
                addrs: Vec::new(),
            });
        } else {
            let trimmed = line.trim();
            let family = if trimmed.starts_with("inet6") {
                Some("inet6")
            } else if trimmed.starts_with("inet ") {
                Some("inet")
            } else {
                None
            };
            if let Some(family) = family {
                let mut tokens = trimmed.split_whitespace();
                tokens.next();
                let address = tokens.next().unwrap_or("").to_string();
                let scope = trimmed
                    .split("scope")
                    .nth(1)
                    .and_then(|s| s.split_whitespace().next())
                    .unwrap_or("unknown")
                    .to_string();
                if let Some(iface) = current.as_mut() {
                    iface.addrs.push(InterfaceAddr {
                        family: family.to_string(),
                        address,
                        scope,
                    });
                }
            }
        }
    }
    if let Some(iface) = current.take() {
        out.push(iface);
    }
    if out.is_empty() {
        Err("no interfaces parsed from ip addr output".into())
    } else {
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uptime_load_averages() {
        let out = parse_uptime(" 10:03:23 up 4 days, 21:12,  2 users,  load average: 0.10, 0.05, 0.01").unwrap();
        assert_eq!(out["load_avg_1"], 0.10);
        assert_eq!(out["load_avg_5"], 0.05);
        assert_eq!(out["load_avg_15"], 0.01);
    }

    #[test]
    fn parses_free_b_mem_and_swap() {
        let stdout = "              total        used        free      shared  buff/cache   available\n\
Mem:     8589934592  2147483648  4294967296     1048576   2147483648  6442450944\n\
Swap:             0           0           0\n";
        let out = parse_free_b(stdout).unwrap();
        assert_eq!(out["mem_total"], 8589934592.0);
        assert_eq!(out["mem_available"], 6442450944.0);
        assert_eq!(out["swap_total"], 0.0);
    }

    #[test]
    fn parses_proc_stat_cpu_line() {
        let snap = parse_proc_stat_cpu("cpu 100 0 20 800 10 0 5 0 0 0\ncpu0 50 0 10 400 5 0 2 0 0 0").unwrap();
        assert_eq!(snap.user, 100);
        assert_eq!(snap.idle, 800);
        assert_eq!(snap.total(), 935);
    }

    #[test]
    fn parses_df_b1_excluding_non_dev_filesystems() {
        let stdout = "Filesystem     1B-blocks       Used   Available Use% Mounted on\n\
/dev/sda1   500000000000 250000000000 250000000000  50% /\n\
tmpfs          1000000000          0  1000000000   0% /dev/shm\n";
        let fses = parse_df_b1(stdout).unwrap();
        assert_eq!(fses.len(), 1);
        assert_eq!(fses[0].device, "/dev/sda1");
    }

    #[test]
    fn parses_proc_net_dev() {
        let stdout = "Inter-|   Receive                                                |  Transmit\n\
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo: 1000 10 0 0 0 0 0 0 1000 10 0 0 0 0 0 0\n\
  eth0: 2000 20 0 0 0 0 0 0 3000 30 1 0 0 0 0 0\n";
        let ifaces = parse_proc_net_dev(stdout).unwrap();
        assert_eq!(ifaces["eth0"].rx_bytes, 2000);
        assert_eq!(ifaces["eth0"].tx_bytes, 3000);
        assert_eq!(ifaces["eth0"].tx_errors, 1);
    }

    #[test]
    fn parses_ip_addr_interfaces() {
        let stdout = "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN\n\
    inet 127.0.0.1/8 scope host lo\n\
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP\n\
    inet 10.0.0.5/24 scope global eth0\n";
        let ifaces = parse_ip_addr(stdout).unwrap();
        assert_eq!(ifaces.len(), 2);
        let eth0 = ifaces.iter().find(|i| i.name == "eth0").unwrap();
        assert_eq!(eth0.mtu, Some(1500));
        assert_eq!(eth0.addrs[0].address, "10.0.0.5/24");
        assert_eq!(eth0.addrs[0].scope, "global");
    }
}
