//! The production packet-policy adapter: iptables + tc + ip + conntrack.
//!
//! Layout on the box:
//!
//! - **Authorization**: a dedicated `VENDO_AUTH` chain in the filter
//!   table. An authorized client has `-m mac --mac-source <mac> -j ACCEPT`
//!   there; everything else falls through to the walled-garden redirect
//!   the portal plumbing owns.
//! - **Download shaping**: an HTB class per client on the LAN interface,
//!   classid `1:<last-octet>`, plus a u32 filter on the destination IP.
//!   The class counters double as the download byte counters.
//! - **Upload shaping**: an ingress police filter keyed on the source IP.
//! - **Upload accounting**: one `-s <ip> -j RETURN` rule per client in the
//!   `VENDO_ACCT` chain, read back with `iptables -nvx -L`.
//!
//! Every subprocess call carries a bounded deadline (2 s probes, 5 s
//! table rewrites by default). Deadline overruns and nonzero exits
//! surface as [`PolicyError`] and are healed by the ticker's next
//! reconciliation pass, so nothing here retries internally.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use vendo_core::config::PolicyConfig;
use vendo_core::net::class_id_for_ip;
use vendo_core::policy::{
    BoxFuture, Counter, CounterSample, NeighborState, PacketPolicy, PolicyError,
};
use vendo_core::MacAddr;

/// Chain holding per-MAC authorization rules.
const AUTH_CHAIN: &str = "VENDO_AUTH";

/// Chain holding per-IP upload accounting rules.
const ACCT_CHAIN: &str = "VENDO_ACCT";

/// Cap on captured stderr kept in errors.
const MAX_STDERR_LEN: usize = 512;

/// Netfilter/tc-backed [`PacketPolicy`].
#[derive(Debug, Clone)]
pub struct NetfilterPolicy {
    iface: String,
    probe_timeout: Duration,
    rewrite_timeout: Duration,
}

impl NetfilterPolicy {
    /// Creates the adapter for a LAN interface.
    #[must_use]
    pub fn new(iface: impl Into<String>, cfg: &PolicyConfig) -> Self {
        Self {
            iface: iface.into(),
            probe_timeout: cfg.probe_timeout(),
            rewrite_timeout: cfg.rewrite_timeout(),
        }
    }

    /// Ensures the chains and the root qdisc exist. Idempotent; called
    /// once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if a required tool is unusable.
    pub async fn ensure_plumbing(&self) -> Result<(), PolicyError> {
        // Chain creation fails when the chain exists; that is fine.
        let _ = self
            .run("iptables", &["-N", AUTH_CHAIN], self.rewrite_timeout)
            .await;
        let _ = self
            .run("iptables", &["-N", ACCT_CHAIN], self.rewrite_timeout)
            .await;
        let _ = self
            .run(
                "tc",
                &[
                    "qdisc", "add", "dev", self.iface.as_str(), "root", "handle", "1:", "htb",
                    "default", "999",
                ],
                self.rewrite_timeout,
            )
            .await;
        let _ = self
            .run(
                "tc",
                &["qdisc", "add", "dev", self.iface.as_str(), "handle", "ffff:", "ingress"],
                self.rewrite_timeout,
            )
            .await;
        debug!(iface = %self.iface, "netfilter plumbing ensured");
        Ok(())
    }

    async fn run(
        &self,
        tool: &'static str,
        args: &[&str],
        deadline: Duration,
    ) -> Result<std::process::Output, PolicyError> {
        let child = Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PolicyError::Spawn {
                tool,
                detail: e.to_string(),
            })?;
        match timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(PolicyError::Spawn {
                tool,
                detail: e.to_string(),
            }),
            Err(_) => {
                warn!(tool, ?args, "subprocess deadline elapsed");
                Err(PolicyError::Timeout {
                    tool,
                    timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                })
            },
        }
    }

    /// Runs a command and requires exit 0.
    async fn run_ok(
        &self,
        tool: &'static str,
        args: &[&str],
        deadline: Duration,
    ) -> Result<String, PolicyError> {
        let output = self.run(tool, args, deadline).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            stderr.truncate(MAX_STDERR_LEN);
            Err(PolicyError::CommandFailed {
                tool,
                code: output.status.code().unwrap_or(-1),
                stderr,
            })
        }
    }

    /// Returns whether a rule already exists (`iptables -C`).
    async fn rule_exists(&self, args: &[&str]) -> Result<bool, PolicyError> {
        let output = self.run("iptables", args, self.probe_timeout).await?;
        Ok(output.status.success())
    }
}

impl PacketPolicy for NetfilterPolicy {
    fn authorize<'a>(&'a self, mac: &'a MacAddr) -> BoxFuture<'a, Result<bool, PolicyError>> {
        Box::pin(async move {
            let mac_str = mac.to_string();
            let check = [
                "-C", AUTH_CHAIN, "-m", "mac", "--mac-source", mac_str.as_str(), "-j", "ACCEPT",
            ];
            if self.rule_exists(&check).await? {
                return Ok(false);
            }
            let add = [
                "-I", AUTH_CHAIN, "-m", "mac", "--mac-source", mac_str.as_str(), "-j", "ACCEPT",
            ];
            self.run_ok("iptables", &add, self.rewrite_timeout).await?;
            debug!(%mac, "mac authorized");
            Ok(true)
        })
    }

    fn deauthorize<'a>(&'a self, mac: &'a MacAddr) -> BoxFuture<'a, Result<(), PolicyError>> {
        Box::pin(async move {
            let mac_str = mac.to_string();
            let del = [
                "-D", AUTH_CHAIN, "-m", "mac", "--mac-source", mac_str.as_str(), "-j", "ACCEPT",
            ];
            // Deleting an absent rule exits nonzero; that is the idempotent
            // success case.
            match self.run_ok("iptables", &del, self.rewrite_timeout).await {
                Ok(_) => debug!(%mac, "mac deauthorized"),
                Err(PolicyError::CommandFailed { .. }) => {},
                Err(e) => return Err(e),
            }
            Ok(())
        })
    }

    fn set_limit(
        &self,
        ip: Ipv4Addr,
        down_kbps: u32,
        up_kbps: u32,
    ) -> BoxFuture<'_, Result<(), PolicyError>> {
        Box::pin(async move {
            let Some(class_id) = class_id_for_ip(ip) else {
                return Ok(());
            };
            let ip_str = ip.to_string();
            let classid = format!("1:{class_id}");
            let down_rate = format!("{down_kbps}kbit");
            if down_kbps > 0 {
                self.run_ok(
                    "tc",
                    &[
                        "class", "replace", "dev", self.iface.as_str(), "parent", "1:", "classid",
                        classid.as_str(), "htb", "rate", down_rate.as_str(), "ceil", down_rate.as_str(),
                    ],
                    self.rewrite_timeout,
                )
                .await?;
                let prio = class_id.to_string();
                let dst = format!("{ip_str}/32");
                self.run_ok(
                    "tc",
                    &[
                        "filter", "replace", "dev", self.iface.as_str(), "protocol", "ip", "parent",
                        "1:", "prio", prio.as_str(), "u32", "match", "ip", "dst", dst.as_str(), "flowid",
                        classid.as_str(),
                    ],
                    self.rewrite_timeout,
                )
                .await?;
            }
            if up_kbps > 0 {
                let prio = class_id.to_string();
                let src = format!("{ip_str}/32");
                let up_rate = format!("{up_kbps}kbit");
                self.run_ok(
                    "tc",
                    &[
                        "filter", "replace", "dev", self.iface.as_str(), "parent", "ffff:",
                        "protocol", "ip", "prio", prio.as_str(), "u32", "match", "ip", "src", src.as_str(),
                        "police", "rate", up_rate.as_str(), "burst", "32k", "drop", "flowid",
                        prio.as_str(),
                    ],
                    self.rewrite_timeout,
                )
                .await?;
            }
            // Upload accounting rule, once per IP.
            let check = ["-C", ACCT_CHAIN, "-s", ip_str.as_str(), "-j", "RETURN"];
            if !self.rule_exists(&check).await? {
                let add = ["-A", ACCT_CHAIN, "-s", ip_str.as_str(), "-j", "RETURN"];
                self.run_ok("iptables", &add, self.rewrite_timeout).await?;
            }
            debug!(%ip, down_kbps, up_kbps, "limit installed");
            Ok(())
        })
    }

    fn remove_limit(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), PolicyError>> {
        Box::pin(async move {
            let Some(class_id) = class_id_for_ip(ip) else {
                return Ok(());
            };
            let ip_str = ip.to_string();
            let classid = format!("1:{class_id}");
            let prio = class_id.to_string();
            // Each teardown step tolerates "already gone".
            let _ = self
                .run(
                    "tc",
                    &[
                        "filter", "del", "dev", self.iface.as_str(), "parent", "1:", "prio", prio.as_str(),
                    ],
                    self.rewrite_timeout,
                )
                .await;
            let _ = self
                .run(
                    "tc",
                    &[
                        "filter", "del", "dev", self.iface.as_str(), "parent", "ffff:", "prio",
                        prio.as_str(),
                    ],
                    self.rewrite_timeout,
                )
                .await;
            let _ = self
                .run(
                    "tc",
                    &[
                        "class", "del", "dev", self.iface.as_str(), "parent", "1:", "classid",
                        classid.as_str(),
                    ],
                    self.rewrite_timeout,
                )
                .await;
            let _ = self
                .run(
                    "iptables",
                    &["-D", ACCT_CHAIN, "-s", ip_str.as_str(), "-j", "RETURN"],
                    self.rewrite_timeout,
                )
                .await;
            // Evict whatever flows the client still holds.
            let _ = self
                .run("conntrack", &["-D", "-s", ip_str.as_str()], self.probe_timeout)
                .await;
            debug!(%ip, "limit removed");
            Ok(())
        })
    }

    fn sample_counters(&self) -> BoxFuture<'_, Result<CounterSample, PolicyError>> {
        Box::pin(async move {
            let tc_out = self
                .run_ok(
                    "tc",
                    &["-s", "class", "show", "dev", self.iface.as_str()],
                    self.probe_timeout,
                )
                .await?;
            let ipt_out = self
                .run_ok(
                    "iptables",
                    &["-nvx", "-L", ACCT_CHAIN],
                    self.probe_timeout,
                )
                .await?;
            Ok(CounterSample {
                downloads: parse_tc_class_bytes(&tc_out),
                uploads: parse_acct_bytes(&ipt_out),
            })
        })
    }

    fn list_authorized_macs(&self) -> BoxFuture<'_, Result<HashSet<MacAddr>, PolicyError>> {
        Box::pin(async move {
            let out = self
                .run_ok("iptables", &["-S", AUTH_CHAIN], self.probe_timeout)
                .await?;
            Ok(parse_auth_macs(&out))
        })
    }

    fn has_live_flows(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<bool, PolicyError>> {
        Box::pin(async move {
            let ip_str = ip.to_string();
            // conntrack exits 0 with an empty listing when nothing matches.
            let out = self
                .run_ok("conntrack", &["-L", "-s", ip_str.as_str()], self.probe_timeout)
                .await?;
            Ok(out.lines().any(|l| !l.trim().is_empty()))
        })
    }

    fn neighbor_state(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<NeighborState, PolicyError>> {
        Box::pin(async move {
            let ip_str = ip.to_string();
            let out = self
                .run_ok("ip", &["neigh", "show", ip_str.as_str()], self.probe_timeout)
                .await?;
            Ok(parse_neighbor_state(&out))
        })
    }
}

/// Parses `tc -s class show` into class-id keyed byte counters.
///
/// ```text
/// class htb 1:42 root prio 0 rate 2048Kbit ceil 2048Kbit burst 1599b cburst 1599b
///  Sent 123456 bytes 789 pkt (dropped 0, overlimits 0 requeues 0)
/// ```
fn parse_tc_class_bytes(output: &str) -> HashMap<u16, Counter> {
    let mut result = HashMap::new();
    let mut current: Option<u16> = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("class htb 1:") {
            current = rest
                .split_whitespace()
                .next()
                .and_then(|tok| tok.parse::<u16>().ok());
        } else if let Some(rest) = trimmed.strip_prefix("Sent ") {
            if let Some(class_id) = current.take() {
                if let Some(bytes) = rest
                    .split_whitespace()
                    .next()
                    .and_then(|tok| tok.parse::<u64>().ok())
                {
                    result.insert(
                        class_id,
                        Counter {
                            bytes,
                            idle_secs: None,
                        },
                    );
                }
            }
        }
    }
    result
}

/// Parses `iptables -nvx -L VENDO_ACCT` into IP keyed byte counters.
///
/// ```text
/// Chain VENDO_ACCT (0 references)
///     pkts      bytes target     prot opt in     out     source               destination
///      120    45678 RETURN     all  --  *      *       10.0.0.7             0.0.0.0/0
/// ```
fn parse_acct_bytes(output: &str) -> HashMap<Ipv4Addr, Counter> {
    let mut result = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || fields[2] != "RETURN" {
            continue;
        }
        let (Ok(bytes), Ok(ip)) = (fields[1].parse::<u64>(), fields[7].parse::<Ipv4Addr>())
        else {
            continue;
        };
        result.insert(
            ip,
            Counter {
                bytes,
                idle_secs: None,
            },
        );
    }
    result
}

/// Parses `iptables -S VENDO_AUTH` into the authorized MAC set.
fn parse_auth_macs(output: &str) -> HashSet<MacAddr> {
    let mut result = HashSet::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "--mac-source" {
                if let Some(Ok(mac)) = fields.next().map(MacAddr::parse) {
                    result.insert(mac);
                }
            }
        }
    }
    result
}

/// Parses `ip neigh show <ip>` output into a liveness verdict.
fn parse_neighbor_state(output: &str) -> NeighborState {
    let line = output.lines().next().unwrap_or("");
    if line.contains("REACHABLE") || line.contains("DELAY") || line.contains("PROBE") {
        NeighborState::Reachable
    } else if line.contains("STALE") {
        NeighborState::Stale
    } else {
        NeighborState::Unreachable
    }
}
