//! Connection and server introspection commands.
//!
//! Handles: PING, AUTH, INFO, TIME, COMMAND, SLOWLOG

use super::{Role, Server};
use crate::config::AUTHPASS_MAX_LEN;
use crate::redis::client::ClientId;
use crate::redis::data::parse_i64;
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::resp::RespValue;
use bytes::Bytes;
use std::fmt::Write as _;

const INFO_SECTIONS: &[&str] = &[
    "server",
    "clients",
    "persistence",
    "stats",
    "replication",
    "commandstats",
    "keyspace",
];

/// Compare without leaking where the inputs differ. Both sides are copied
/// into fixed buffers so the work does not depend on the password length.
fn time_independent_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() > AUTHPASS_MAX_LEN || b.len() > AUTHPASS_MAX_LEN {
        return false;
    }
    let mut bufa = [0u8; AUTHPASS_MAX_LEN];
    let mut bufb = [0u8; AUTHPASS_MAX_LEN];
    bufa[..a.len()].copy_from_slice(a);
    bufb[..b.len()].copy_from_slice(b);
    let mut diff = 0u8;
    for (x, y) in bufa.iter().zip(bufb.iter()) {
        diff |= x ^ y;
    }
    diff == 0 && a.len() == b.len()
}

impl Server {
    pub(super) fn execute_ping(&mut self, argv: &[Bytes]) -> CommandResult {
        match argv.len() {
            1 => Ok(RespValue::pong()),
            2 => Ok(RespValue::bulk(&argv[1])),
            _ => Err(CommandError::WrongArity("ping".to_string())),
        }
    }

    pub(super) fn execute_auth(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let Some(pass) = self.config.requirepass.as_deref() else {
            return Err(CommandError::Other(
                "Client sent AUTH, but no password is set".into(),
            ));
        };
        let ok = time_independent_eq(&argv[1], pass.as_bytes());
        self.client_state_mut(c).authenticated = ok;
        if ok {
            Ok(RespValue::ok())
        } else {
            Err(CommandError::Other("invalid password".into()))
        }
    }

    pub(super) fn execute_time(&mut self) -> CommandResult {
        let now_us = self.clock.now_us();
        Ok(RespValue::array(vec![
            RespValue::bulk_str(&(now_us / 1_000_000).to_string()),
            RespValue::bulk_str(&(now_us % 1_000_000).to_string()),
        ]))
    }

    /// INFO [section]. "default" and no argument skip `commandstats`;
    /// "all" includes it.
    pub(super) fn execute_info(&mut self, argv: &[Bytes]) -> CommandResult {
        if argv.len() > 2 {
            return Err(CommandError::Syntax);
        }
        let section = argv
            .get(1)
            .map(|s| String::from_utf8_lossy(s).to_ascii_lowercase())
            .unwrap_or_else(|| "default".to_string());
        Ok(RespValue::bulk_str(&self.info_string(&section)))
    }

    /// The INFO text for `section`.
    pub fn info_string(&self, section: &str) -> String {
        let all = section == "all";
        let default = section == "default";
        let mut out = String::new();
        for &name in INFO_SECTIONS {
            let wanted = if name == "commandstats" {
                all || section == name
            } else {
                all || default || section == name
            };
            if !wanted {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\r\n");
            }
            self.write_info_section(&mut out, name);
        }
        out
    }

    fn write_info_section(&self, out: &mut String, name: &str) {
        let now_ms = self.clock.now_ms();
        let uptime = (now_ms - self.started_ms).max(0) / 1000;
        // Writing to a String cannot fail.
        let _ = match name {
            "server" => write!(
                out,
                "# Server\r\nredis_version:{}\r\nrun_id:{}\r\nhz:{}\r\nuptime_in_seconds:{}\r\nuptime_in_days:{}\r\nlru_clock:{}\r\ncronloops:{}\r\n",
                env!("CARGO_PKG_VERSION"),
                self.run_id,
                self.config.hz,
                uptime,
                uptime / 86400,
                self.lru_clock,
                self.cronloops,
            ),
            "clients" => write!(
                out,
                "# Clients\r\nconnected_clients:{}\r\n",
                self.clients.len()
            ),
            "persistence" => write!(
                out,
                "# Persistence\r\nloading:{}\r\nrdb_changes_since_last_save:{}\r\nrdb_bgsave_in_progress:{}\r\nrdb_last_save_time:{}\r\nrdb_last_bgsave_status:{}\r\naof_last_write_status:{}\r\n",
                self.loading as u8,
                self.dirty,
                self.save_in_progress() as u8,
                self.lastsave_secs,
                if self.last_bgsave_ok { "ok" } else { "err" },
                if self.aof_last_write_error.is_none() { "ok" } else { "err" },
            ),
            "stats" => write!(
                out,
                "# Stats\r\ntotal_connections_received:{}\r\ntotal_commands_processed:{}\r\nexpired_keys:{}\r\nexpired_time_cap_reached_count:{}\r\nkeyspace_hits:{}\r\nkeyspace_misses:{}\r\n",
                self.stats.numconnections,
                self.stats.numcommands,
                self.stats.expired_keys,
                self.stats.expire_timelimit_exits,
                self.stats.keyspace_hits,
                self.stats.keyspace_misses,
            ),
            "replication" => {
                let role = match self.role {
                    Role::Primary => "master",
                    Role::Replica => "slave",
                };
                write!(out, "# Replication\r\nrole:{}\r\n", role)
            }
            "commandstats" => {
                out.push_str("# Commandstats\r\n");
                let mut used: Vec<_> = self
                    .commands
                    .iter()
                    .filter(|(_, cmd)| cmd.calls() > 0)
                    .collect();
                used.sort_by_key(|(name, _)| *name);
                for (name, cmd) in used {
                    let calls = cmd.calls();
                    let usec = cmd.microseconds();
                    let _ = write!(
                        out,
                        "cmdstat_{}:calls={},usec={},usec_per_call={:.2}\r\n",
                        name,
                        calls,
                        usec,
                        usec as f64 / calls as f64
                    );
                }
                Ok(())
            }
            "keyspace" => {
                out.push_str("# Keyspace\r\n");
                for db in self.dbs.iter().filter(|db| !db.is_empty()) {
                    let _ = write!(
                        out,
                        "db{}:keys={},expires={},avg_ttl={}\r\n",
                        db.id,
                        db.len(),
                        db.expires_len(),
                        db.avg_ttl
                    );
                }
                Ok(())
            }
            _ => Ok(()),
        };
    }

    /// COMMAND, COMMAND COUNT, COMMAND INFO name..., COMMAND GETKEYS cmd args...
    pub(super) fn execute_command(&mut self, argv: &[Bytes]) -> CommandResult {
        let Some(sub) = argv.get(1) else {
            return Ok(RespValue::array(
                self.commands.iter().map(|(_, cmd)| cmd.info_reply()).collect(),
            ));
        };
        if sub.eq_ignore_ascii_case(b"count") && argv.len() == 2 {
            return Ok(RespValue::Integer(self.commands.len() as i64));
        }
        if sub.eq_ignore_ascii_case(b"info") {
            return Ok(RespValue::array(
                argv[2..]
                    .iter()
                    .map(|name| {
                        self.commands
                            .lookup(name)
                            .map_or_else(RespValue::nil, |cmd| cmd.info_reply())
                    })
                    .collect(),
            ));
        }
        if sub.eq_ignore_ascii_case(b"getkeys") && argv.len() >= 3 {
            let args = &argv[2..];
            let cmd = self
                .commands
                .lookup(&args[0])
                .ok_or_else(|| CommandError::Other("Invalid command specified".into()))?;
            if !cmd.arity_ok(args.len()) {
                return Err(CommandError::Other(
                    "Invalid number of arguments specified for command".into(),
                ));
            }
            let keys = cmd.key_positions(args);
            if keys.is_empty() {
                return Err(CommandError::Other(
                    "Invalid arguments specified for command".into(),
                ));
            }
            return Ok(RespValue::bulk_array(keys.iter().map(|&i| &args[i])));
        }
        Err(CommandError::Other(
            "Unknown subcommand or wrong number of arguments.".into(),
        ))
    }

    /// SLOWLOG GET [count] | LEN | RESET
    pub(super) fn execute_slowlog(&mut self, argv: &[Bytes]) -> CommandResult {
        let sub = &argv[1];
        if argv.len() == 2 && sub.eq_ignore_ascii_case(b"reset") {
            self.slowlog.reset();
            return Ok(RespValue::ok());
        }
        if argv.len() == 2 && sub.eq_ignore_ascii_case(b"len") {
            return Ok(RespValue::Integer(self.slowlog.len() as i64));
        }
        if (argv.len() == 2 || argv.len() == 3) && sub.eq_ignore_ascii_case(b"get") {
            let count = match argv.get(2) {
                Some(n) => {
                    let n = parse_i64(n).ok_or(CommandError::NotInteger)?;
                    if n < 0 {
                        usize::MAX
                    } else {
                        n as usize
                    }
                }
                None => 10,
            };
            return Ok(RespValue::array(
                self.slowlog.latest(count).map(|e| e.to_resp()).collect(),
            ));
        }
        Err(CommandError::Other(
            "Unknown SLOWLOG subcommand or wrong # of args. Try GET, RESET, LEN.".into(),
        ))
    }
}
