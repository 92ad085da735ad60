/* Copyright (c) 2019 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Agent configuration: command-line flags matching the original tool's
//! `-t/-s/-c/-a/-p/-i/-r/-n/-o` surface, plus an optional `--config
//! <path.toml>` file. CLI flags always win over the file (the file
//! supplies defaults, not overrides), matching how `args.c` lets explicit
//! flags shadow whatever a config file would have set.

use std::net::SocketAddr;

use serde_derive::Deserialize;

use crate::error::{LancetError, Result};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    pub threads: Option<u32>,
    pub targets: Option<Vec<String>>,
    pub connections: Option<usize>,
    pub role: Option<u32>,
    pub transport: Option<String>,
    pub idist: Option<String>,
    pub app_proto: Option<String>,
    pub if_name: Option<String>,
    pub pending: Option<usize>,
    pub sampling: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub threads: u32,
    pub targets: Vec<SocketAddr>,
    pub connections: usize,
    pub role: u32,
    pub transport: String,
    pub idist: String,
    pub app_proto: String,
    pub if_name: Option<String>,
    pub pending: usize,
    pub sampling: f64,
}

impl AgentConfig {
    /// Parses `argv` (excluding argv[0]). `--config <path>` is consumed
    /// first and used to fill in anything not also given on the command
    /// line.
    pub fn from_args(args: &[String]) -> Result<AgentConfig> {
        let mut file_path: Option<String> = None;
        let mut threads: Option<u32> = None;
        let mut targets: Option<Vec<String>> = None;
        let mut connections: Option<usize> = None;
        let mut role: Option<u32> = None;
        let mut transport: Option<String> = None;
        let mut idist: Option<String> = None;
        let mut app_proto: Option<String> = None;
        let mut if_name: Option<String> = None;
        let mut pending: Option<usize> = None;

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || -> Result<&str> {
                args.get(i + 1)
                    .map(|s| s.as_str())
                    .ok_or_else(|| LancetError::Config(format!("missing value for {}", flag)))
            };
            match flag {
                "--config" => {
                    file_path = Some(value()?.to_string());
                    i += 1;
                }
                "-t" => {
                    threads = Some(parse_num(value()?)?);
                    i += 1;
                }
                "-s" => {
                    targets = Some(value()?.split(',').map(str::to_string).collect());
                    i += 1;
                }
                "-c" => {
                    connections = Some(parse_num(value()?)?);
                    i += 1;
                }
                "-a" => {
                    role = Some(parse_num(value()?)?);
                    i += 1;
                }
                "-p" => {
                    transport = Some(value()?.to_string());
                    i += 1;
                }
                "-i" => {
                    idist = Some(value()?.to_string());
                    i += 1;
                }
                "-r" => {
                    app_proto = Some(value()?.to_string());
                    i += 1;
                }
                "-n" => {
                    if_name = Some(value()?.to_string());
                    i += 1;
                }
                "-o" => {
                    pending = Some(parse_num(value()?)?);
                    i += 1;
                }
                other => return Err(LancetError::Config(format!("unrecognized flag '{}'", other))),
            }
            i += 1;
        }

        let file_config = match file_path {
            Some(path) => read_file_config(&path)?,
            None => FileConfig::default(),
        };

        let threads = threads.or(file_config.threads).unwrap_or(1);
        let target_strs = targets
            .or(file_config.targets)
            .ok_or_else(|| LancetError::Config("no targets given (-s or config file)".into()))?;
        let targets = target_strs
            .iter()
            .map(|s| parse_target(s))
            .collect::<Result<Vec<_>>>()?;
        let connections = connections.or(file_config.connections).unwrap_or(1);
        let role = role.or(file_config.role).unwrap_or(0);
        let transport = transport
            .or(file_config.transport)
            .ok_or_else(|| LancetError::Config("no transport given (-p or config file)".into()))?;
        let idist = idist
            .or(file_config.idist)
            .ok_or_else(|| LancetError::Config("no inter-arrival spec given (-i or config file)".into()))?;
        let app_proto = app_proto
            .or(file_config.app_proto)
            .ok_or_else(|| LancetError::Config("no application protocol given (-r or config file)".into()))?;
        let if_name = if_name.or(file_config.if_name);
        let pending = pending.or(file_config.pending).unwrap_or(crate::stats::MAX_PER_THREAD_TX_SAMPLES);
        let sampling = file_config.sampling.unwrap_or(1.0);

        Ok(AgentConfig {
            threads,
            targets,
            connections,
            role,
            transport,
            idist,
            app_proto,
            if_name,
            pending,
            sampling,
        })
    }
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse::<T>()
        .map_err(|_| LancetError::Config(format!("expected a number, got '{}'", s)))
}

fn parse_target(s: &str) -> Result<SocketAddr> {
    s.parse::<SocketAddr>()
        .map_err(|_| LancetError::Config(format!("invalid target address '{}'", s)))
}

fn read_file_config(path: &str) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| LancetError::Config(format!("reading config file {}: {}", path, e)))?;
    toml::from_str(&text).map_err(|e| LancetError::Config(format!("parsing config file {}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_build_a_full_config() {
        let args: Vec<String> = vec![
            "-t", "4", "-s", "127.0.0.1:11211", "-c", "8", "-a", "0", "-p", "tcp", "-i",
            "fixed:1000", "-r", "echo:64",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        let cfg = AgentConfig::from_args(&args).unwrap();
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.targets.len(), 1);
        assert_eq!(cfg.connections, 8);
    }

    #[test]
    fn missing_targets_is_a_config_error() {
        let args: Vec<String> = vec!["-p", "tcp", "-i", "fixed:1000", "-r", "echo:64"]
            .into_iter()
            .map(str::to_string)
            .collect();
        assert!(AgentConfig::from_args(&args).is_err());
    }

    #[test]
    fn unrecognized_flag_is_rejected() {
        let args: Vec<String> = vec!["--bogus", "1"].into_iter().map(str::to_string).collect();
        assert!(AgentConfig::from_args(&args).is_err());
    }
}
