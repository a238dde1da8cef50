//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashSet;
use std::net::IpAddr;

use tracing::warn;

// Longest accepted instance name, in bytes.
pub const NAME_MAX: usize = 31;

// Millisecond ranges accepted by the configuration keywords.
const INTERVAL_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;
const IDLE_TX_RANGE: std::ops::RangeInclusive<u32> = 1000..=10000;
const MULTIPLIER_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

// Parsed configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Config {
    pub instances: Vec<InstanceCfg>,
}

// Configuration of a single BFD instance. Interval values are stored in
// microseconds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceCfg {
    pub name: String,
    pub nbr_addr: Option<IpAddr>,
    pub src_addr: Option<IpAddr>,
    pub min_rx: u32,
    pub min_tx: u32,
    pub idle_tx: u32,
    pub multiplier: u8,
    pub enabled: bool,
}

// ===== impl Config =====

impl Config {
    // Parses the keyword-directed configuration text.
    //
    // Parsing never fails: a malformed instance is disabled with a warning
    // and the loader carries on with the remaining ones.
    pub fn parse(input: &str) -> Config {
        let mut instances = Vec::new();
        let mut tokens = tokenize(input).peekable();

        while let Some(token) = tokens.next() {
            if token == "bfd_instance" {
                let Some(name) = tokens.next() else {
                    warn!("missing instance name");
                    break;
                };
                instances.push(parse_instance(name, &mut tokens));
            } else {
                // Unrecognized root keyword: other subsystems may share the
                // file. Skip its arguments and its block, if it has one.
                skip_unknown(&mut tokens);
            }
        }

        finalize(instances)
    }
}

// ===== impl InstanceCfg =====

impl InstanceCfg {
    fn new(name: String) -> InstanceCfg {
        InstanceCfg {
            name,
            nbr_addr: None,
            src_addr: None,
            min_rx: 10000,
            min_tx: 10000,
            idle_tx: 1000000,
            multiplier: 5,
            enabled: true,
        }
    }
}

// ===== helper functions =====

// Splits the configuration text into tokens, treating braces as standalone
// tokens and stripping comments.
fn tokenize(input: &str) -> impl Iterator<Item = String> + '_ {
    input
        .lines()
        .map(|line| {
            match line.find(['#', '!']) {
                Some(pos) => &line[..pos],
                None => line,
            }
        })
        .flat_map(|line| {
            line.replace('{', " { ")
                .replace('}', " } ")
                .split_whitespace()
                .map(String::from)
                .collect::<Vec<_>>()
        })
}

// Skips the arguments of an unrecognized root keyword and, when one opens,
// its brace-delimited block. Stops short of the next recognized root
// keyword.
fn skip_unknown<I>(tokens: &mut std::iter::Peekable<I>)
where
    I: Iterator<Item = String>,
{
    while let Some(token) = tokens.peek() {
        match token.as_str() {
            "bfd_instance" => return,
            "{" => {
                let mut depth = 0;
                for token in tokens.by_ref() {
                    match token.as_str() {
                        "{" => depth += 1,
                        "}" => {
                            depth -= 1;
                            if depth == 0 {
                                return;
                            }
                        }
                        _ => {}
                    }
                }
                return;
            }
            _ => {
                tokens.next();
            }
        }
    }
}

fn parse_instance(
    mut name: String,
    tokens: &mut impl Iterator<Item = String>,
) -> InstanceCfg {
    let mut disable = false;

    // An overlong name is truncated and the instance taken out of service.
    if name.len() > NAME_MAX {
        let mut end = NAME_MAX;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        warn!(%name, "instance name too long");
        name.truncate(end);
        disable = true;
    }

    let mut instance = InstanceCfg::new(name);
    let mut seen = HashSet::new();

    match tokens.next() {
        Some(token) if token == "{" => {}
        _ => {
            warn!(name = %instance.name, "missing instance block");
            instance.enabled = false;
            return instance;
        }
    }

    while let Some(keyword) = tokens.next() {
        if keyword == "}" {
            break;
        }
        if !seen.insert(keyword.clone()) {
            warn!(name = %instance.name, %keyword, "duplicate keyword");
            disable = true;
        }
        match keyword.as_str() {
            "neighbor_ip" => match next_arg(tokens, &keyword) {
                Some(arg) => match arg.parse::<IpAddr>() {
                    Ok(addr) => instance.nbr_addr = Some(addr),
                    Err(_) => {
                        warn!(name = %instance.name, address = %arg,
                            "malformed neighbor address");
                        disable = true;
                    }
                },
                None => disable = true,
            },
            "source_ip" => match next_arg(tokens, &keyword) {
                Some(arg) => match arg.parse::<IpAddr>() {
                    Ok(addr) => instance.src_addr = Some(addr),
                    // A bad source address is not fatal to the instance.
                    Err(_) => {
                        warn!(name = %instance.name, address = %arg,
                            "malformed source address, ignoring");
                    }
                },
                None => disable = true,
            },
            "min_rx" => {
                match next_range_arg(tokens, &keyword, INTERVAL_RANGE) {
                    Some(ms) => instance.min_rx = ms * 1000,
                    None => disable = true,
                }
            }
            "min_tx" => {
                match next_range_arg(tokens, &keyword, INTERVAL_RANGE) {
                    Some(ms) => instance.min_tx = ms * 1000,
                    None => disable = true,
                }
            }
            "idle_tx" => {
                match next_range_arg(tokens, &keyword, IDLE_TX_RANGE) {
                    Some(ms) => instance.idle_tx = ms * 1000,
                    None => disable = true,
                }
            }
            "multiplier" => {
                match next_range_arg(tokens, &keyword, MULTIPLIER_RANGE) {
                    Some(mult) => instance.multiplier = mult,
                    None => disable = true,
                }
            }
            "disabled" => instance.enabled = false,
            _ => {
                warn!(name = %instance.name, %keyword, "unexpected keyword");
            }
        }
    }

    if disable {
        instance.enabled = false;
    }

    instance
}

// Returns the argument of a keyword, if present.
fn next_arg(
    tokens: &mut impl Iterator<Item = String>,
    keyword: &str,
) -> Option<String> {
    match tokens.next() {
        Some(arg) if arg != "{" && arg != "}" => Some(arg),
        _ => {
            warn!(%keyword, "missing argument");
            None
        }
    }
}

// Returns the numeric argument of a keyword, validated against its range.
fn next_range_arg<T>(
    tokens: &mut impl Iterator<Item = String>,
    keyword: &str,
    range: std::ops::RangeInclusive<T>,
) -> Option<T>
where
    T: Copy + PartialOrd + std::str::FromStr + std::fmt::Display,
{
    let arg = next_arg(tokens, keyword)?;
    match arg.parse::<T>() {
        Ok(value) if range.contains(&value) => Some(value),
        Ok(value) => {
            warn!(%keyword, %value, "value out of range");
            None
        }
        Err(_) => {
            warn!(%keyword, %arg, "malformed value");
            None
        }
    }
}

// Enforces the cross-instance uniqueness rules: duplicate names are renamed
// and disabled, duplicate neighbor addresses and missing neighbors disable
// the instance.
fn finalize(mut instances: Vec<InstanceCfg>) -> Config {
    let mut names = HashSet::new();
    for (pos, instance) in instances.iter_mut().enumerate() {
        if !names.insert(instance.name.clone()) {
            let renamed = format!("<DUP-{}>", pos + 1);
            warn!(name = %instance.name, %renamed, "duplicate instance name");
            instance.name = renamed;
            instance.enabled = false;
        }
    }

    let mut addrs = HashSet::new();
    for instance in instances.iter_mut() {
        match instance.nbr_addr {
            Some(addr) => {
                if !addrs.insert(addr) {
                    warn!(name = %instance.name, address = %addr,
                        "duplicate neighbor address");
                    instance.enabled = false;
                }
            }
            None if instance.enabled => {
                warn!(name = %instance.name, "no neighbor address");
                instance.enabled = false;
            }
            None => {}
        }
    }

    Config { instances }
}
