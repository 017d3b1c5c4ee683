//! ASCII wire grammar.
//!
//! Every payload is one line of space-separated decimal tokens; token count
//! (plus a leading keyword where one exists) disambiguates message kinds.
//! Parsers reject anything they do not recognize so request/reply handlers can
//! answer `invalid_request` and ingestion loops can drop with a warning.

use anyhow::{bail, Context};
use std::fmt;
use std::str::FromStr;

pub const CONNECT_REQUEST: &str = "connect_request";
pub const CONNECT_ACK: &str = "connect_ack";
pub const INVALID_REQUEST: &str = "invalid_request";
pub const HEARTBEAT: &str = "heartbeat";
pub const USER_REQUEST: &str = "user_request";
pub const ASSIGN_TAXI: &str = "assign_taxi";
pub const NO_TAXI_AVAILABLE: &str = "no_taxi_available";
pub const ASSIGN: &str = "assign";
pub const HEARTBEAT_SRV: &str = "heartbeat_srv";
pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
pub const ACTIVATE_BACKUP: &str = "activate_backup";
pub const DEACTIVATE_BACKUP: &str = "deactivate_backup";

pub const VALID_SPEEDS: [i64; 3] = [1, 2, 4];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaxiStatus {
    Available,
    Unavailable,
}

impl TaxiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaxiStatus::Available => "available",
            TaxiStatus::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for TaxiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxiStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "available" => Ok(TaxiStatus::Available),
            "unavailable" => Ok(TaxiStatus::Unavailable),
            other => bail!("unknown taxi status `{other}`"),
        }
    }
}

/// The five-field taxi report carried by both `connect_request` and the bare
/// position-update frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaxiReport {
    pub taxi_id: i64,
    pub pos_x: i64,
    pub pos_y: i64,
    pub speed: i64,
    pub status: TaxiStatus,
}

impl TaxiReport {
    pub fn encode_connect(&self) -> String {
        format!(
            "{CONNECT_REQUEST} {} {} {} {} {}",
            self.taxi_id, self.pos_x, self.pos_y, self.speed, self.status
        )
    }

    pub fn encode_position(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.taxi_id, self.pos_x, self.pos_y, self.speed, self.status
        )
    }
}

fn parse_i64(token: &str, what: &'static str) -> anyhow::Result<i64> {
    token
        .parse::<i64>()
        .with_context(|| format!("parse {what} `{token}`"))
}

fn parse_report_fields(tokens: &[&str]) -> anyhow::Result<TaxiReport> {
    Ok(TaxiReport {
        taxi_id: parse_i64(tokens[0], "taxi_id")?,
        pos_x: parse_i64(tokens[1], "pos_x")?,
        pos_y: parse_i64(tokens[2], "pos_y")?,
        speed: parse_i64(tokens[3], "speed")?,
        status: tokens[4].parse()?,
    })
}

/// `connect_request <tid> <x> <y> <speed> <status>`
pub fn parse_connect_request(line: &str) -> anyhow::Result<TaxiReport> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    if tokens.len() != 6 || tokens[0] != CONNECT_REQUEST {
        bail!("malformed connect_request `{line}`");
    }
    parse_report_fields(&tokens[1..])
}

/// Bare `<tid> <x> <y> <speed> <status>` position frame.
pub fn parse_position_update(line: &str) -> anyhow::Result<TaxiReport> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    if tokens.len() != 5 {
        bail!("malformed position update `{line}`");
    }
    parse_report_fields(&tokens)
}

/// `heartbeat <tid>`
pub fn parse_heartbeat(line: &str) -> anyhow::Result<i64> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    if tokens.len() != 2 || tokens[0] != HEARTBEAT {
        bail!("malformed heartbeat `{line}`");
    }
    parse_i64(tokens[1], "taxi_id")
}

pub fn encode_heartbeat(taxi_id: i64) -> String {
    format!("{HEARTBEAT} {taxi_id}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RideRequest {
    pub user_id: i64,
    pub pos_x: i64,
    pub pos_y: i64,
}

impl RideRequest {
    pub fn encode(&self) -> String {
        format!("{USER_REQUEST} {} {} {}", self.user_id, self.pos_x, self.pos_y)
    }
}

/// `user_request <uid> <x> <y>`
pub fn parse_user_request(line: &str) -> anyhow::Result<RideRequest> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    if tokens.len() != 4 || tokens[0] != USER_REQUEST {
        bail!("malformed user_request `{line}`");
    }
    Ok(RideRequest {
        user_id: parse_i64(tokens[1], "user_id")?,
        pos_x: parse_i64(tokens[2], "pos_x")?,
        pos_y: parse_i64(tokens[3], "pos_y")?,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectReply {
    Ack(i64),
    Invalid,
}

pub fn parse_connect_reply(line: &str) -> anyhow::Result<ConnectReply> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    match tokens.as_slice() {
        [INVALID_REQUEST] => Ok(ConnectReply::Invalid),
        [CONNECT_ACK, tid] => Ok(ConnectReply::Ack(parse_i64(tid, "taxi_id")?)),
        _ => bail!("malformed connect reply `{line}`"),
    }
}

pub fn encode_connect_ack(taxi_id: i64) -> String {
    format!("{CONNECT_ACK} {taxi_id}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RideReply {
    AssignTaxi(i64),
    NoTaxiAvailable,
    Invalid,
}

impl RideReply {
    pub fn encode(&self) -> String {
        match self {
            RideReply::AssignTaxi(tid) => format!("{ASSIGN_TAXI} {tid}"),
            RideReply::NoTaxiAvailable => NO_TAXI_AVAILABLE.to_string(),
            RideReply::Invalid => INVALID_REQUEST.to_string(),
        }
    }
}

pub fn parse_ride_reply(line: &str) -> anyhow::Result<RideReply> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    match tokens.as_slice() {
        [NO_TAXI_AVAILABLE] => Ok(RideReply::NoTaxiAvailable),
        [INVALID_REQUEST] => Ok(RideReply::Invalid),
        [ASSIGN_TAXI, tid] => Ok(RideReply::AssignTaxi(parse_i64(tid, "taxi_id")?)),
        _ => bail!("malformed ride reply `{line}`"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssignmentNotice {
    pub taxi_id: i64,
    pub user_id: i64,
}

impl AssignmentNotice {
    pub fn encode(&self) -> String {
        format!("{ASSIGN} {} {}", self.taxi_id, self.user_id)
    }
}

/// `assign <tid> <uid>` broadcast frame.
pub fn parse_assignment(line: &str) -> anyhow::Result<AssignmentNotice> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    if tokens.len() != 3 || tokens[0] != ASSIGN {
        bail!("malformed assignment `{line}`");
    }
    Ok(AssignmentNotice {
        taxi_id: parse_i64(tokens[1], "taxi_id")?,
        user_id: parse_i64(tokens[2], "user_id")?,
    })
}

/// Subscription prefix for one taxi's assignments. The trailing space keeps
/// taxi 1 from matching taxi 10.
pub fn assignment_topic(taxi_id: i64) -> String {
    format!("{ASSIGN} {taxi_id} ")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupCommand {
    Activate,
    Deactivate,
}

impl BackupCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupCommand::Activate => ACTIVATE_BACKUP,
            BackupCommand::Deactivate => DEACTIVATE_BACKUP,
        }
    }
}

pub fn parse_backup_command(line: &str) -> anyhow::Result<BackupCommand> {
    match line.trim() {
        ACTIVATE_BACKUP => Ok(BackupCommand::Activate),
        DEACTIVATE_BACKUP => Ok(BackupCommand::Deactivate),
        other => bail!("unknown backup command `{other}`"),
    }
}
