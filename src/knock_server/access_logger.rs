use std::fmt::Display;
use std::net::IpAddr;

pub struct AccessLogger {}

pub enum LogEntryKind {
    Synced,
    Granted,
    AlreadyGranted,
    Failed,
    Expired,
    FirewallError,
}

impl AccessLogger {
    pub fn log<M: Display>(&self, client_address: IpAddr, kind: LogEntryKind, message: M) {
        let arrow = match kind {
            LogEntryKind::Synced => "<-",
            LogEntryKind::Granted => "->",
            LogEntryKind::AlreadyGranted => "~>",
            LogEntryKind::Failed => "|>",
            LogEntryKind::Expired => "x>",
            LogEntryKind::FirewallError => "!>",
        };

        println!("{client_address} {arrow} {message}");
    }
}
