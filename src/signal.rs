//! Portable signal set used by the supervisor, memory monitor and the
//! `kill` control surface.
//!
//! Only the signals this system ever needs to deliver are represented;
//! everything else is rejected by the parser rather than silently mapped
//! to a raw integer.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Term,
    Int,
    Kill,
    Hup,
}

impl Signal {
    /// Parse a signal name or raw number, accepting `"TERM"`, `"SIGTERM"`
    /// or `15` (and the INT/KILL/HUP equivalents), case-insensitively.
    pub fn parse(s: &str) -> Option<Signal> {
        let trimmed = s.trim();
        if let Ok(n) = trimmed.parse::<i32>() {
            return Signal::from_raw(n);
        }
        let upper = trimmed.to_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" => Some(Signal::Term),
            "INT" => Some(Signal::Int),
            "KILL" => Some(Signal::Kill),
            "HUP" => Some(Signal::Hup),
            _ => None,
        }
    }

    pub fn from_raw(n: i32) -> Option<Signal> {
        match n {
            15 => Some(Signal::Term),
            2 => Some(Signal::Int),
            9 => Some(Signal::Kill),
            1 => Some(Signal::Hup),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Int => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
            Signal::Hup => libc::SIGHUP,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Int => "INT",
            Signal::Kill => "KILL",
            Signal::Hup => "HUP",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::Term
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name() {
        assert_eq!(Signal::parse("TERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("int"), Some(Signal::Int));
    }

    #[test]
    fn parses_sig_prefixed_name() {
        assert_eq!(Signal::parse("SIGTERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("SigKill"), Some(Signal::Kill));
    }

    #[test]
    fn parses_raw_number() {
        assert_eq!(Signal::parse("15"), Some(Signal::Term));
        assert_eq!(Signal::parse("9"), Some(Signal::Kill));
    }

    #[test]
    fn rejects_unknown() {
        assert_eq!(Signal::parse("BOGUS"), None);
        assert_eq!(Signal::parse("42"), None);
    }
}
