//! Socket-table connection records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// TCP connection state as numbered by the kernel socket tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    NewSynRecv,
}

impl TcpState {
    const ORDERED: [TcpState; 12] = [
        TcpState::Established,
        TcpState::SynSent,
        TcpState::SynRecv,
        TcpState::FinWait1,
        TcpState::FinWait2,
        TcpState::TimeWait,
        TcpState::Close,
        TcpState::CloseWait,
        TcpState::LastAck,
        TcpState::Listen,
        TcpState::Closing,
        TcpState::NewSynRecv,
    ];

    /// Looks up a 1-based kernel state code.
    pub fn from_code(code: u32) -> Option<Self> {
        let index = usize::try_from(code).ok()?.checked_sub(1)?;
        Self::ORDERED.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Established => "ESTABLISHED",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::Listen => "LISTEN",
            Self::Closing => "CLOSING",
            Self::NewSynRecv => "NEW_SYN_RECV",
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a socket table. Produced fresh on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    /// `None` when the kernel code is outside the known enumeration.
    pub state: Option<TcpState>,
}

impl Connection {
    /// State name, empty for unknown codes.
    pub fn state_name(&self) -> &'static str {
        self.state.map(|s| s.as_str()).unwrap_or("")
    }

    pub fn is_listening(&self) -> bool {
        self.state == Some(TcpState::Listen)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} -> {}:{}",
            self.state_name(),
            self.local_address,
            self.local_port,
            self.remote_address,
            self.remote_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_are_one_based() {
        assert_eq!(TcpState::from_code(0), None);
        assert_eq!(TcpState::from_code(1), Some(TcpState::Established));
        assert_eq!(TcpState::from_code(0x0A), Some(TcpState::Listen));
        assert_eq!(TcpState::from_code(12), Some(TcpState::NewSynRecv));
        assert_eq!(TcpState::from_code(13), None);
    }

    #[test]
    fn test_connection_display() {
        let conn = Connection {
            local_address: "127.0.0.1".to_string(),
            local_port: 20001,
            remote_address: "0.0.0.0".to_string(),
            remote_port: 0,
            state: Some(TcpState::Listen),
        };
        assert_eq!(conn.to_string(), "[LISTEN] 127.0.0.1:20001 -> 0.0.0.0:0");
        assert!(conn.is_listening());

        let unknown = Connection { state: None, ..conn };
        assert_eq!(unknown.state_name(), "");
    }
}
