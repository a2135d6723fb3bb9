use std::fmt;

use serde::Serialize;

/// TCP-style connection state of an SDP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TcpState {
    Listen,
    SynSent,
    SynRecv,
    Established,
    /// Local side closed; DISCONN queued or sent.
    FinWait1,
    /// Peer sent DISCONN; local side may still send.
    CloseWait,
    /// Local close after the peer's DISCONN.
    LastAck,
    TimeWait,
    Close,
}

impl TcpState {
    pub fn name(&self) -> &'static str {
        match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
        }
    }

    /// Whether application data may be queued for sending.
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    pub fn is_synchronizing(&self) -> bool {
        matches!(self, TcpState::SynSent | TcpState::SynRecv)
    }

    /// The local side has started (or finished) tearing down.
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            TcpState::FinWait1 | TcpState::LastAck | TcpState::TimeWait | TcpState::Close
        )
    }

    /// States in which receive buffers are kept posted.
    pub fn can_post_recv(&self) -> bool {
        matches!(
            self,
            TcpState::SynSent
                | TcpState::SynRecv
                | TcpState::Established
                | TcpState::FinWait1
                | TcpState::CloseWait
                | TcpState::LastAck
        )
    }

    /// States in which queued messages may be posted to the queue pair.
    pub fn can_post_send(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::CloseWait | TcpState::LastAck
        )
    }

    pub fn allows_credit_update(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::CloseWait
        )
    }

    /// Waiting for the peer's half of an orderly shutdown.
    pub fn awaits_disconnect(&self) -> bool {
        matches!(self, TcpState::FinWait1 | TcpState::LastAck)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
