use std::fmt;

/// Probe/announce state machine shared by the engine's host entry and
/// every registered service.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DnsState {
    #[default]
    Probing1,
    Probing2,
    Probing3,
    Announcing1,
    Announcing2,
    Announced,
    Canceled,
}

impl DnsState {
    /// Moves to the next state. `Announced` and `Canceled` are
    /// absorbing.
    pub fn advance(self) -> DnsState {
        match self {
            DnsState::Probing1 => DnsState::Probing2,
            DnsState::Probing2 => DnsState::Probing3,
            DnsState::Probing3 => DnsState::Announcing1,
            DnsState::Announcing1 => DnsState::Announcing2,
            DnsState::Announcing2 => DnsState::Announced,
            s => s,
        }
    }

    /// Falls back to the beginning of the probe cycle after a conflict.
    /// `Canceled` stays canceled.
    pub fn revert(self) -> DnsState {
        match self {
            DnsState::Canceled => DnsState::Canceled,
            _ => DnsState::Probing1,
        }
    }

    pub fn is_probing(self) -> bool {
        matches!(
            self,
            DnsState::Probing1 | DnsState::Probing2 | DnsState::Probing3
        )
    }

    pub fn is_announcing(self) -> bool {
        matches!(self, DnsState::Announcing1 | DnsState::Announcing2)
    }

    pub fn is_announced(self) -> bool {
        self == DnsState::Announced
    }
}

impl fmt::Display for DnsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DnsState::Probing1 => "probing 1",
            DnsState::Probing2 => "probing 2",
            DnsState::Probing3 => "probing 3",
            DnsState::Announcing1 => "announcing 1",
            DnsState::Announcing2 => "announcing 2",
            DnsState::Announced => "announced",
            DnsState::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}
