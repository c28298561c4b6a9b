//! Small shared types used across the engine.

use std::fmt;

/// Ordering policy for a target, applied independently to storage
/// completions and to end-to-end network delivery.
///
/// - `Serial`: op `n` may not begin until op `n-1` has completed.
/// - `Loose`: ops serialize only when they collide on an offset-table
///   slot; otherwise up to queue-depth ops overlap.
/// - `None`: no gating at all; the offset table is updated for
///   observation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingMode {
    Serial,
    #[default]
    Loose,
    None,
}

impl OrderingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderingMode::Serial => "serial",
            OrderingMode::Loose => "loose",
            OrderingMode::None => "none",
        }
    }
}

impl std::str::FromStr for OrderingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(OrderingMode::Serial),
            "loose" => Ok(OrderingMode::Loose),
            "none" => Ok(OrderingMode::None),
            other => Err(format!("unknown ordering '{other}'")),
        }
    }
}

impl fmt::Display for OrderingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a target is for. `In` targets are read, `Out` targets are
/// written, `Meta` targets carry no user data, and `Null` targets
/// fabricate instant success for overhead measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetRole {
    In,
    #[default]
    Out,
    Meta,
    Null,
}

impl TargetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetRole::In => "in",
            TargetRole::Out => "out",
            TargetRole::Meta => "meta",
            TargetRole::Null => "null",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_parse() {
        assert_eq!("serial".parse::<OrderingMode>(), Ok(OrderingMode::Serial));
        assert_eq!("loose".parse::<OrderingMode>(), Ok(OrderingMode::Loose));
        assert_eq!("none".parse::<OrderingMode>(), Ok(OrderingMode::None));
        assert!("strict".parse::<OrderingMode>().is_err());
    }
}
