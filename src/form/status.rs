use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Valid,
    Invalid,
    Pending,
    Disabled,
}

impl Status {
    pub fn is_valid(self) -> bool {
        self == Status::Valid
    }

    pub fn is_invalid(self) -> bool {
        self == Status::Invalid
    }

    pub fn is_pending(self) -> bool {
        self == Status::Pending
    }

    pub fn is_disabled(self) -> bool {
        self == Status::Disabled
    }

    fn precedence(self) -> u8 {
        match self {
            Status::Disabled => 0,
            Status::Valid => 1,
            Status::Invalid => 2,
            Status::Pending => 3,
        }
    }
}

/// Folds a node's own result with its children's aggregated statuses.
///
/// A disabled node reports `Disabled`; disabled children are ignored
/// entirely. Otherwise `Pending` beats `Invalid` beats `Valid`, so an
/// in-flight async check is never reported as settled.
pub fn aggregate(own: Status, disabled: bool, children: impl IntoIterator<Item = Status>) -> Status {
    if disabled {
        return Status::Disabled;
    }

    let own = if own == Status::Disabled {
        Status::Valid
    } else {
        own
    };
    children
        .into_iter()
        .filter(|status| *status != Status::Disabled)
        .fold(own, |current, child| {
            if child.precedence() > current.precedence() {
                child
            } else {
                current
            }
        })
}

/// What a submit action may do with the tree right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitGate {
    Ready,
    Pending,
    Blocked,
}

impl From<Status> for SubmitGate {
    fn from(status: Status) -> Self {
        match status {
            Status::Valid => SubmitGate::Ready,
            Status::Pending => SubmitGate::Pending,
            Status::Invalid | Status::Disabled => SubmitGate::Blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_beats_invalid_beats_valid() {
        assert_eq!(
            aggregate(Status::Valid, false, [Status::Invalid, Status::Pending]),
            Status::Pending
        );
        assert_eq!(
            aggregate(Status::Valid, false, [Status::Valid, Status::Invalid]),
            Status::Invalid
        );
        assert_eq!(
            aggregate(Status::Pending, false, [Status::Invalid]),
            Status::Pending
        );
        assert_eq!(aggregate(Status::Valid, false, []), Status::Valid);
    }

    #[test]
    fn disabled_children_do_not_contribute() {
        assert_eq!(
            aggregate(Status::Valid, false, [Status::Disabled, Status::Valid]),
            Status::Valid
        );
        assert_eq!(
            aggregate(Status::Invalid, true, [Status::Pending]),
            Status::Disabled
        );
    }

    #[test]
    fn submit_gate_distinguishes_pending() {
        assert_eq!(SubmitGate::from(Status::Valid), SubmitGate::Ready);
        assert_eq!(SubmitGate::from(Status::Pending), SubmitGate::Pending);
        assert_eq!(SubmitGate::from(Status::Invalid), SubmitGate::Blocked);
        assert_eq!(SubmitGate::from(Status::Disabled), SubmitGate::Blocked);
    }
}
