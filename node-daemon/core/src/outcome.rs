/// The decision returned to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotDecision {
    pub granted: bool,
    pub message: String,
}

/// Terminal states of a single `Wait` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The policy granted a slot.
    Granted,

    /// The pod's controller kind is exempt from throttling.
    Exempt { kind: String },

    /// Another request for the same key is already being processed.
    AlreadyAwaited,

    /// The pod could not be resolved before the deadline.
    PodNotFound,

    /// The policy failed or did not grant a slot before the deadline.
    PolicyTimeout,

    /// The deadline passed while the slot was being granted.
    Cancelled,
}

// === impl Outcome ===

impl Outcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted | Self::Exempt { .. })
    }

    /// A stable label describing failed outcomes, suitable for metrics.
    pub fn failure_reason(&self) -> Option<&'static str> {
        match self {
            Self::Granted | Self::Exempt { .. } => None,
            Self::AlreadyAwaited => Some("already_awaited"),
            Self::PodNotFound => Some("pod_not_found"),
            Self::PolicyTimeout => Some("failed_to_acquire_lock"),
            Self::Cancelled => Some("context_cancelled"),
        }
    }

    pub fn decision(&self, key: &str) -> SlotDecision {
        let message = match self {
            Self::Granted => "Waited successfully".to_string(),
            Self::Exempt { kind } => format!("Skipped {}", kind.to_ascii_lowercase()),
            Self::AlreadyAwaited => format!("Slot {key} already awaited"),
            Self::PodNotFound => "Failed to get pod".to_string(),
            Self::PolicyTimeout => "Failed to acquire lock in time".to_string(),
            Self::Cancelled => "Context cancelled".to_string(),
        };
        SlotDecision {
            granted: self.is_granted(),
            message,
        }
    }
}
