use std::fmt;

/// Position of the newest post seen for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Watermark {
    /// Empty when nothing was ever observed.
    pub post_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NoChange,
    /// A genuinely new post, subscribers must receive it.
    Deliver,
    /// Bookkeeping moved without anything to deliver.
    AnomalyCorrected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub decision: Decision,
    pub state: Watermark,
}

impl Watermark {
    pub fn new(post_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            post_id: post_id.into(),
            timestamp,
        }
    }
}

impl Decision {
    /// Whether the recorded state changed and must be persisted.
    pub fn changes_state(self) -> bool {
        !matches!(self, Self::NoChange)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoChange => "no-change",
            Self::Deliver => "deliver",
            Self::AnomalyCorrected => "anomaly-corrected",
        })
    }
}

/// Compare the recorded watermark with the head of the feed.
///
/// The recorded timestamp never moves backwards. A head that is not newer
/// than what was recorded still has its ID adopted, so the same item is not
/// reported again on the next cycle.
pub fn classify(current: &Watermark, fetched: &Watermark) -> Classification {
    if fetched.post_id == current.post_id {
        if fetched.timestamp > current.timestamp {
            return Classification {
                decision: Decision::AnomalyCorrected,
                state: fetched.clone(),
            };
        }

        return Classification {
            decision: Decision::NoChange,
            state: current.clone(),
        };
    }

    if fetched.timestamp <= current.timestamp {
        return Classification {
            decision: Decision::AnomalyCorrected,
            state: Watermark::new(fetched.post_id.clone(), current.timestamp),
        };
    }

    Classification {
        decision: Decision::Deliver,
        state: fetched.clone(),
    }
}
