//! The `(fingerprint, startRange, endRange?)` triple that addresses a
//! cached segment in both tiers (spec §3 "Segment key").

use crate::key::Fingerprint;

#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub struct SegmentKey {
    pub fingerprint: Fingerprint,
    pub start_range: u64,
    pub end_range: Option<u64>,
}

impl SegmentKey {
    pub fn new(fingerprint: impl Into<Fingerprint>, start_range: u64, end_range: Option<u64>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            start_range,
            end_range,
        }
    }

    /// The literal on-disk filename component for this key: `<start>-<end-or-empty>`.
    pub fn file_name(&self) -> String {
        match self.end_range {
            Some(end) => format!("{}-{}", self.start_range, end),
            None => format!("{}-", self.start_range),
        }
    }
}

impl std::fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.fingerprint, self.file_name())
    }
}
