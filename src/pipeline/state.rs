//! Job stage state machine.

use serde::{Deserialize, Serialize};

/// Stage of a processing job.
///
/// Stages run strictly in declaration order. `Error` is reachable from any
/// non-terminal stage; `Completed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Job record created, nothing fetched yet.
    Initializing,
    /// Fetching messages and consulting the relevance cache.
    FindingEmails,
    /// Extracting candidate applications from relevant messages.
    ParsingEmails,
    /// Producing bounded-length summaries.
    Summarizing,
    /// Inferring application status.
    TrackingStatus,
    /// Merging candidates into the output artifact.
    WritingExcel,
    Completed,
    Error,
}

impl JobStage {
    /// Stages a successful job passes through, in order.
    pub const PIPELINE: [JobStage; 7] = [
        Self::Initializing,
        Self::FindingEmails,
        Self::ParsingEmails,
        Self::Summarizing,
        Self::TrackingStatus,
        Self::WritingExcel,
        Self::Completed,
    ];

    /// Check if this stage allows transitioning to another stage.
    ///
    /// Only the next pipeline stage, or `Error` from any non-terminal stage.
    pub fn can_transition_to(&self, target: JobStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == Self::Error || self.next() == Some(target)
    }

    /// The stage that follows this one on the success path.
    pub fn next(&self) -> Option<JobStage> {
        let idx = Self::PIPELINE.iter().position(|s| s == self)?;
        Self::PIPELINE.get(idx + 1).copied()
    }

    /// Check if this is a terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Progress band `(start, end)` owned by this stage.
    ///
    /// Entering a stage sets progress to at least `start`; per-item
    /// advancement inside the stage stays within `start..=end`.
    pub fn progress_band(&self) -> (u8, u8) {
        match self {
            Self::Initializing => (0, 2),
            Self::FindingEmails => (2, 30),
            Self::ParsingEmails => (30, 55),
            Self::Summarizing => (55, 75),
            Self::TrackingStatus => (75, 90),
            Self::WritingExcel => (90, 99),
            Self::Completed => (100, 100),
            // Error keeps whatever progress the job had reached.
            Self::Error => (0, 100),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::FindingEmails => "finding_emails",
            Self::ParsingEmails => "parsing_emails",
            Self::Summarizing => "summarizing",
            Self::TrackingStatus => "tracking_status",
            Self::WritingExcel => "writing_excel",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "finding_emails" => Ok(Self::FindingEmails),
            "parsing_emails" => Ok(Self::ParsingEmails),
            "summarizing" => Ok(Self::Summarizing),
            "tracking_status" => Ok(Self::TrackingStatus),
            "writing_excel" => Ok(Self::WritingExcel),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown job stage '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_is_strictly_ordered() {
        for pair in JobStage::PIPELINE.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(JobStage::Completed.next(), None);
    }

    #[test]
    fn skipping_is_rejected() {
        assert!(!JobStage::Initializing.can_transition_to(JobStage::ParsingEmails));
        assert!(!JobStage::FindingEmails.can_transition_to(JobStage::Completed));
        assert!(!JobStage::Summarizing.can_transition_to(JobStage::FindingEmails));
    }

    #[test]
    fn error_reachable_from_every_non_terminal() {
        for stage in JobStage::PIPELINE.iter().filter(|s| !s.is_terminal()) {
            assert!(stage.can_transition_to(JobStage::Error));
        }
    }

    #[test]
    fn terminal_stages_have_no_exits() {
        for target in JobStage::PIPELINE {
            assert!(!JobStage::Completed.can_transition_to(target));
            assert!(!JobStage::Error.can_transition_to(target));
        }
        assert!(!JobStage::Completed.can_transition_to(JobStage::Error));
    }

    #[test]
    fn bands_are_contiguous_and_increasing() {
        let mut last_end = 0;
        for stage in JobStage::PIPELINE {
            let (start, end) = stage.progress_band();
            assert!(start >= last_end);
            assert!(end >= start);
            last_end = end;
        }
        assert_eq!(JobStage::Completed.progress_band(), (100, 100));
    }

    #[test]
    fn string_round_trip() {
        for stage in JobStage::PIPELINE.iter().chain([JobStage::Error].iter()) {
            assert_eq!(stage.as_str().parse::<JobStage>().unwrap(), *stage);
        }
        assert!("paused".parse::<JobStage>().is_err());
    }
}
