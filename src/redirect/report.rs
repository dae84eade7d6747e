//! Per-slot outcome accounting for a redirection walk

use std::fmt;

use crate::pe::ImportBinding;

/// What happened at one visited site
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The slot now holds the replacement address
    Redirected {
        binding: ImportBinding,
        slot_rva: u32,
        old_address: usize,
        new_address: usize,
        /// False when the slot's page was left writable after the store
        restored: bool,
    },
    /// No replacement address; the slot keeps its prior value.
    /// `binding` is `None` when the thunk itself did not decode.
    Unresolved {
        binding: Option<ImportBinding>,
        slot_rva: u32,
        thunk_value: usize,
    },
    /// The slot's page refused to become writable; nothing was written
    ProtectionFailed {
        binding: ImportBinding,
        slot_rva: u32,
        code: u32,
    },
    /// Import descriptor for a different provider library, not visited
    SkippedLibrary { library: String },
}

/// Everything one `patch_imports` call did, in walk order.
///
/// The outcome list only ever grows while a walk runs; nothing is retracted
/// when a later entry fails.
#[derive(Debug, Clone)]
pub struct RedirectionReport {
    provider: String,
    outcomes: Vec<Outcome>,
    redirected: usize,
}

impl RedirectionReport {
    pub fn new(provider: &str) -> Self {
        RedirectionReport {
            provider: provider.to_string(),
            outcomes: Vec::new(),
            redirected: 0,
        }
    }

    /// Append one outcome, bumping the redirected tally when it applies
    pub fn record(&mut self, outcome: Outcome) {
        if matches!(outcome, Outcome::Redirected { .. }) {
            self.redirected += 1;
        }
        self.outcomes.push(outcome);
    }

    /// Provider library this walk matched against
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// All outcomes in the order the walk produced them
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Number of slots now holding replacement addresses
    pub fn redirected(&self) -> usize {
        self.redirected
    }

    /// Number of visited slots that had no replacement
    pub fn unresolved(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Unresolved { .. }))
            .count()
    }

    /// Number of slots whose page refused to become writable
    pub fn protection_failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::ProtectionFailed { .. }))
            .count()
    }

    /// Number of import descriptors that belonged to other libraries
    pub fn skipped_libraries(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::SkippedLibrary { .. }))
            .count()
    }

    /// Total slots visited, skipped descriptors not included
    pub fn visited(&self) -> usize {
        self.outcomes.len() - self.skipped_libraries()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl fmt::Display for RedirectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "redirected {} of {} {} imports ({} unresolved, {} protection failures, {} other libraries skipped)",
            self.redirected,
            self.visited(),
            self.provider,
            self.unresolved(),
            self.protection_failures(),
            self.skipped_libraries(),
        )
    }
}
