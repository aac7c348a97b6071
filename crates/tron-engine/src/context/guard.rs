use tron_core::tokens::{estimate_turn_tokens, estimate_turns_tokens};
use tron_core::{Role, Turn};
use tron_settings::ContextSettings;
use tron_store::SessionRecord;

/// Token budget thresholds for one model's context window.
#[derive(Clone, Debug, PartialEq)]
pub struct GuardConfig {
    pub context_window: u32,
    pub reserve_output_tokens: u32,
    pub soft_ratio: f64,
    pub hard_ratio: f64,
    pub target_ratio: f64,
    pub preserve_recent_turns: usize,
    pub large_turn_ratio: f64,
    pub max_escalations: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::from(&ContextSettings::default())
    }
}

impl From<&ContextSettings> for GuardConfig {
    fn from(s: &ContextSettings) -> Self {
        Self {
            context_window: s.context_window,
            reserve_output_tokens: s.reserve_output_tokens,
            soft_ratio: s.soft_ratio,
            hard_ratio: s.hard_ratio,
            target_ratio: s.target_ratio,
            preserve_recent_turns: s.preserve_recent_turns,
            large_turn_ratio: s.large_turn_ratio,
            max_escalations: s.max_escalations,
        }
    }
}

impl GuardConfig {
    /// Tokens available for history once the reply is reserved.
    pub fn budget(&self) -> u32 {
        self.context_window.saturating_sub(self.reserve_output_tokens)
    }

    pub fn soft_limit(&self) -> u32 {
        fraction(self.budget(), self.soft_ratio)
    }

    pub fn hard_limit(&self) -> u32 {
        fraction(self.budget(), self.hard_ratio)
    }

    pub fn target(&self) -> u32 {
        fraction(self.budget(), self.target_ratio)
    }

    pub fn large_turn(&self) -> u32 {
        fraction(self.budget(), self.large_turn_ratio)
    }
}

fn fraction(total: u32, ratio: f64) -> u32 {
    (total as f64 * ratio.clamp(0.0, 1.0)) as u32
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Ok { tokens: u32 },
    /// `urgent` is set at or above the hard limit, where the model call must
    /// not proceed unless compaction succeeds.
    MustCompact { tokens: u32, urgent: bool },
    MustAbort { tokens: u32, limit: u32 },
}

impl Verdict {
    pub fn tokens(&self) -> u32 {
        match *self {
            Self::Ok { tokens } | Self::MustCompact { tokens, .. } | Self::MustAbort { tokens, .. } => tokens,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Whether a model call with this history must not be attempted.
    pub fn blocks_call(&self) -> bool {
        matches!(self, Self::MustCompact { urgent: true, .. } | Self::MustAbort { .. })
    }
}

/// Decides whether history fits the budget and how much of it to fold.
#[derive(Clone, Debug, Default)]
pub struct ContextGuard {
    config: GuardConfig,
}

impl ContextGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn check(&self, record: &SessionRecord) -> Verdict {
        self.check_turns(&record.turns)
    }

    pub fn check_turns(&self, turns: &[Turn]) -> Verdict {
        let tokens = estimate_turns_tokens(turns);
        let hard = self.config.hard_limit();
        if tokens < self.config.soft_limit() {
            Verdict::Ok { tokens }
        } else if tokens < hard {
            Verdict::MustCompact { tokens, urgent: false }
        } else if self.foldable(turns) {
            Verdict::MustCompact { tokens, urgent: true }
        } else {
            Verdict::MustAbort { tokens, limit: hard }
        }
    }

    /// Recent turns kept verbatim at an escalation level: halved per level,
    /// never fewer than one.
    pub fn preserve_for(&self, escalation: u32) -> usize {
        (self.config.preserve_recent_turns >> escalation.min(usize::BITS - 1)).max(1)
    }

    /// Whether any compaction pass, up to the last escalation, could fold
    /// something other than an existing summary.
    pub fn foldable(&self, turns: &[Turn]) -> bool {
        let cutoff = self.plan_cutoff(turns, self.config.max_escalations);
        turns[..cutoff].iter().any(|t| !t.is_summary())
    }

    /// Number of leading turns to fold into a summary.
    ///
    /// Starts from everything outside the preserved window. If what remains
    /// is still above the target and the preserved window holds a turn that
    /// is large relative to the budget, folding extends into the window in
    /// the same pass, leaving at least the newest turn. The cutoff never
    /// separates tool results from the assistant turn that requested them.
    pub fn plan_cutoff(&self, turns: &[Turn], escalation: u32) -> usize {
        let n = turns.len();
        if n <= 1 {
            return 0;
        }
        let preserve = self.preserve_for(escalation).min(n);
        let mut cutoff = n - preserve;

        let large = self.config.large_turn();
        let target = self.config.target();
        let sizes: Vec<u32> = turns.iter().map(estimate_turn_tokens).collect();
        let mut remaining: u32 = sizes[cutoff..].iter().fold(0u32, |acc, t| acc.saturating_add(*t));
        while cutoff < n - 1 && remaining > target && sizes[cutoff..n - 1].iter().any(|&t| t >= large) {
            remaining = remaining.saturating_sub(sizes[cutoff]);
            cutoff += 1;
        }

        align_to_tool_boundary(turns, cutoff)
    }
}

/// Move `cutoff` off any position that would orphan tool results: first
/// backwards so the requesting turn stays preserved, else forwards so the
/// results are folded with it.
fn align_to_tool_boundary(turns: &[Turn], cutoff: usize) -> usize {
    let n = turns.len();
    if cutoff == 0 || cutoff >= n || turns[cutoff].role != Role::Tool {
        return cutoff;
    }
    let mut back = cutoff;
    while back > 0 && turns[back].role == Role::Tool {
        back -= 1;
    }
    if back > 0 {
        return back;
    }
    let mut forward = cutoff;
    while forward < n && turns[forward].role == Role::Tool {
        forward += 1;
    }
    if forward < n {
        forward
    } else {
        0
    }
}
