//! Operator instruction queue.
//!
//! Instructions injected from the control surface wait here until the
//! driver's next merge boundary, where [`InstructionQueue::dequeue_all`]
//! drains them in priority order and [`format_for_prompt`] renders them into
//! the working context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Queue depth above which every enqueue logs a warning.
pub const DEFAULT_QUEUE_WARN_THRESHOLD: usize = 50;

// ============================================================================
// Instruction ID
// ============================================================================

/// Unique identifier for a queued instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstructionId(String);

impl InstructionId {
    /// Create a new random instruction ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for display.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl Default for InstructionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Instruction Type / Priority
// ============================================================================

/// Kind of operator instruction. Declaration order is section order in the
/// merge block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionType {
    UserInput,
    PlanUpdate,
    Constraint,
    Clarification,
    AcceptanceCriteria,
}

impl InstructionType {
    /// All types in section order.
    pub const ALL: [InstructionType; 5] = [
        InstructionType::UserInput,
        InstructionType::PlanUpdate,
        InstructionType::Constraint,
        InstructionType::Clarification,
        InstructionType::AcceptanceCriteria,
    ];

    /// Section heading used in the merge block.
    #[must_use]
    pub fn heading(self) -> &'static str {
        match self {
            InstructionType::UserInput => "USER_INPUT",
            InstructionType::PlanUpdate => "PLAN_UPDATE",
            InstructionType::Constraint => "CONSTRAINT",
            InstructionType::Clarification => "CLARIFICATION",
            InstructionType::AcceptanceCriteria => "ACCEPTANCE_CRITERIA",
        }
    }
}

impl fmt::Display for InstructionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstructionType::UserInput => "user_input",
            InstructionType::PlanUpdate => "plan_update",
            InstructionType::Constraint => "constraint",
            InstructionType::Clarification => "clarification",
            InstructionType::AcceptanceCriteria => "acceptance_criteria",
        };
        write!(f, "{s}")
    }
}

/// Instruction priority. Ordering is `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Error returned when parsing an unknown priority name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePriorityError(pub String);

impl fmt::Display for ParsePriorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown priority '{}' (expected critical, high, normal or low)",
            self.0
        )
    }
}

impl std::error::Error for ParsePriorityError {}

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(ParsePriorityError(other.to_string())),
        }
    }
}

// ============================================================================
// Instruction
// ============================================================================

/// An operator instruction waiting for the next merge boundary.
///
/// Immutable once queued; consumed exactly once by `dequeue_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstructionId,
    #[serde(rename = "type")]
    pub kind: InstructionType,
    pub priority: Priority,
    pub content: String,
    pub queued_at: DateTime<Utc>,
    /// Enqueue sequence number; breaks ties between equal timestamps.
    #[serde(default)]
    pub seq: u64,
}

impl Instruction {
    /// Create an unqueued instruction stamped with the current time.
    #[must_use]
    pub fn new(content: impl Into<String>, kind: InstructionType, priority: Priority) -> Self {
        Self {
            id: InstructionId::new(),
            kind,
            priority,
            content: content.into(),
            queued_at: Utc::now(),
            seq: 0,
        }
    }

    /// Sort key: priority descending, then `queued_at` ascending, then `seq`.
    fn merge_order(a: &Instruction, b: &Instruction) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.queued_at.cmp(&b.queued_at))
            .then_with(|| a.seq.cmp(&b.seq))
    }
}

/// Sort instructions into merge order in place.
pub fn sort_for_merge(instructions: &mut [Instruction]) {
    instructions.sort_by(Instruction::merge_order);
}

// ============================================================================
// Instruction Queue
// ============================================================================

/// Thread-safe instruction queue guarded by its own mutex.
#[derive(Debug)]
pub struct InstructionQueue {
    items: Mutex<Vec<Instruction>>,
    next_seq: AtomicU64,
    warn_threshold: usize,
}

impl Default for InstructionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_WARN_THRESHOLD)
    }
}

impl InstructionQueue {
    /// Create an empty queue that warns above `warn_threshold` entries.
    #[must_use]
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            warn_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Instruction>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timestamp and store a new instruction. Returns the stored instruction.
    pub fn enqueue(
        &self,
        content: impl Into<String>,
        kind: InstructionType,
        priority: Priority,
    ) -> Instruction {
        let instruction = Instruction {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            ..Instruction::new(content, kind, priority)
        };
        self.push(instruction.clone());
        instruction
    }

    /// Re-queue an instruction recovered from a checkpoint, keeping its
    /// original timestamp and priority.
    pub fn restore(&self, mut instruction: Instruction) {
        instruction.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.push(instruction);
    }

    fn push(&self, instruction: Instruction) {
        let depth = {
            let mut items = self.lock();
            items.push(instruction.clone());
            items.len()
        };

        debug!(
            id = %instruction.id.short(),
            kind = %instruction.kind,
            priority = %instruction.priority,
            depth,
            "Instruction queued"
        );

        if depth > self.warn_threshold {
            warn!(
                depth,
                threshold = self.warn_threshold,
                "Instruction queue depth exceeds threshold"
            );
        }
    }

    /// Drain every queued instruction in merge order.
    ///
    /// This is the only consumption path: the queue is emptied under a single
    /// lock acquisition so no instruction can be applied twice.
    pub fn dequeue_all(&self) -> Vec<Instruction> {
        let mut drained = std::mem::take(&mut *self.lock());
        sort_for_merge(&mut drained);
        drained
    }

    /// Copy of the pending instructions in merge order, without consuming them.
    #[must_use]
    pub fn pending(&self) -> Vec<Instruction> {
        let mut items = self.lock().clone();
        sort_for_merge(&mut items);
        items
    }

    /// Number of queued instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ============================================================================
// Prompt formatting
// ============================================================================

/// Heading of the merge block appended to the working context.
pub const MERGE_BLOCK_HEADING: &str = "## Queued Instructions";

/// Render instructions as the merge block appended to the working context.
///
/// Sections appear in [`InstructionType::ALL`] order and only for types with
/// at least one instruction; items are numbered in merge order. Returns an
/// empty string for no instructions.
///
/// # Example
///
/// ```
/// use tether::r#loop::queue::{format_for_prompt, InstructionQueue, InstructionType, Priority};
///
/// let queue = InstructionQueue::default();
/// queue.enqueue("add timeout", InstructionType::UserInput, Priority::Normal);
/// let block = format_for_prompt(&queue.dequeue_all());
/// assert_eq!(block, "## Queued Instructions\n\n### USER_INPUT\n1. add timeout");
/// ```
#[must_use]
pub fn format_for_prompt(instructions: &[Instruction]) -> String {
    if instructions.is_empty() {
        return String::new();
    }

    let mut ordered: Vec<&Instruction> = instructions.iter().collect();
    ordered.sort_by(|a, b| Instruction::merge_order(a, b));

    let mut lines = vec![MERGE_BLOCK_HEADING.to_string()];
    for kind in InstructionType::ALL {
        let section: Vec<&&Instruction> = ordered.iter().filter(|i| i.kind == kind).collect();
        if section.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("### {}", kind.heading()));
        for (n, instruction) in section.iter().enumerate() {
            lines.push(format!("{}. {}", n + 1, instruction.content));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn instruction(content: &str, priority: Priority, offset_ms: i64) -> Instruction {
        Instruction {
            id: InstructionId::new(),
            kind: InstructionType::UserInput,
            priority,
            content: content.to_string(),
            queued_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
                + Duration::milliseconds(offset_ms),
            seq: 0,
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_enqueue_and_len() {
        let queue = InstructionQueue::default();
        assert!(queue.is_empty());
        queue.enqueue("one", InstructionType::UserInput, Priority::Normal);
        queue.enqueue("two", InstructionType::PlanUpdate, Priority::High);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_dequeue_all_empties_queue() {
        let queue = InstructionQueue::default();
        queue.enqueue("one", InstructionType::UserInput, Priority::Normal);
        let drained = queue.dequeue_all();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
        assert!(queue.dequeue_all().is_empty());
    }

    #[test]
    fn test_dequeue_all_priority_then_insertion() {
        let queue = InstructionQueue::default();
        queue.enqueue("low", InstructionType::UserInput, Priority::Low);
        queue.enqueue("critical", InstructionType::UserInput, Priority::Critical);
        queue.enqueue("normal-a", InstructionType::UserInput, Priority::Normal);
        queue.enqueue("normal-b", InstructionType::UserInput, Priority::Normal);

        let contents: Vec<_> = queue
            .dequeue_all()
            .into_iter()
            .map(|i| i.content)
            .collect();
        assert_eq!(contents, vec!["critical", "normal-a", "normal-b", "low"]);
    }

    #[test]
    fn test_priority_outranks_timestamp() {
        let mut items = vec![
            instruction("early-low", Priority::Low, 0),
            instruction("late-critical", Priority::Critical, 5_000),
            instruction("mid-normal", Priority::Normal, 1_000),
        ];
        sort_for_merge(&mut items);
        let contents: Vec<_> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["late-critical", "mid-normal", "early-low"]);
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut items = vec![
            instruction("c", Priority::Normal, 30),
            instruction("a", Priority::High, 10),
            instruction("b", Priority::Normal, 20),
            instruction("d", Priority::Low, 0),
        ];
        sort_for_merge(&mut items);
        let once = format_for_prompt(&items);
        sort_for_merge(&mut items);
        let twice = format_for_prompt(&items);
        assert_eq!(once, twice);

        items.reverse();
        assert_eq!(format_for_prompt(&items), once);
    }

    #[test]
    fn test_pending_does_not_consume() {
        let queue = InstructionQueue::default();
        queue.enqueue("a", InstructionType::Constraint, Priority::Low);
        queue.enqueue("b", InstructionType::Constraint, Priority::High);
        let pending = queue.pending();
        assert_eq!(pending[0].content, "b");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_restore_keeps_timestamp() {
        let queue = InstructionQueue::default();
        let original = instruction("old", Priority::High, 0);
        queue.restore(original.clone());
        let drained = queue.dequeue_all();
        assert_eq!(drained[0].queued_at, original.queued_at);
        assert_eq!(drained[0].id, original.id);
    }

    #[test]
    fn test_format_empty() {
        assert_eq!(format_for_prompt(&[]), "");
    }

    #[test]
    fn test_format_single_user_input() {
        let block = format_for_prompt(&[instruction("add timeout", Priority::Normal, 0)]);
        assert_eq!(block, "## Queued Instructions\n\n### USER_INPUT\n1. add timeout");
        assert!(!block.contains("PLAN_UPDATE"));
    }

    #[test]
    fn test_format_groups_by_type() {
        let queue = InstructionQueue::default();
        queue.enqueue("switch to sqlite", InstructionType::PlanUpdate, Priority::High);
        queue.enqueue("add timeout", InstructionType::UserInput, Priority::Normal);
        queue.enqueue("log retries", InstructionType::UserInput, Priority::Low);

        let block = format_for_prompt(&queue.dequeue_all());
        assert_eq!(
            block,
            "## Queued Instructions\n\n\
             ### USER_INPUT\n\
             1. add timeout\n\
             2. log retries\n\n\
             ### PLAN_UPDATE\n\
             1. switch to sqlite"
        );
    }

    #[test]
    fn test_format_all_sections_in_order() {
        let queue = InstructionQueue::default();
        for kind in InstructionType::ALL.iter().rev() {
            queue.enqueue(kind.to_string(), *kind, Priority::Normal);
        }
        let block = format_for_prompt(&queue.dequeue_all());
        let positions: Vec<usize> = InstructionType::ALL
            .iter()
            .map(|k| block.find(&format!("### {}", k.heading())).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_instruction_serde_uses_type_field() {
        let queue = InstructionQueue::default();
        let queued = queue.enqueue("x", InstructionType::AcceptanceCriteria, Priority::Critical);
        let json = serde_json::to_value(&queued).unwrap();
        assert_eq!(json["type"], "acceptance_criteria");
        assert_eq!(json["priority"], "critical");
    }
}
