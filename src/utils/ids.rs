//! Identifier generation for workflows and checkpoints.
//!
//! Both id families share one shape: a short prefix, a UTC second-resolution
//! timestamp, and eight lowercase hex characters of entropy:
//!
//! ```text
//! wf_20260801_153012_9f3a1c6e
//! ckpt_20260801_153013_04b7d2aa
//! ```
//!
//! The timestamp makes ids sort roughly by creation time in directory
//! listings; the hex suffix keeps them unique. Collisions are still checked
//! at the storage layer before a write is accepted.

use chrono::Utc;
use uuid::Uuid;

const WORKFLOW_PREFIX: &str = "wf";
const CHECKPOINT_PREFIX: &str = "ckpt";

/// Stateless generator for workflow and checkpoint identifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Generate a fresh workflow id (`wf_<utc stamp>_<8 hex>`).
    #[must_use]
    pub fn workflow_id(&self) -> String {
        Self::stamped(WORKFLOW_PREFIX)
    }

    /// Generate a fresh checkpoint id (`ckpt_<utc stamp>_<8 hex>`).
    #[must_use]
    pub fn checkpoint_id(&self) -> String {
        Self::stamped(CHECKPOINT_PREFIX)
    }

    fn stamped(prefix: &str) -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        format!("{prefix}_{stamp}_{suffix}")
    }
}

/// Returns `true` when `id` has the workflow id shape.
#[must_use]
pub fn is_workflow_id(id: &str) -> bool {
    has_shape(id, WORKFLOW_PREFIX)
}

/// Returns `true` when `id` has the checkpoint id shape.
#[must_use]
pub fn is_checkpoint_id(id: &str) -> bool {
    has_shape(id, CHECKPOINT_PREFIX)
}

fn has_shape(id: &str, prefix: &str) -> bool {
    let mut parts = id.splitn(2, '_');
    if parts.next() != Some(prefix) {
        return false;
    }
    let Some(rest) = parts.next() else {
        return false;
    };
    // <yyyymmdd>_<hhmmss>_<8 hex>
    let segments: Vec<&str> = rest.split('_').collect();
    if segments.len() != 3 {
        return false;
    }
    segments[0].len() == 8
        && segments[0].chars().all(|c| c.is_ascii_digit())
        && segments[1].len() == 6
        && segments[1].chars().all(|c| c.is_ascii_digit())
        && segments[2].len() == 8
        && segments[2]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
