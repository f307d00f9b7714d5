//! Consumer group membership.

use tracing::info;

use finstream_observability::Counter;

use crate::broker::GroupCreation;

use super::{ConsumerError, StreamConsumer};

/// Per-process member name: `<group>-<pid>` plus `-<suffix>` when configured.
///
/// Distinct processes get distinct names, so the broker spreads entries across
/// them and each one's pending entries stay attributable.
pub fn consumer_name(group: &str, pid: u32, suffix: Option<&str>) -> String {
    match suffix.map(str::trim).filter(|s| !s.is_empty()) {
        Some(suffix) => format!("{}-{}-{}", group, pid, suffix),
        None => format!("{}-{}", group, pid),
    }
}

impl StreamConsumer {
    /// Create the consumer group (and stream) if absent. An existing group is
    /// success.
    pub fn ensure_group(&self) -> Result<GroupCreation, ConsumerError> {
        let s = &self.settings;
        let created = self
            .broker
            .create_group(&s.stream, &s.group, s.start)
            .inspect_err(|_| self.count(Counter::ConsumeErrors))?;

        match created {
            GroupCreation::Created => info!(
                stream = %s.stream,
                group = %s.group,
                start = %s.start.as_arg(),
                "created consumer group"
            ),
            GroupCreation::AlreadyExists => info!(
                stream = %s.stream,
                group = %s.group,
                "consumer group already exists"
            ),
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_includes_pid_and_optional_suffix() {
        assert_eq!(consumer_name("finbot-consumers", 42, None), "finbot-consumers-42");
        assert_eq!(
            consumer_name("finbot-consumers", 42, Some("blue")),
            "finbot-consumers-42-blue"
        );
        assert_eq!(consumer_name("g", 1, Some("  ")), "g-1");
    }
}
