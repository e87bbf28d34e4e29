//! NATS JetStream connection and subject-naming helpers shared by the
//! processor, watch layer, and re-index worker.

/// `audit.>` — durable audit-record stream root.
pub const AUDIT_SUBJECT: &str = "audit.>";
/// `events.>` — durable cluster-event stream root.
pub const EVENT_SUBJECT: &str = "events.>";

/// `activities.{tenantType}.{tenantName}.>` — output subject for published
/// activity records.
pub fn activity_subject(tenant_type: &str, tenant_name: &str) -> String {
    format!("activities.{}.{}.out", tenant_type.to_lowercase(), tenant_name)
}

/// Dead-letter subject a message is routed to once its nack/backoff budget
/// is exhausted.
pub fn dead_letter_subject(source_subject: &str) -> String {
    format!("dead-letter.{source_subject}")
}

pub async fn connect(url: &str) -> Result<async_nats::Client, async_nats::ConnectError> {
    async_nats::connect(url).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_subject_lowercases_tenant_type() {
        assert_eq!(
            activity_subject("Project", "p1"),
            "activities.project.p1.out"
        );
    }

    #[test]
    fn dead_letter_subject_prefixes_source() {
        assert_eq!(dead_letter_subject("audit.p1"), "dead-letter.audit.p1");
    }
}
