//! Queue access policy.

use serde_json::{json, Value};

/// Statement id stamped on the send grant.
pub const SEND_POLICY_SID: &str = "FanbusTopicSend001";

/// Policy granting `sqs:SendMessage` on `queue_arn` only to requests whose
/// source is `topic_arn`.
pub fn queue_send_policy(queue_arn: &str, topic_arn: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": SEND_POLICY_SID,
            "Effect": "Allow",
            "Principal": { "AWS": "*" },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": {
                "ArnEquals": { "aws:SourceArn": topic_arn }
            }
        }]
    })
}
