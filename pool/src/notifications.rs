/// Worker notifications
///
/// Payment events are queued on the `notifications` list for an external
/// renderer. A worker's `notify` field (comma separated kinds) decides which
/// kinds it receives; workers without one get the configured defaults.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::shares::storage::{Keys, StoreOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentPasc,
    PaymentPasa,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentPasc => "payment_pasc",
            NotificationKind::PaymentPasa => "payment_pasa",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub worker: String,
    pub kind: NotificationKind,
    pub variables: BTreeMap<String, String>,
    pub time: i64,
}

pub fn wants(preference: Option<&str>, defaults: &[String], kind: NotificationKind) -> bool {
    match preference {
        Some(list) => list.split(',').any(|k| k.trim() == kind.as_str()),
        None => defaults.iter().any(|k| k == kind.as_str()),
    }
}

/// Queue command for a notification, `None` when the worker opted out.
pub fn notification_op(
    keys: &Keys,
    notification: &Notification,
    preference: Option<&str>,
    defaults: &[String],
) -> Result<Option<StoreOp>> {
    if !wants(preference, defaults, notification.kind) {
        return Ok(None);
    }
    let value = serde_json::to_string(notification)
        .map_err(|e| anyhow!("Failed to serialize notification for {}: {}", notification.worker, e))?;
    Ok(Some(StoreOp::RPush { key: keys.notifications(), value }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Vec<String> {
        vec!["payment_pasc".to_string()]
    }

    #[test]
    fn test_preferences() {
        assert!(wants(None, &defaults(), NotificationKind::PaymentPasc));
        assert!(!wants(None, &defaults(), NotificationKind::PaymentPasa));
        assert!(wants(Some("payment_pasc, payment_pasa"), &defaults(), NotificationKind::PaymentPasa));
        assert!(!wants(Some(""), &defaults(), NotificationKind::PaymentPasc));
    }

    #[test]
    fn test_notification_op() {
        let keys = Keys::new("pascal");
        let notification = Notification {
            worker: "77-44.0".into(),
            kind: NotificationKind::PaymentPasc,
            variables: BTreeMap::from([("AMOUNT".to_string(), "4.9999".to_string())]),
            time: 1_700_000_000,
        };
        match notification_op(&keys, &notification, None, &defaults()).unwrap() {
            Some(StoreOp::RPush { key, value }) => {
                assert_eq!(key, "pascal:notifications");
                assert_eq!(
                    value,
                    r#"{"worker":"77-44.0","kind":"payment_pasc","variables":{"AMOUNT":"4.9999"},"time":1700000000}"#
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(notification_op(&keys, &notification, Some("payment_pasa"), &defaults()).unwrap().is_none());
    }
}
