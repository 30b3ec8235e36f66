//! Classification of account-lifecycle events.

use serde::{Deserialize, Serialize};

/// Event as delivered by the event source.
pub type RawEvent = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    /// The event refers to an account that is still being created.
    New,
    /// The event names an existing member account.
    Existing,
}

/// Normalized view of one trigger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountEvent {
    pub classification: Classification,
    /// Always set for `Existing`, never for `New`
    pub account_id: Option<String>,
    /// Account-creation request id, used to look the new account up later
    pub creation_request_id: Option<String>,
}

impl AccountEvent {
    pub fn is_new(&self) -> bool {
        self.classification == Classification::New
    }
}

// Only the fields the classifier looks at. Each part is parsed on its own,
// so a malformed sibling never hides a well-formed target.

#[derive(Debug, Deserialize)]
struct Target {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct CreateAccountStatus {
    id: String,
}

/// Existing-account id named by `requestParameters.target`, if well formed.
fn existing_account_id(event: &RawEvent) -> Option<String> {
    let raw = event.get("requestParameters")?.get("target")?;
    let target = Target::deserialize(raw).ok()?;
    (target.kind == "ACCOUNT" && !target.id.is_empty()).then_some(target.id)
}

/// Account-creation request id at `responseElements.createAccountStatus.id`.
fn creation_request_id(event: &RawEvent) -> Option<String> {
    let raw = event.get("responseElements")?.get("createAccountStatus")?;
    let status = CreateAccountStatus::deserialize(raw).ok()?;
    (!status.id.is_empty()).then_some(status.id)
}

/// Classify an organizational event as concerning a new or an existing account.
///
/// An event naming a target of type `ACCOUNT` with a non-empty id is
/// `Existing`. Anything else, malformed events included, is `New`. The event
/// may also arrive wrapped in an envelope under `detail`.
pub fn classify(event: &RawEvent) -> AccountEvent {
    let mut parts = vec![event];
    if let Some(detail) = event.get("detail") {
        parts.push(detail);
    }

    if let Some(account_id) = parts.iter().find_map(|part| existing_account_id(part)) {
        return AccountEvent {
            classification: Classification::Existing,
            account_id: Some(account_id),
            creation_request_id: None,
        };
    }

    AccountEvent {
        classification: Classification::New,
        account_id: None,
        creation_request_id: parts.iter().find_map(|part| creation_request_id(part)),
    }
}
