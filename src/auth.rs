//! Expansion Authorization (C8): an in-memory registry of delegated
//! traversal grants, indexed by delegate session key.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{AuthCode, LcmError, LcmResult};
use crate::ids::{ConversationId, GrantId};

const MIN_TTL_MS: i64 = 1_000;
const MAX_TTL_MS: i64 = 900_000;
const DEFAULT_TTL_MS: i64 = 120_000;
const MAX_DEPTH: i64 = 8;
const MAX_TOKEN_CAP: i64 = 20_000;

#[derive(Debug, Clone)]
pub struct Grant {
    pub grant_id: GrantId,
    pub delegator_session_key: String,
    pub delegate_session_key: String,
    pub conversation_ids: Vec<ConversationId>,
    pub max_depth: i64,
    pub max_token_cap: i64,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct IssueGrantInput {
    pub delegator_session_key: String,
    pub delegate_session_key: String,
    pub conversation_ids: Vec<ConversationId>,
    pub max_depth: i64,
    pub max_token_cap: i64,
    pub ttl_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub session_key: Option<String>,
    pub conversation_id: ConversationId,
    pub depth: i64,
    pub token_cap: i64,
}

pub struct ExpansionGrantRegistry {
    grants: Mutex<HashMap<String, Vec<Grant>>>,
}

impl ExpansionGrantRegistry {
    pub fn new() -> Self {
        Self { grants: Mutex::new(HashMap::new()) }
    }

    pub fn issue_grant(&self, input: IssueGrantInput, now_ms: i64) -> LcmResult<Grant> {
        let ttl_ms = input.ttl_ms.unwrap_or(DEFAULT_TTL_MS);
        if !(MIN_TTL_MS..=MAX_TTL_MS).contains(&ttl_ms) {
            return Err(LcmError::validation(format!("ttl_ms must be in [{MIN_TTL_MS}, {MAX_TTL_MS}], got {ttl_ms}")));
        }
        if !(0..=MAX_DEPTH).contains(&input.max_depth) {
            return Err(LcmError::validation(format!("max_depth must be in [0, {MAX_DEPTH}]")));
        }
        if !(1..=MAX_TOKEN_CAP).contains(&input.max_token_cap) {
            return Err(LcmError::validation(format!("max_token_cap must be in [1, {MAX_TOKEN_CAP}]")));
        }
        if input.conversation_ids.is_empty() {
            return Err(LcmError::validation("conversation_ids must be non-empty"));
        }
        if input.delegator_session_key.is_empty() || input.delegate_session_key.is_empty() {
            return Err(LcmError::validation("session keys must be non-empty"));
        }

        let grant = Grant {
            grant_id: GrantId::derive(&input.delegate_session_key, &input.delegator_session_key, now_ms),
            delegator_session_key: input.delegator_session_key,
            delegate_session_key: input.delegate_session_key.clone(),
            conversation_ids: input.conversation_ids,
            max_depth: input.max_depth,
            max_token_cap: input.max_token_cap,
            issued_at_ms: now_ms,
            expires_at_ms: now_ms + ttl_ms,
        };

        self.grants.lock().entry(input.delegate_session_key).or_default().push(grant.clone());
        Ok(grant)
    }

    pub fn revoke_session(&self, session_key: &str) {
        self.grants.lock().remove(session_key);
    }

    /// `None` means main-agent bypass: no session key supplied, or the
    /// session never held a grant. `Some(Ok(grant))` is the first passing
    /// grant; `Some(Err(_))` is the last failure among attempted grants.
    pub fn authorize(&self, request: &AuthorizeRequest, now_ms: i64) -> LcmResult<Option<Grant>> {
        let Some(session_key) = &request.session_key else {
            return Ok(None);
        };

        let mut had_expired = false;
        let active: Vec<Grant> = {
            let mut grants = self.grants.lock();
            match grants.get_mut(session_key) {
                Some(entries) => {
                    let before = entries.len();
                    entries.retain(|g| g.expires_at_ms > now_ms);
                    had_expired = entries.len() < before;
                    if entries.is_empty() {
                        grants.remove(session_key);
                    }
                    entries.clone()
                }
                None => Vec::new(),
            }
        };

        if active.is_empty() {
            if had_expired {
                return Err(LcmError::Authorization(AuthCode::Expired));
            }
            return Ok(None);
        }

        let mut last_failure: Option<AuthCode> = None;
        for grant in &active {
            match validate_grant(grant, request) {
                Ok(()) => return Ok(Some(grant.clone())),
                Err(code) => last_failure = Some(code),
            }
        }

        Err(LcmError::Authorization(last_failure.unwrap_or(AuthCode::MissingConversationScope)))
    }
}

impl Default for ExpansionGrantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_grant(grant: &Grant, request: &AuthorizeRequest) -> Result<(), AuthCode> {
    if grant.conversation_ids.is_empty() {
        return Err(AuthCode::MissingConversationScope);
    }
    if !grant.conversation_ids.contains(&request.conversation_id) {
        return Err(AuthCode::ConversationOutOfScope);
    }
    if request.depth > grant.max_depth {
        return Err(AuthCode::DepthExceeded);
    }
    if request.token_cap > grant.max_token_cap {
        return Err(AuthCode::TokenCapExceeded);
    }
    Ok(())
}
