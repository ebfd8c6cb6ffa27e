//! Context Resolver: finds the analysis id that names the active conversation.
//!
//! Precedence, first match wins:
//! 1. explicit id
//! 2. route parameter
//! 3. path segments, scanned from the last one backwards
//! 4. navigation state (`analysisId`, `analysis_id`, or `analysis.id`)
//!
//! Only UUID-v4 shaped values count. `None` means the conversation cannot start.

use serde_json::Value;
use uuid::Uuid;

const NAVIGATION_STATE_KEYS: [&str; 2] = ["analysisId", "analysis_id"];

/// Everything the UI knows about where the user is.
#[derive(Debug, Clone, Default)]
pub struct IdentitySources<'a> {
    pub explicit_id: Option<&'a str>,
    pub route_param: Option<&'a str>,
    /// Full location path; query string and fragment are ignored.
    pub path: &'a str,
    pub navigation_state: Option<&'a Value>,
}

impl<'a> IdentitySources<'a> {
    pub fn from_path(path: &'a str) -> Self {
        Self {
            path,
            ..Default::default()
        }
    }

    pub fn with_explicit(explicit_id: &'a str) -> Self {
        Self {
            explicit_id: Some(explicit_id),
            ..Default::default()
        }
    }
}

/// Resolves the identity key, or `None` if no source carries a UUID-v4.
pub fn resolve_identity(sources: &IdentitySources<'_>) -> Option<Uuid> {
    sources
        .explicit_id
        .and_then(parse_uuid_v4)
        .or_else(|| sources.route_param.and_then(parse_uuid_v4))
        .or_else(|| {
            path_segments(sources.path)
                .into_iter()
                .rev()
                .find_map(parse_uuid_v4)
        })
        .or_else(|| sources.navigation_state.and_then(id_from_navigation_state))
}

/// Parses a canonical hyphenated UUID with version 4 and the RFC 4122 variant.
pub fn parse_uuid_v4(raw: &str) -> Option<Uuid> {
    let raw = raw.trim();
    // Uuid::try_parse also accepts simple, braced and urn forms.
    if raw.len() != 36 {
        return None;
    }
    let id = Uuid::try_parse(raw).ok()?;
    (id.get_version_num() == 4 && id.get_variant() == uuid::Variant::RFC4122).then_some(id)
}

pub fn is_uuid_v4(raw: &str) -> bool {
    parse_uuid_v4(raw).is_some()
}

fn path_segments(path: &str) -> Vec<&str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn id_from_navigation_state(state: &Value) -> Option<Uuid> {
    NAVIGATION_STATE_KEYS
        .iter()
        .filter_map(|key| state.get(*key).and_then(Value::as_str))
        .chain(
            state
                .get("analysis")
                .and_then(|a| a.get("id"))
                .and_then(Value::as_str),
        )
        .find_map(parse_uuid_v4)
}
