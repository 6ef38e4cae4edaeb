//! Coordination key constructors.
//!
//! Keys are plain colon-delimited strings. The lock store never validates
//! their structure; these helpers only keep call sites from drifting apart.

/// `user:summary:<user_id>`
pub fn user_summary(user_id: &str) -> String {
    format!("user:summary:{user_id}")
}

/// `project:execution:<project_id>`
pub fn project_execution(project_id: &str) -> String {
    format!("project:execution:{project_id}")
}

/// `agent:execution:<agent_id>`
pub fn agent_execution(agent_id: &str) -> String {
    format!("agent:execution:{agent_id}")
}

/// `rate:<scope>:<id>`
pub fn rate(scope: &str, id: &str) -> String {
    format!("rate:{scope}:{id}")
}

/// `<namespace>:<id>`
pub fn custom(namespace: &str, id: &str) -> String {
    format!("{namespace}:{id}")
}
