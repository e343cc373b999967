use serde::{Deserialize, Serialize};

/// User permission policy: three ordered glob lists.
///
/// Precedence (highest first): `deny` > `allow` > `ask` > implicit ask.
/// Glob semantics: `*` matches anything, `ns:*` matches every action in
/// `ns`, anything else is a literal identifier match. An empty policy
/// collapses to implicit ask for every identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub ask: Vec<String>,
}
