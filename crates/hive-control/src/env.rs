use std::{collections::BTreeMap, fmt};

use crate::registry::InstanceLayout;

/// Host variables a child may inherit; everything else is cleared.
const PASSTHROUGH_VARS: &[&str] = &["PATH", "LANG", "LC_ALL", "TZ", "SSL_CERT_FILE", "SSL_CERT_DIR"];

#[derive(Clone, PartialEq, Eq)]
struct EnvValue {
    value: String,
    secret: bool,
}

/// The complete environment of one instance process.
///
/// Secret values are redacted from `Debug` and `redacted()`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InstanceEnv {
    vars: BTreeMap<String, EnvValue>,
}

impl InstanceEnv {
    /// `{PREFIX}_DATA_DIR`, `{PREFIX}_DB_PATH`, `{PREFIX}_PORT`, `{PREFIX}_HOST`
    /// plus the generic `PORT`/`HOST` most servers read.
    pub fn base(prefix: &str, layout: &InstanceLayout, port: u16, host: &str) -> Self {
        let mut env = Self::default();
        env.set(
            format!("{prefix}_DATA_DIR"),
            layout.root.display().to_string(),
        );
        env.set(
            format!("{prefix}_DB_PATH"),
            layout.db_path().display().to_string(),
        );
        env.set(format!("{prefix}_PORT"), port.to_string());
        env.set(format!("{prefix}_HOST"), host.to_string());
        env.set("PORT", port.to_string());
        env.set("HOST", host.to_string());
        env
    }

    pub fn with_host_passthrough(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for key in PASSTHROUGH_VARS {
            if let Some(v) = lookup(key) {
                self.vars.entry(key.to_string()).or_insert(EnvValue {
                    value: v,
                    secret: false,
                });
            }
        }
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(
            name.into(),
            EnvValue {
                value: value.into(),
                secret: false,
            },
        );
    }

    pub fn set_secret(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(
            name.into(),
            EnvValue {
                value: value.into(),
                secret: true,
            },
        );
    }

    pub fn extend(&mut self, other: InstanceEnv) {
        self.vars.extend(other.vars);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|v| v.value.as_str())
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.vars.get(name).is_some_and(|v| v.secret)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.value.as_str()))
    }

    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .map(|(k, v)| {
                let shown = if v.secret {
                    "<redacted>".to_string()
                } else {
                    v.value.clone()
                };
                (k.clone(), shown)
            })
            .collect()
    }
}

impl fmt::Debug for InstanceEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.redacted()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn base_vars_point_into_instance_tree() {
        let layout = InstanceLayout::new(Path::new("/data/abc"));
        let env = InstanceEnv::base("INSTANCE", &layout, 18100, "127.0.0.1");
        assert_eq!(env.get("INSTANCE_DATA_DIR"), Some("/data/abc"));
        assert_eq!(env.get("INSTANCE_DB_PATH"), Some("/data/abc/db/app.db"));
        assert_eq!(env.get("INSTANCE_PORT"), Some("18100"));
        assert_eq!(env.get("INSTANCE_HOST"), Some("127.0.0.1"));
        assert_eq!(env.get("PORT"), Some("18100"));
    }

    #[test]
    fn secrets_never_show_in_debug() {
        let mut env = InstanceEnv::default();
        env.set_secret("ANTHROPIC_API_KEY", "sk-secret");
        env.set("CLAUDE_CONFIG_DIR", "/data/abc/ai-agents/claude-code");
        let dbg = format!("{env:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
        assert!(dbg.contains("/data/abc/ai-agents/claude-code"));
        assert_eq!(env.get("ANTHROPIC_API_KEY"), Some("sk-secret"));
    }

    #[test]
    fn passthrough_keeps_explicit_values() {
        let layout = InstanceLayout::new(Path::new("/d"));
        let env = InstanceEnv::base("APP", &layout, 1, "h").with_host_passthrough(|k| match k {
            "PATH" => Some("/usr/bin".to_string()),
            "HOME" => Some("/root".to_string()),
            _ => None,
        });
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
        assert_eq!(env.get("HOME"), None);
    }
}
