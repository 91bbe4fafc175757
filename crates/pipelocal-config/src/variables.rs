//! Variable resolution for image credentials and container environments.
//!
//! Two reference forms are supported:
//! - `${NAME}` anywhere in a value is replaced by the variable's value
//! - a value starting with `$NAME` is replaced entirely by the variable's value
//!
//! Unknown names resolve to the empty string. Resolution always returns new
//! values and never modifies its input.

use pipelocal_core::pipeline::{AwsAuth, Image};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

// Regex for matching ${NAME} references
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{(\w+)\}").unwrap());

/// Resolves variable references against a fixed set of values.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    values: HashMap<String, String>,
}

impl VariableResolver {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    fn lookup(&self, name: &str) -> String {
        self.values.get(name).cloned().unwrap_or_default()
    }

    /// Resolve all references in a single value.
    pub fn resolve(&self, input: &str) -> String {
        let replaced = VAR_REGEX.replace_all(input, |caps: &regex::Captures| self.lookup(&caps[1]));
        match replaced.strip_prefix('$') {
            Some(name) => self.lookup(name),
            None => replaced.into_owned(),
        }
    }

    fn resolve_opt(&self, input: &Option<String>) -> Option<String> {
        input.as_deref().map(|value| self.resolve(value))
    }

    /// Resolve the name and every credential field of an image.
    pub fn resolve_image(&self, image: &Image) -> Image {
        Image {
            name: self.resolve(&image.name),
            username: self.resolve_opt(&image.username),
            password: self.resolve_opt(&image.password),
            run_as_user: image.run_as_user,
            aws: image.aws.as_ref().map(|aws| AwsAuth {
                access_key: self.resolve_opt(&aws.access_key),
                secret_key: self.resolve_opt(&aws.secret_key),
                oidc_role: self.resolve_opt(&aws.oidc_role),
            }),
        }
    }

    /// Resolve every value of an environment map.
    pub fn resolve_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.resolve(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> VariableResolver {
        let mut values = HashMap::new();
        values.insert("FOO".to_string(), "bar".to_string());
        values.insert("USER".to_string(), "deploy".to_string());
        values.insert("TOKEN".to_string(), "s3cr3t".to_string());
        VariableResolver::new(values)
    }

    #[test]
    fn test_braced_reference() {
        assert_eq!(resolver().resolve("${FOO}"), "bar");
        assert_eq!(resolver().resolve("x-${FOO}-y"), "x-bar-y");
    }

    #[test]
    fn test_missing_reference_is_empty() {
        assert_eq!(resolver().resolve("${MISSING}"), "");
        assert_eq!(resolver().resolve("a${MISSING}b"), "ab");
    }

    #[test]
    fn test_bare_reference_replaces_whole_field() {
        assert_eq!(resolver().resolve("$FOO"), "bar");
        assert_eq!(resolver().resolve("$MISSING"), "");
        assert_eq!(resolver().resolve("$FOO/suffix"), "");
    }

    #[test]
    fn test_plain_values_untouched() {
        assert_eq!(resolver().resolve("postgres:16"), "postgres:16");
        assert_eq!(resolver().resolve("price is 5$"), "price is 5$");
    }

    #[test]
    fn test_multiple_references() {
        assert_eq!(resolver().resolve("${USER}:${TOKEN}"), "deploy:s3cr3t");
    }

    #[test]
    fn test_resolve_image_fields() {
        let image = Image {
            name: "registry.example.com/${FOO}:1".to_string(),
            username: Some("$USER".to_string()),
            password: Some("${TOKEN}".to_string()),
            run_as_user: Some(1000),
            aws: Some(AwsAuth {
                access_key: Some("$FOO".to_string()),
                secret_key: Some("${NOPE}".to_string()),
                oidc_role: None,
            }),
        };

        let resolved = resolver().resolve_image(&image);
        assert_eq!(resolved.name, "registry.example.com/bar:1");
        assert_eq!(resolved.username.as_deref(), Some("deploy"));
        assert_eq!(resolved.password.as_deref(), Some("s3cr3t"));
        assert_eq!(resolved.run_as_user, Some(1000));
        let aws = resolved.aws.unwrap();
        assert_eq!(aws.access_key.as_deref(), Some("bar"));
        assert_eq!(aws.secret_key.as_deref(), Some(""));
        assert_eq!(aws.oidc_role, None);

        // Source is left untouched
        assert_eq!(image.username.as_deref(), Some("$USER"));
    }

    #[test]
    fn test_resolve_map() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "${FOO}".to_string());
        env.insert("B".to_string(), "$TOKEN".to_string());
        env.insert("C".to_string(), "literal".to_string());

        let resolved = resolver().resolve_map(&env);
        assert_eq!(resolved["A"], "bar");
        assert_eq!(resolved["B"], "s3cr3t");
        assert_eq!(resolved["C"], "literal");
        assert_eq!(env["A"], "${FOO}");
    }
}
