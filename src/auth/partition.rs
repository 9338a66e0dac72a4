use crate::core::config::PartitionConfig;
use regex::Regex;

/// Maps a connecting client onto its partition.
///
/// A username of the form `user<sep>partition` wins; otherwise the client id
/// pattern's `partition` group; otherwise the default partition.
#[derive(Debug, Clone)]
pub struct PartitionResolver {
    default_partition: String,
    separator: Option<String>,
    client_id_pattern: Option<Regex>,
}

/// Partition and the username with any partition suffix stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub partition: String,
    pub username: Option<String>,
}

impl PartitionResolver {
    pub fn from_config(cfg: &PartitionConfig) -> Result<Self, regex::Error> {
        let client_id_pattern = cfg
            .client_id_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Self {
            default_partition: cfg.default_partition.clone(),
            separator: cfg.username_separator.clone(),
            client_id_pattern,
        })
    }

    pub fn resolve(&self, username: Option<&str>, client_id: &str) -> Resolved {
        if let (Some(username), Some(sep)) = (username, self.separator.as_deref()) {
            if let Some((user, partition)) = username.rsplit_once(sep) {
                if !user.is_empty() && !partition.is_empty() {
                    return Resolved {
                        partition: partition.to_string(),
                        username: Some(user.to_string()),
                    };
                }
            }
        }
        let from_client_id = self
            .client_id_pattern
            .as_ref()
            .and_then(|re| re.captures(client_id))
            .and_then(|caps| caps.name("partition"))
            .map(|m| m.as_str().to_string())
            .filter(|p| !p.is_empty());
        Resolved {
            partition: from_client_id.unwrap_or_else(|| self.default_partition.clone()),
            username: username.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(pattern: Option<&str>) -> PartitionResolver {
        PartitionResolver::from_config(&PartitionConfig {
            default_partition: "default".into(),
            username_separator: Some("@".into()),
            client_id_pattern: pattern.map(str::to_string),
        })
        .unwrap()
    }

    #[test]
    fn username_suffix_selects_partition() {
        let r = resolver(None).resolve(Some("alice@p1"), "dev1");
        assert_eq!(r.partition, "p1");
        assert_eq!(r.username.as_deref(), Some("alice"));
    }

    #[test]
    fn client_id_pattern_then_default() {
        let resolver = resolver(Some(r"^(?P<partition>[a-z0-9]+)\.(.+)$"));
        let r = resolver.resolve(Some("bob"), "acme.sensor-1");
        assert_eq!(r.partition, "acme");
        assert_eq!(r.username.as_deref(), Some("bob"));
        let r = resolver.resolve(None, "sensor-1");
        assert_eq!(r.partition, "default");
    }

    #[test]
    fn dangling_separator_is_ignored() {
        let r = resolver(None).resolve(Some("alice@"), "dev1");
        assert_eq!(r.partition, "default");
        assert_eq!(r.username.as_deref(), Some("alice@"));
    }
}
